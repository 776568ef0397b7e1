//! String and blob marshalling across the boundary.
//!
//! Copy-in helpers return an owned [`Handle`] the caller must release after
//! the call that uses it (normally through a [`CallScope`](crate::memory::CallScope)).
//! Decoding borrows engine-owned memory and never frees it.

use crate::engine::{Boundary, ForeignAddr};
use crate::error::Result;
use crate::memory::{self, Handle};

/// Size of the length cell handed to `sv_save_to_memory`.
pub const LENGTH_CELL_BYTES: usize = 4;

/// Copy `text` plus a terminating NUL into fresh foreign memory.
pub fn encode<B: Boundary + ?Sized>(boundary: &mut B, text: &str) -> Result<Handle> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    copy_in(boundary, &bytes)
}

/// Read the NUL-terminated UTF-8 string at `addr`.
///
/// A null address yields `None`; invalid UTF-8 is replaced lossily.
pub fn decode<B: Boundary + ?Sized>(boundary: &B, addr: ForeignAddr) -> Result<Option<String>> {
    if addr.is_null() {
        return Ok(None);
    }
    let bytes = boundary.read_cstr(addr)?;
    Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
}

/// Copy host bytes into fresh foreign memory.
///
/// Empty input still allocates one byte so the engine receives a valid address.
pub fn copy_in<B: Boundary + ?Sized>(boundary: &mut B, bytes: &[u8]) -> Result<Handle> {
    let handle = memory::allocate(boundary, bytes.len().max(1))?;
    if let Err(e) = boundary.write(handle.addr(), bytes) {
        if let Err(free_err) = memory::release(boundary, handle) {
            tracing::warn!("failed to free rejected copy-in block: {}", free_err);
        }
        return Err(e);
    }
    Ok(handle)
}

/// Copy an engine-produced payload out of foreign memory.
///
/// `len_cell` holds the payload length as a `u32`. Both the payload (whose
/// ownership the engine transferred) and the length cell are freed before
/// returning, on every path. A null payload yields `None`, as does a zero length.
pub fn copy_out<B: Boundary + ?Sized>(
    boundary: &mut B,
    payload: ForeignAddr,
    len_cell: Handle,
) -> Result<Option<Vec<u8>>> {
    let len = boundary.read_u32(len_cell.addr()).map(|n| n as usize);
    let payload = Handle::adopt(payload, len.as_ref().map_or(0, |&n| n));
    let bytes = match (len, &payload) {
        (Err(e), _) => Err(e),
        (Ok(0), _) | (Ok(_), None) => Ok(None),
        (Ok(len), Some(block)) => boundary.read(block.addr(), len).map(|b| Some(b.to_vec())),
    };

    let released = memory::release(boundary, len_cell);
    let released = match payload {
        Some(block) => released.and(memory::release(boundary, block)),
        None => released,
    };
    let bytes = bytes?;
    released?;
    Ok(bytes)
}

/// Decode little-endian `i16`s.
pub(crate) fn i16_from_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Decode little-endian `f32`s.
pub(crate) fn f32_from_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Decode little-endian `u32`s.
pub(crate) fn u32_from_le(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode `i16`s little-endian.
pub(crate) fn i16_to_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Encode `f32`s little-endian.
pub(crate) fn f32_to_le(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    #[test]
    fn test_encode_appends_nul() {
        let mut mock = MockEngine::new();
        let handle = encode(&mut mock, "Kicker").unwrap();
        assert_eq!(handle.len(), 7);
        assert_eq!(mock.read(handle.addr(), 7).unwrap(), b"Kicker\0");
        assert_eq!(decode(&mock, handle.addr()).unwrap().as_deref(), Some("Kicker"));
        memory::release(&mut mock, handle).unwrap();
    }

    #[test]
    fn test_decode_null_and_utf8() {
        let mut mock = MockEngine::new();
        assert_eq!(decode(&mock, ForeignAddr::NULL).unwrap(), None);
        let handle = encode(&mut mock, "Fläche ♪").unwrap();
        assert_eq!(decode(&mock, handle.addr()).unwrap().unwrap(), "Fläche ♪");
        memory::release(&mut mock, handle).unwrap();
    }

    #[test]
    fn test_decode_does_not_free() {
        let mut mock = MockEngine::new();
        let handle = encode(&mut mock, "x").unwrap();
        let before = mock.live_allocations();
        decode(&mock, handle.addr()).unwrap();
        assert_eq!(mock.live_allocations(), before);
        memory::release(&mut mock, handle).unwrap();
    }

    #[test]
    fn test_copy_out_round_trip_frees_everything() {
        let mut mock = MockEngine::new();
        let data = vec![9u8, 8, 7, 6, 5];
        let payload = copy_in(&mut mock, &data).unwrap();
        let cell = memory::allocate(&mut mock, LENGTH_CELL_BYTES).unwrap();
        mock.write(cell.addr(), &(data.len() as u32).to_le_bytes()).unwrap();

        // Ownership of the payload moves into copy_out via its address.
        let addr = payload.addr();
        let out = copy_out(&mut mock, addr, cell).unwrap();
        assert_eq!(out, Some(data));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_copy_out_null_payload() {
        let mut mock = MockEngine::new();
        let cell = memory::allocate(&mut mock, LENGTH_CELL_BYTES).unwrap();
        mock.write(cell.addr(), &0u32.to_le_bytes()).unwrap();
        assert_eq!(copy_out(&mut mock, ForeignAddr::NULL, cell).unwrap(), None);
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_copy_out_frees_payload_when_length_unreadable() {
        let mut mock = MockEngine::new();
        let payload = copy_in(&mut mock, &[1, 2, 3]).unwrap();
        let bad_cell = Handle::adopt(ForeignAddr(u32::MAX - 1), LENGTH_CELL_BYTES).unwrap();

        let err = copy_out(&mut mock, payload.addr(), bad_cell).unwrap_err();
        assert!(matches!(err, crate::error::BridgeError::OutOfBounds { .. }));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_sample_codecs() {
        let bytes = i16_to_le(&[-2, 300]);
        assert_eq!(i16_from_le(&bytes), vec![-2, 300]);
        let bytes = f32_to_le(&[0.5, -1.0]);
        assert_eq!(f32_from_le(&bytes), vec![0.5, -1.0]);
        assert_eq!(u32_from_le(&[1, 0, 0, 0, 0, 1, 0, 0]), vec![1, 256]);
    }
}

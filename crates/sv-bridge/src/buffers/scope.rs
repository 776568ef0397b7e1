//! Oscilloscope capture buffer.

use super::FixedBuffer;
use crate::engine::{Boundary, EntryPoint};
use crate::error::{check_status, Result};
use crate::marshal;

/// Samples the scope buffer holds.
pub const SCOPE_CAPACITY: usize = 4096;

/// Lazily allocated `SCOPE_CAPACITY` x `i16` buffer for `sv_get_module_scope2`.
#[derive(Debug)]
pub struct ScopeBuffer {
    buffer: FixedBuffer,
}

impl Default for ScopeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeBuffer {
    /// Create an unallocated buffer.
    pub const fn new() -> Self {
        Self {
            buffer: FixedBuffer::new("scope", SCOPE_CAPACITY * 2),
        }
    }

    /// True once the first read allocated the foreign buffer.
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_allocated()
    }

    /// Capture up to `max_samples` (clamped to [`SCOPE_CAPACITY`]) of a
    /// module channel. The result holds exactly as many samples as the
    /// engine reported, never more than requested.
    pub fn read<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        slot: i32,
        module: i32,
        channel: i32,
        max_samples: usize,
    ) -> Result<Vec<i16>> {
        let requested = max_samples.min(SCOPE_CAPACITY);
        if requested == 0 {
            return Ok(Vec::new());
        }
        let addr = self.buffer.ensure(boundary)?;
        let entry = EntryPoint::GetModuleScope2;
        let reported = boundary.call(entry, &[slot, module, channel, addr.arg(), requested as i32])?;
        let received = (check_status(entry, reported)? as usize).min(requested);
        let bytes = boundary.read(addr, received * 2)?;
        Ok(marshal::i16_from_le(bytes))
    }

    /// Free the foreign buffer. The next read allocates again.
    pub fn release<B: Boundary + ?Sized>(&mut self, boundary: &mut B) -> Result<()> {
        self.buffer.release(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    fn engine() -> MockEngine {
        let mut mock = MockEngine::new();
        mock.call(EntryPoint::OpenSlot, &[0]).unwrap();
        mock
    }

    #[test]
    fn test_request_clamped_to_capacity() {
        let mut mock = engine();
        let mut scope = ScopeBuffer::new();
        let samples = scope.read(&mut mock, 0, 0, 0, 5000).unwrap();
        assert_eq!(samples.len(), SCOPE_CAPACITY);
        assert_eq!(mock.last_args(EntryPoint::GetModuleScope2).unwrap()[4], 4096);
    }

    #[test]
    fn test_short_capture_copies_reported_count() {
        let mut mock = engine();
        mock.set_scope_available(300);
        let mut scope = ScopeBuffer::new();
        let samples = scope.read(&mut mock, 0, 0, 1, 1024).unwrap();
        assert_eq!(samples.len(), 300);
        assert_eq!(samples[0], 10);
        assert_eq!(samples[5], 15);
    }

    #[test]
    fn test_allocated_once() {
        let mut mock = engine();
        let mut scope = ScopeBuffer::new();
        assert!(!scope.is_allocated());
        scope.read(&mut mock, 0, 0, 0, 16).unwrap();
        scope.read(&mut mock, 0, 0, 0, 4096).unwrap();
        assert!(scope.is_allocated());
        assert_eq!(mock.malloc_count(), 1);
        scope.release(&mut mock).unwrap();
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_zero_request_skips_engine() {
        let mut mock = engine();
        let mut scope = ScopeBuffer::new();
        assert!(scope.read(&mut mock, 0, 0, 0, 0).unwrap().is_empty());
        assert_eq!(mock.call_count(EntryPoint::GetModuleScope2), 0);
        assert!(!scope.is_allocated());
    }
}

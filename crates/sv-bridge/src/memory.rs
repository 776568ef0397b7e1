//! Ownership of foreign allocations.
//!
//! A [`Handle`] is the only way the bridge holds memory it allocated in the
//! engine. It cannot be cloned, and [`release`] consumes it, so a region is
//! freed at most once by construction.
//!
//! Per-call temporaries go through [`CallScope`]: everything acquired in a
//! scope is freed when the scope drops, whichever way the call exits.

use crate::engine::{Boundary, EntryPoint, ForeignAddr};
use crate::error::{BridgeError, Result};

/// An owned region of foreign memory.
#[derive(Debug, PartialEq, Eq)]
pub struct Handle {
    addr: ForeignAddr,
    len: usize,
}

impl Handle {
    /// Take ownership of an engine-allocated region.
    ///
    /// Used when an entry point transfers ownership of its return value
    /// (e.g. the save-to-memory payload). Null addresses yield `None`.
    pub fn adopt(addr: ForeignAddr, len: usize) -> Option<Handle> {
        if addr.is_null() {
            None
        } else {
            Some(Handle { addr, len })
        }
    }

    /// Start address
    pub fn addr(&self) -> ForeignAddr {
        self.addr
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-sized regions
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Allocate `bytes` in foreign memory.
///
/// A null address from the foreign allocator is [`BridgeError::Alloc`].
pub fn allocate<B: Boundary + ?Sized>(boundary: &mut B, bytes: usize) -> Result<Handle> {
    let size = u32::try_from(bytes).map_err(|_| BridgeError::Alloc { bytes })?;
    let addr = boundary.malloc(size)?;
    if addr.is_null() {
        tracing::debug!(bytes, "foreign allocation failed");
        return Err(BridgeError::Alloc { bytes });
    }
    Ok(Handle { addr, len: bytes })
}

/// Return a region to the foreign allocator.
pub fn release<B: Boundary + ?Sized>(boundary: &mut B, handle: Handle) -> Result<()> {
    boundary.free(handle.addr)
}

/// Scoped acquisition of per-call temporaries.
///
/// ```rust,ignore
/// let mut scope = CallScope::new(&mut boundary);
/// let name = scope.encode("Output")?;
/// let rv = scope.call(EntryPoint::FindModule, &[slot, name.arg()])?;
/// // `name` is freed here, also when `?` returned early
/// ```
pub struct CallScope<'b, B: Boundary + ?Sized> {
    boundary: &'b mut B,
    held: Vec<Handle>,
}

impl<'b, B: Boundary + ?Sized> CallScope<'b, B> {
    /// Open a scope over `boundary`.
    pub fn new(boundary: &'b mut B) -> Self {
        Self {
            boundary,
            held: Vec::new(),
        }
    }

    /// Allocate an uninitialized temporary.
    pub fn alloc(&mut self, bytes: usize) -> Result<ForeignAddr> {
        let handle = allocate(self.boundary, bytes)?;
        Ok(self.hold(handle))
    }

    /// Encode `text` as a NUL-terminated temporary.
    pub fn encode(&mut self, text: &str) -> Result<ForeignAddr> {
        let handle = crate::marshal::encode(self.boundary, text)?;
        Ok(self.hold(handle))
    }

    /// Copy `bytes` into a temporary.
    pub fn copy_in(&mut self, bytes: &[u8]) -> Result<ForeignAddr> {
        let handle = crate::marshal::copy_in(self.boundary, bytes)?;
        Ok(self.hold(handle))
    }

    /// Invoke an entry point with the scope's temporaries still alive.
    pub fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        self.boundary.call(entry, args)
    }

    /// The underlying boundary.
    pub fn boundary(&mut self) -> &mut B {
        self.boundary
    }

    /// Number of temporaries currently held.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn hold(&mut self, handle: Handle) -> ForeignAddr {
        let addr = handle.addr();
        self.held.push(handle);
        addr
    }
}

impl<B: Boundary + ?Sized> Drop for CallScope<'_, B> {
    fn drop(&mut self) {
        for handle in self.held.drain(..) {
            let addr = handle.addr();
            if let Err(e) = release(self.boundary, handle) {
                tracing::warn!(%addr, "failed to free call temporary: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;

    #[test]
    fn test_allocate_and_release() {
        let mut mock = MockEngine::new();
        let handle = allocate(&mut mock, 64).unwrap();
        assert!(!handle.addr().is_null());
        assert_eq!(handle.len(), 64);
        assert_eq!(mock.live_allocations(), 1);
        release(&mut mock, handle).unwrap();
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_allocate_failure_is_alloc_error() {
        let mut mock = MockEngine::new();
        mock.fail_allocations(true);
        let err = allocate(&mut mock, 8).unwrap_err();
        assert!(matches!(err, BridgeError::Alloc { bytes: 8 }));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_scope_frees_on_drop() {
        let mut mock = MockEngine::new();
        {
            let mut scope = CallScope::new(&mut mock);
            scope.encode("Generator").unwrap();
            scope.copy_in(&[1, 2, 3]).unwrap();
            scope.alloc(4).unwrap();
            assert_eq!(scope.held(), 3);
        }
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_scope_frees_on_early_error() {
        let mut mock = MockEngine::new();
        mock.fail_allocations_after(1);
        let result: Result<()> = (|| {
            let mut scope = CallScope::new(&mut mock);
            scope.encode("first")?;
            scope.encode("second")?;
            Ok(())
        })();
        assert!(matches!(result, Err(BridgeError::Alloc { .. })));
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_adopt_null_is_none() {
        assert!(Handle::adopt(ForeignAddr::NULL, 10).is_none());
        let h = Handle::adopt(ForeignAddr(0x40), 10).unwrap();
        assert_eq!(h.len(), 10);
    }
}

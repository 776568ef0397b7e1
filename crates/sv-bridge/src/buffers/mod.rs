//! Foreign buffers reused across calls.
//!
//! - [`CallbackBuffers`] - output/input audio blocks for the render call,
//!   grown on demand and never shrunk
//! - [`ScopeBuffer`] - fixed oscilloscope capture buffer
//! - [`CurveBuffer`] - fixed curve read/write buffer
//!
//! All of them are owned by one [`Bridge`](crate::Bridge), allocated on first
//! use and released on `deinit` or when the bridge is dropped.

pub mod callback;
pub mod curve;
pub mod scope;

pub use callback::{CallbackBuffers, InputStream, Samples, SamplesMut};
pub use curve::{CurveBuffer, CurveMode, CURVE_CAPACITY};
pub use scope::{ScopeBuffer, SCOPE_CAPACITY};

use crate::engine::{Boundary, ForeignAddr};
use crate::error::Result;
use crate::memory::{self, Handle};

/// A fixed-size foreign buffer allocated on first use.
#[derive(Debug)]
pub(crate) struct FixedBuffer {
    label: &'static str,
    bytes: usize,
    handle: Option<Handle>,
}

impl FixedBuffer {
    pub(crate) const fn new(label: &'static str, bytes: usize) -> Self {
        Self {
            label,
            bytes,
            handle: None,
        }
    }

    /// Address of the buffer, allocating it if needed.
    pub(crate) fn ensure<B: Boundary + ?Sized>(&mut self, boundary: &mut B) -> Result<ForeignAddr> {
        if let Some(handle) = &self.handle {
            return Ok(handle.addr());
        }
        let handle = memory::allocate(boundary, self.bytes)?;
        let addr = handle.addr();
        tracing::debug!(buffer = self.label, bytes = self.bytes, %addr, "allocated buffer");
        self.handle = Some(handle);
        Ok(addr)
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn release<B: Boundary + ?Sized>(&mut self, boundary: &mut B) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                tracing::debug!(buffer = self.label, "released buffer");
                memory::release(boundary, handle)
            }
            None => Ok(()),
        }
    }
}

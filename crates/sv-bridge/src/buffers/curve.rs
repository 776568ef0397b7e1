//! Module curve transfer buffer.

use super::FixedBuffer;
use crate::engine::{Boundary, EntryPoint};
use crate::error::{check_status, Result};
use crate::marshal;

/// Samples the curve buffer holds.
pub const CURVE_CAPACITY: usize = 1024;

/// Direction of a curve transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveMode {
    /// Engine to host
    Read,
    /// Host to engine
    Write,
}

impl CurveMode {
    fn flag(self) -> i32 {
        match self {
            CurveMode::Read => 0,
            CurveMode::Write => 1,
        }
    }
}

/// Lazily allocated `CURVE_CAPACITY` x `f32` buffer for `sv_module_curve`.
#[derive(Debug)]
pub struct CurveBuffer {
    buffer: FixedBuffer,
}

impl Default for CurveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CurveBuffer {
    /// Create an unallocated buffer.
    pub const fn new() -> Self {
        Self {
            buffer: FixedBuffer::new("curve", CURVE_CAPACITY * 4),
        }
    }

    /// True once the first access allocated the foreign buffer.
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_allocated()
    }

    /// Transfer a curve in either direction.
    ///
    /// The transfer length is `len` (or `data.len()` when `None` or zero),
    /// clamped to `data.len()` and [`CURVE_CAPACITY`]. For [`CurveMode::Write`]
    /// `data` is copied in before the call; for [`CurveMode::Read`] the
    /// reported number of values is copied back into `data` after it.
    ///
    /// Returns the number of values the engine processed, clamped to the
    /// transfer length.
    #[allow(clippy::too_many_arguments)]
    pub fn access<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        slot: i32,
        module: i32,
        curve: i32,
        mode: CurveMode,
        data: &mut [f32],
        len: Option<usize>,
    ) -> Result<usize> {
        let len = match len {
            Some(n) if n > 0 => n,
            _ => data.len(),
        };
        let len = len.min(data.len()).min(CURVE_CAPACITY);
        if len == 0 {
            return Ok(0);
        }

        let addr = self.buffer.ensure(boundary)?;
        if mode == CurveMode::Write {
            boundary.write(addr, &marshal::f32_to_le(&data[..len]))?;
        }
        let entry = EntryPoint::ModuleCurve;
        let rv = boundary.call(entry, &[slot, module, curve, addr.arg(), len as i32, mode.flag()])?;
        let processed = (check_status(entry, rv)? as usize).min(len);
        if mode == CurveMode::Read {
            let values = marshal::f32_from_le(boundary.read(addr, processed * 4)?);
            data[..processed].copy_from_slice(&values);
        }
        Ok(processed)
    }

    /// Read up to `len` values of a curve.
    pub fn read<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        slot: i32,
        module: i32,
        curve: i32,
        len: usize,
    ) -> Result<Vec<f32>> {
        let mut data = vec![0.0; len.min(CURVE_CAPACITY)];
        let n = self.access(boundary, slot, module, curve, CurveMode::Read, &mut data, None)?;
        data.truncate(n);
        Ok(data)
    }

    /// Write `data` (or its first `len` values) to a curve.
    pub fn write<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        slot: i32,
        module: i32,
        curve: i32,
        data: &[f32],
        len: Option<usize>,
    ) -> Result<usize> {
        let take = data.len().min(CURVE_CAPACITY);
        let mut staged = data[..take].to_vec();
        self.access(boundary, slot, module, curve, CurveMode::Write, &mut staged, len)
    }

    /// Free the foreign buffer.
    pub fn release<B: Boundary + ?Sized>(&mut self, boundary: &mut B) -> Result<()> {
        self.buffer.release(boundary)
    }
}

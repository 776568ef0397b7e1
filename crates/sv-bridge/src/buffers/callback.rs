//! Render-call buffers.
//!
//! The output block and the optional input block live in foreign memory and
//! are reused across every render call. Growth policy, applied strictly
//! before the engine is invoked:
//!
//! 1. more frames than the current capacity: free both blocks
//! 2. no output block: allocate `frames * frame_bytes`
//! 3. input supplied and the input block is missing or too small:
//!    reallocate it to `frames * input_frame_bytes`
//!
//! Blocks never shrink, so a steady or decreasing frame count allocates
//! nothing after the first call.

use crate::engine::{Boundary, EntryPoint, ForeignAddr};
use crate::error::{check_status, BridgeError, Result};
use crate::flags::{AudioFormat, SampleWidth};
use crate::marshal;
use crate::memory::{self, Handle};

/// Interleaved samples borrowed from the host.
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    /// 16-bit integer samples
    Int16(&'a [i16]),
    /// 32-bit float samples
    Float32(&'a [f32]),
}

impl Samples<'_> {
    /// Element width
    pub fn width(&self) -> SampleWidth {
        match self {
            Samples::Int16(_) => SampleWidth::Int16,
            Samples::Float32(_) => SampleWidth::Float32,
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        match self {
            Samples::Int16(s) => s.len(),
            Samples::Float32(s) => s.len(),
        }
    }

    /// True if there are no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_le_bytes(self, count: usize) -> Vec<u8> {
        match self {
            Samples::Int16(s) => marshal::i16_to_le(&s[..count]),
            Samples::Float32(s) => marshal::f32_to_le(&s[..count]),
        }
    }
}

/// Interleaved host output buffer.
#[derive(Debug)]
pub enum SamplesMut<'a> {
    /// 16-bit integer samples
    Int16(&'a mut [i16]),
    /// 32-bit float samples
    Float32(&'a mut [f32]),
}

impl SamplesMut<'_> {
    /// Element width
    pub fn width(&self) -> SampleWidth {
        match self {
            SamplesMut::Int16(_) => SampleWidth::Int16,
            SamplesMut::Float32(_) => SampleWidth::Float32,
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        match self {
            SamplesMut::Int16(s) => s.len(),
            SamplesMut::Float32(s) => s.len(),
        }
    }

    /// True if there are no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fill_from_le(&mut self, bytes: &[u8]) {
        match self {
            SamplesMut::Int16(s) => {
                let decoded = marshal::i16_from_le(bytes);
                s[..decoded.len()].copy_from_slice(&decoded);
            }
            SamplesMut::Float32(s) => {
                let decoded = marshal::f32_from_le(bytes);
                s[..decoded.len()].copy_from_slice(&decoded);
            }
        }
    }
}

/// Input stream handed to `sv_audio_callback2`.
#[derive(Debug, Clone, Copy)]
pub struct InputStream<'a> {
    /// Interleaved input samples
    pub samples: Samples<'a>,
    /// Input channel count
    pub channels: u32,
}

impl InputStream<'_> {
    fn frame_bytes(&self) -> usize {
        self.samples.width().bytes() * self.channels as usize
    }
}

/// Foreign output/input blocks for the render call.
#[derive(Debug)]
pub struct CallbackBuffers {
    format: AudioFormat,
    capacity_frames: usize,
    output: Option<Handle>,
    input: Option<Handle>,
    allocations: usize,
}

impl CallbackBuffers {
    /// Empty buffers for an engine rendering `format`.
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            capacity_frames: 0,
            output: None,
            input: None,
            allocations: 0,
        }
    }

    /// Output format
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Frames the output block holds
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    /// Bytes per output frame
    pub fn frame_size_bytes(&self) -> usize {
        self.format.frame_bytes()
    }

    /// Size of the input block in bytes (0 if absent)
    pub fn input_bytes(&self) -> usize {
        self.input.as_ref().map_or(0, Handle::len)
    }

    /// Number of foreign allocations performed so far
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Grow the blocks to fit a `frames`-frame call.
    ///
    /// Returns the output and input block addresses (input null if no stream).
    pub fn prepare<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        frames: usize,
        input: Option<&InputStream<'_>>,
    ) -> Result<(ForeignAddr, ForeignAddr)> {
        if frames > self.capacity_frames {
            self.release(boundary)?;
        }

        let output = match &self.output {
            Some(handle) => handle.addr(),
            None => {
                let bytes = frames * self.frame_size_bytes();
                let handle = memory::allocate(boundary, bytes)?;
                tracing::debug!(frames, bytes, addr = %handle.addr(), "allocated output block");
                let addr = handle.addr();
                self.output = Some(handle);
                self.capacity_frames = frames;
                self.allocations += 1;
                addr
            }
        };

        let input_addr = match input {
            None => ForeignAddr::NULL,
            Some(stream) => {
                let needed = frames * stream.frame_bytes();
                match &self.input {
                    Some(handle) if handle.len() >= needed => handle.addr(),
                    _ => {
                        if let Some(old) = self.input.take() {
                            memory::release(boundary, old)?;
                        }
                        let handle = memory::allocate(boundary, needed)?;
                        tracing::debug!(frames, bytes = needed, addr = %handle.addr(), "allocated input block");
                        let addr = handle.addr();
                        self.input = Some(handle);
                        self.allocations += 1;
                        addr
                    }
                }
            }
        };

        Ok((output, input_addr))
    }

    /// Render `frames` frames into `output`, optionally feeding `input`.
    ///
    /// Returns the engine's render status (`0` silence, `1` signal present).
    /// A zero-frame request produces nothing: it returns `0` without
    /// allocating or calling the engine.
    pub fn render<B: Boundary + ?Sized>(
        &mut self,
        boundary: &mut B,
        mut output: SamplesMut<'_>,
        frames: usize,
        latency: i32,
        out_time: u32,
        input: Option<InputStream<'_>>,
    ) -> Result<i32> {
        if output.width() != self.format.sample_width {
            return Err(BridgeError::FormatMismatch {
                expected: self.format.sample_width,
                actual: output.width(),
            });
        }
        let out_samples = frames * self.format.channels as usize;
        if output.len() < out_samples {
            return Err(BridgeError::BufferTooSmall {
                needed: out_samples,
                actual: output.len(),
            });
        }
        let in_samples = input.as_ref().map_or(0, |s| frames * s.channels as usize);
        if let Some(stream) = &input {
            if stream.samples.len() < in_samples {
                return Err(BridgeError::BufferTooSmall {
                    needed: in_samples,
                    actual: stream.samples.len(),
                });
            }
        }
        if frames == 0 {
            tracing::trace!("zero-frame render skipped");
            return Ok(0);
        }

        let (out_addr, in_addr) = self.prepare(boundary, frames, input.as_ref())?;

        let (entry, rv) = match &input {
            Some(stream) => {
                boundary.write(in_addr, &stream.samples.to_le_bytes(in_samples))?;
                let args = [
                    out_addr.arg(),
                    frames as i32,
                    latency,
                    out_time as i32,
                    stream.samples.width().input_type(),
                    stream.channels as i32,
                    in_addr.arg(),
                ];
                let entry = EntryPoint::AudioCallback2;
                (entry, boundary.call(entry, &args)?)
            }
            None => {
                let args = [out_addr.arg(), frames as i32, latency, out_time as i32];
                let entry = EntryPoint::AudioCallback;
                (entry, boundary.call(entry, &args)?)
            }
        };
        let status = check_status(entry, rv)?;

        let bytes = boundary.read(out_addr, out_samples * self.format.sample_width.bytes())?;
        output.fill_from_le(bytes);
        Ok(status)
    }

    /// Free both blocks and reset capacity to zero.
    pub fn release<B: Boundary + ?Sized>(&mut self, boundary: &mut B) -> Result<()> {
        self.capacity_frames = 0;
        let output = self.output.take();
        let input = self.input.take();
        if output.is_some() || input.is_some() {
            tracing::debug!("released callback blocks");
        }
        if let Some(handle) = output {
            memory::release(boundary, handle)?;
        }
        if let Some(handle) = input {
            memory::release(boundary, handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::flags::InitFlags;

    fn engine(flags: InitFlags) -> MockEngine {
        let mut mock = MockEngine::new();
        mock.call(EntryPoint::Init, &[0, 44100, 2, flags.bits() as i32]).unwrap();
        mock
    }

    fn float_stereo() -> AudioFormat {
        AudioFormat::from_init(InitFlags::AUDIO_FLOAT32, 2)
    }

    #[test]
    fn test_growth_is_idempotent() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out = vec![0.0f32; 2 * 1024];

        buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 1024, 0, 0, None)
            .unwrap();
        assert_eq!(buffers.capacity_frames(), 1024);
        assert_eq!(buffers.allocations(), 1);

        for frames in [1024, 512, 1, 1024] {
            buffers
                .render(&mut mock, SamplesMut::Float32(&mut out), frames, 0, 0, None)
                .unwrap();
        }
        assert_eq!(buffers.allocations(), 1);
        assert_eq!(mock.malloc_count(), 1);
    }

    #[test]
    fn test_growth_reallocates_exactly_once() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out = vec![0.0f32; 2 * 4096];
        buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 256, 0, 0, None)
            .unwrap();
        buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 4096, 0, 0, None)
            .unwrap();
        assert_eq!(buffers.capacity_frames(), 4096);
        assert_eq!(buffers.allocations(), 2);
        assert_eq!(mock.live_allocations(), 1);
        buffers.release(&mut mock).unwrap();
        assert_eq!(mock.live_allocations(), 0);
    }

    #[test]
    fn test_output_copied_out() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out = vec![-1.0f32; 8];
        let status = buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 4, 0, 0, None)
            .unwrap();
        assert_eq!(status, 1);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 1.0 / 64.0);
        assert_eq!(out[7], 7.0 / 64.0);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out = vec![0i16; 64];
        let err = buffers
            .render(&mut mock, SamplesMut::Int16(&mut out), 16, 0, 0, None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::FormatMismatch { .. }));
        assert_eq!(mock.call_count(EntryPoint::AudioCallback), 0);
    }

    #[test]
    fn test_short_output_is_rejected() {
        let mut mock = engine(InitFlags::AUDIO_INT16);
        let mut buffers = CallbackBuffers::new(AudioFormat::from_init(InitFlags::AUDIO_INT16, 2));
        let mut out = vec![0i16; 10];
        let err = buffers
            .render(&mut mock, SamplesMut::Int16(&mut out), 16, 0, 0, None)
            .unwrap_err();
        assert!(matches!(err, BridgeError::BufferTooSmall { needed: 32, actual: 10 }));
    }

    #[test]
    fn test_input_passthrough_and_regrowth() {
        let mut mock = engine(InitFlags::AUDIO_INT16);
        let mut buffers = CallbackBuffers::new(AudioFormat::from_init(InitFlags::AUDIO_INT16, 2));
        let mut out = vec![0i16; 2 * 64];

        let mono: Vec<f32> = (0..64).map(|i| i as f32 / 128.0).collect();
        let input = InputStream {
            samples: Samples::Float32(&mono),
            channels: 1,
        };
        buffers
            .render(&mut mock, SamplesMut::Int16(&mut out), 32, 0, 0, Some(input))
            .unwrap();
        assert_eq!(buffers.input_bytes(), 32 * 4);
        // Mono input is duplicated into both output channels.
        assert_eq!(out[2], out[3]);
        assert_eq!(out[2], (32767.0f32 / 128.0).round() as i16);

        // Same frames, wider input: the input block alone is regrown.
        let stereo = vec![0.0f32; 2 * 32];
        let input = InputStream {
            samples: Samples::Float32(&stereo),
            channels: 2,
        };
        buffers
            .render(&mut mock, SamplesMut::Int16(&mut out), 32, 0, 0, Some(input))
            .unwrap();
        assert_eq!(buffers.input_bytes(), 32 * 8);
        assert_eq!(buffers.allocations(), 3);
        assert_eq!(mock.live_allocations(), 2);
    }

    #[test]
    fn test_zero_frames_is_silent_noop() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out: Vec<f32> = Vec::new();
        let status = buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 0, 0, 0, None)
            .unwrap();
        assert_eq!(status, 0);
        assert_eq!(mock.call_count(EntryPoint::AudioCallback), 0);
        assert_eq!(mock.malloc_count(), 0);
        assert_eq!(buffers.capacity_frames(), 0);
    }

    #[test]
    fn test_alloc_failure_skips_engine() {
        let mut mock = engine(InitFlags::AUDIO_FLOAT32);
        mock.fail_allocations(true);
        let mut buffers = CallbackBuffers::new(float_stereo());
        let mut out = vec![0.0f32; 16];
        let err = buffers
            .render(&mut mock, SamplesMut::Float32(&mut out), 8, 0, 0, None)
            .unwrap_err();
        assert_eq!(err.status(), -1);
        assert_eq!(mock.call_count(EntryPoint::AudioCallback), 0);
        assert_eq!(buffers.capacity_frames(), 0);
    }
}

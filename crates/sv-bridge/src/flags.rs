//! Bitfields and constants shared with the engine.
//!
//! All layouts here are bit-exact with the engine's C header; values cross
//! the boundary as plain integers.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Initialization flags passed to `sv_init`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InitFlags(pub(crate) u32);

impl InitFlags {
    /// No flags
    pub const NONE: InitFlags = InitFlags(0);
    /// Suppress the engine's diagnostic output
    pub const NO_DEBUG_OUTPUT: InitFlags = InitFlags(1 << 0);
    /// Sound card interaction is on the host side (render is driven by the host)
    pub const USER_AUDIO_CALLBACK: InitFlags = InitFlags(1 << 1);
    /// Alias of [`InitFlags::USER_AUDIO_CALLBACK`]
    pub const OFFLINE: InitFlags = InitFlags(1 << 1);
    /// 16-bit integer samples
    pub const AUDIO_INT16: InitFlags = InitFlags(1 << 2);
    /// 32-bit float samples
    pub const AUDIO_FLOAT32: InitFlags = InitFlags(1 << 3);
    /// Render and song modification happen on one thread
    pub const ONE_THREAD: InitFlags = InitFlags(1 << 4);

    /// Build from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        InitFlags(bits)
    }

    /// Check if a flag is set
    pub fn contains(&self, other: InitFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Get raw flags
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for InitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        InitFlags(self.0 | rhs.0)
    }
}

/// Module flags returned by `sv_get_module_flags`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModuleFlags(pub(crate) u32);

impl ModuleFlags {
    /// Module slot is occupied
    pub const EXISTS: ModuleFlags = ModuleFlags(1 << 0);
    /// Sound generator
    pub const GENERATOR: ModuleFlags = ModuleFlags(1 << 1);
    /// Effect
    pub const EFFECT: ModuleFlags = ModuleFlags(1 << 2);
    /// Muted
    pub const MUTE: ModuleFlags = ModuleFlags(1 << 3);
    /// Soloed
    pub const SOLO: ModuleFlags = ModuleFlags(1 << 4);
    /// Bypassed
    pub const BYPASS: ModuleFlags = ModuleFlags(1 << 5);

    /// Bit offset of the input count
    pub const INPUTS_OFF: u32 = 16;
    /// Mask of the input count
    pub const INPUTS_MASK: u32 = 255 << Self::INPUTS_OFF;
    /// Bit offset of the output count
    pub const OUTPUTS_OFF: u32 = 16 + 8;
    /// Mask of the output count
    pub const OUTPUTS_MASK: u32 = 255 << Self::OUTPUTS_OFF;

    /// Build from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        ModuleFlags(bits)
    }

    /// Check if a flag is set
    pub fn contains(&self, other: ModuleFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Number of input links
    pub fn inputs(&self) -> usize {
        ((self.0 & Self::INPUTS_MASK) >> Self::INPUTS_OFF) as usize
    }

    /// Number of output links
    pub fn outputs(&self) -> usize {
        ((self.0 & Self::OUTPUTS_MASK) >> Self::OUTPUTS_OFF) as usize
    }

    /// Get raw flags
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for ModuleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        ModuleFlags(self.0 | rhs.0)
    }
}

/// Reserved note values carrying commands instead of pitches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NoteCmd {
    /// Note off
    NoteOff = 128,
    /// Notes of all synths off
    AllNotesOff = 129,
    /// Stop all modules and clear their buffers
    CleanSynths = 130,
    /// Stop playback
    Stop = 131,
    /// Start playback
    Play = 132,
    /// Set pitch from the XXYY column (0x0000 highest, 0x7800 is C0, 0x100 per semitone)
    SetPitch = 133,
    /// Stop one module and clear its buffers
    CleanModule = 140,
}

impl NoteCmd {
    /// Raw note value
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Parse a note byte; `None` for pitches and unknown commands
    pub fn from_note(note: u8) -> Option<Self> {
        match note {
            128 => Some(NoteCmd::NoteOff),
            129 => Some(NoteCmd::AllNotesOff),
            130 => Some(NoteCmd::CleanSynths),
            131 => Some(NoteCmd::Stop),
            132 => Some(NoteCmd::Play),
            133 => Some(NoteCmd::SetPitch),
            140 => Some(NoteCmd::CleanModule),
            _ => None,
        }
    }
}

/// Width of one sample in an audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleWidth {
    /// Signed 16-bit integer
    Int16,
    /// 32-bit float
    Float32,
}

impl SampleWidth {
    /// Bytes per sample
    pub fn bytes(self) -> usize {
        match self {
            SampleWidth::Int16 => 2,
            SampleWidth::Float32 => 4,
        }
    }

    /// Input type code used by `sv_audio_callback2` (0 int16, 1 float32)
    pub fn input_type(self) -> i32 {
        match self {
            SampleWidth::Int16 => 0,
            SampleWidth::Float32 => 1,
        }
    }
}

/// Output format negotiated at init and fixed for the engine's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample width of the output stream
    pub sample_width: SampleWidth,
    /// Interleaved channel count
    pub channels: u32,
}

impl AudioFormat {
    /// Derive from init flags; float output only when `AUDIO_FLOAT32` is set.
    pub fn from_init(flags: InitFlags, channels: u32) -> Self {
        let sample_width = if flags.contains(InitFlags::AUDIO_FLOAT32) {
            SampleWidth::Float32
        } else {
            SampleWidth::Int16
        };
        Self {
            sample_width,
            channels,
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_bytes(&self) -> usize {
        self.sample_width.bytes() * self.channels as usize
    }
}

/// Kind of data produced by `sv_get_time_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TimeMapKind {
    /// Per line: `bpm | tpl << 16`
    Speed = 0,
    /// Per line: frame counter
    FrameCount = 1,
}

/// Pack module coordinates the way `sv_get_module_xy` reports them.
pub fn pack_xy(x: i32, y: i32) -> u32 {
    (x as u32 & 0xFFFF) | ((y as u32 & 0xFFFF) << 16)
}

/// Unpack module coordinates, sign-extending each half.
pub fn unpack_xy(xy: u32) -> (i32, i32) {
    let x = (xy & 0xFFFF) as u16 as i16 as i32;
    let y = ((xy >> 16) & 0xFFFF) as u16 as i16 as i32;
    (x, y)
}

/// Unpack `sv_get_module_finetune`: `(finetune, relative_note)`.
pub fn unpack_finetune(packed: u32) -> (i32, i32) {
    unpack_xy(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_flag_bits() {
        assert_eq!(InitFlags::NO_DEBUG_OUTPUT.bits(), 1);
        assert_eq!(InitFlags::OFFLINE, InitFlags::USER_AUDIO_CALLBACK);
        let flags = InitFlags::OFFLINE | InitFlags::AUDIO_FLOAT32 | InitFlags::ONE_THREAD;
        assert_eq!(flags.bits(), 0b11010);
        assert!(flags.contains(InitFlags::ONE_THREAD));
        assert!(!flags.contains(InitFlags::AUDIO_INT16));
    }

    #[test]
    fn test_module_flag_counts() {
        let flags = ModuleFlags::from_bits(1 | (1 << 2) | (3 << 16) | (2 << 24));
        assert!(flags.contains(ModuleFlags::EXISTS));
        assert!(flags.contains(ModuleFlags::EFFECT));
        assert!(!flags.contains(ModuleFlags::GENERATOR));
        assert_eq!(flags.inputs(), 3);
        assert_eq!(flags.outputs(), 2);
        assert_eq!(ModuleFlags::OUTPUTS_MASK, 0xFF00_0000);
    }

    #[test]
    fn test_note_commands() {
        assert_eq!(NoteCmd::CleanModule.value(), 140);
        assert_eq!(NoteCmd::from_note(133), Some(NoteCmd::SetPitch));
        assert_eq!(NoteCmd::from_note(60), None);
        assert_eq!(NoteCmd::from_note(134), None);
    }

    #[test]
    fn test_audio_format_from_flags() {
        let f = AudioFormat::from_init(InitFlags::AUDIO_FLOAT32, 2);
        assert_eq!(f.sample_width, SampleWidth::Float32);
        assert_eq!(f.frame_bytes(), 8);

        let i = AudioFormat::from_init(InitFlags::AUDIO_INT16, 2);
        assert_eq!(i.frame_bytes(), 4);
        // Neither flag set: int16
        let d = AudioFormat::from_init(InitFlags::NONE, 1);
        assert_eq!(d.sample_width, SampleWidth::Int16);
    }

    #[test]
    fn test_xy_packing_sign_extends() {
        let packed = pack_xy(-5, 700);
        assert_eq!(packed & 0xFFFF, 0xFFFB);
        assert_eq!(unpack_xy(packed), (-5, 700));
        assert_eq!(unpack_xy(pack_xy(512, -512)), (512, -512));
    }
}

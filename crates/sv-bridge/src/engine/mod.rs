//! The engine's entry-point table and the foreign memory it lives in.
//!
//! Everything the bridge does goes through the [`Boundary`] trait: a raw
//! allocator pair, a byte view of foreign memory, and an untyped call into a
//! fixed entry point taking and returning `i32`s.
//!
//! ## Implementations
//!
//! - [`WasmEngine`](crate::wasm::WasmEngine) - engine compiled to WebAssembly,
//!   hosted by wasmtime (feature `wasm`)
//! - `mock::MockEngine` - in-process engine double used by tests (feature `mock`)
//!
//! ## Memory Convention
//!
//! Addresses are `u32` offsets into the engine's linear memory; `0` is null.
//! Multi-byte values are little-endian.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::fmt;

use crate::error::{BridgeError, Result};

/// An address in foreign memory. `0` is the null address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ForeignAddr(pub u32);

impl ForeignAddr {
    /// The null address
    pub const NULL: ForeignAddr = ForeignAddr(0);

    /// Interpret an `i32` returned by the engine as an address.
    pub fn from_ret(value: i32) -> Self {
        ForeignAddr(value as u32)
    }

    /// True for the null address
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The address as an entry-point argument
    pub fn arg(&self) -> i32 {
        self.0 as i32
    }

    /// Address `bytes` further on
    pub fn offset(&self, bytes: usize) -> ForeignAddr {
        ForeignAddr(self.0.wrapping_add(bytes as u32))
    }
}

impl fmt::Display for ForeignAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

macro_rules! entry_points {
    ($( $(#[$meta:meta])* $variant:ident => $name:literal, )*) => {
        /// Fixed entry points exported by the engine.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EntryPoint {
            $( $(#[$meta])* $variant, )*
        }

        impl EntryPoint {
            /// Every entry point, in table order.
            pub const ALL: &'static [EntryPoint] = &[ $( EntryPoint::$variant, )* ];

            /// Export symbol name
            pub fn name(&self) -> &'static str {
                match self {
                    $( EntryPoint::$variant => $name, )*
                }
            }
        }
    };
}

entry_points! {
    /// Global init
    Init => "sv_init",
    /// Global deinit
    Deinit => "sv_deinit",
    /// Current sample rate
    GetSampleRate => "sv_get_sample_rate",
    /// Apply pending input on/off requests
    UpdateInput => "sv_update_input",
    /// Render the next block of output frames
    AudioCallback => "sv_audio_callback",
    /// Render with an input stream
    AudioCallback2 => "sv_audio_callback2",
    /// Open a slot
    OpenSlot => "sv_open_slot",
    /// Close a slot
    CloseSlot => "sv_close_slot",
    /// Lock a slot against the audio thread
    LockSlot => "sv_lock_slot",
    /// Unlock a slot
    UnlockSlot => "sv_unlock_slot",
    /// Load a project from a memory block
    LoadFromMemory => "sv_load_from_memory",
    /// Save a project to an engine-allocated block
    SaveToMemory => "sv_save_to_memory",
    /// Play from the current position
    Play => "sv_play",
    /// Play from line 0
    PlayFromBeginning => "sv_play_from_beginning",
    /// Stop
    Stop => "sv_stop",
    /// Pause the audio stream
    Pause => "sv_pause",
    /// Resume the audio stream
    Resume => "sv_resume",
    /// Resume synchronized with the next sync event
    SyncResume => "sv_sync_resume",
    /// Set autostop mode
    SetAutostop => "sv_set_autostop",
    /// Get autostop mode
    GetAutostop => "sv_get_autostop",
    /// Playback state
    EndOfSong => "sv_end_of_song",
    /// Jump to a line
    Rewind => "sv_rewind",
    /// Set volume (0..=256), returns the previous one
    Volume => "sv_volume",
    /// Set the timestamp of subsequent events
    SetEventT => "sv_set_event_t",
    /// Send an event
    SendEvent => "sv_send_event",
    /// Current line
    GetCurrentLine => "sv_get_current_line",
    /// Current line in 27.5 fixed point
    GetCurrentLine2 => "sv_get_current_line2",
    /// Output level 0..=255
    GetCurrentSignalLevel => "sv_get_current_signal_level",
    /// Project name
    GetSongName => "sv_get_song_name",
    /// Set project name
    SetSongName => "sv_set_song_name",
    /// Beats per minute
    GetSongBpm => "sv_get_song_bpm",
    /// Ticks per line
    GetSongTpl => "sv_get_song_tpl",
    /// Length in frames
    GetSongLengthFrames => "sv_get_song_length_frames",
    /// Length in lines
    GetSongLengthLines => "sv_get_song_length_lines",
    /// Per-line speed or frame map
    GetTimeMap => "sv_get_time_map",
    /// Create a module (lock required)
    NewModule => "sv_new_module",
    /// Remove a module (lock required)
    RemoveModule => "sv_remove_module",
    /// Connect two modules (lock required)
    ConnectModule => "sv_connect_module",
    /// Disconnect two modules (lock required)
    DisconnectModule => "sv_disconnect_module",
    /// Load a module or sample from memory
    LoadModuleFromMemory => "sv_load_module_from_memory",
    /// Load a sample into a sampler
    SamplerLoadFromMemory => "sv_sampler_load_from_memory",
    /// Get or set a sampler parameter
    SamplerPar => "sv_sampler_par",
    /// Load a project into a MetaModule
    MetamoduleLoadFromMemory => "sv_metamodule_load_from_memory",
    /// Load a file into a Vorbis player
    VplayerLoadFromMemory => "sv_vplayer_load_from_memory",
    /// Number of module slots
    GetNumberOfModules => "sv_get_number_of_modules",
    /// Find a module by name
    FindModule => "sv_find_module",
    /// Module flags
    GetModuleFlags => "sv_get_module_flags",
    /// Input link array
    GetModuleInputs => "sv_get_module_inputs",
    /// Output link array
    GetModuleOutputs => "sv_get_module_outputs",
    /// Module type string
    GetModuleType => "sv_get_module_type",
    /// Module name
    GetModuleName => "sv_get_module_name",
    /// Set module name
    SetModuleName => "sv_set_module_name",
    /// Packed module position
    GetModuleXy => "sv_get_module_xy",
    /// Set module position
    SetModuleXy => "sv_set_module_xy",
    /// Module color 0xBBGGRR
    GetModuleColor => "sv_get_module_color",
    /// Set module color
    SetModuleColor => "sv_set_module_color",
    /// Packed finetune and relative note
    GetModuleFinetune => "sv_get_module_finetune",
    /// Set finetune
    SetModuleFinetune => "sv_set_module_finetune",
    /// Set relative note
    SetModuleRelnote => "sv_set_module_relnote",
    /// Read oscilloscope samples
    GetModuleScope2 => "sv_get_module_scope2",
    /// Read or write a module curve
    ModuleCurve => "sv_module_curve",
    /// Number of controllers
    GetNumberOfModuleCtls => "sv_get_number_of_module_ctls",
    /// Controller name
    GetModuleCtlName => "sv_get_module_ctl_name",
    /// Controller value
    GetModuleCtlValue => "sv_get_module_ctl_value",
    /// Set controller value
    SetModuleCtlValue => "sv_set_module_ctl_value",
    /// Controller minimum
    GetModuleCtlMin => "sv_get_module_ctl_min",
    /// Controller maximum
    GetModuleCtlMax => "sv_get_module_ctl_max",
    /// Controller display offset
    GetModuleCtlOffset => "sv_get_module_ctl_offset",
    /// Controller type (0 normal, 1 selector)
    GetModuleCtlType => "sv_get_module_ctl_type",
    /// Controller group
    GetModuleCtlGroup => "sv_get_module_ctl_group",
    /// Create a pattern (lock required)
    NewPattern => "sv_new_pattern",
    /// Remove a pattern (lock required)
    RemovePattern => "sv_remove_pattern",
    /// Number of pattern slots
    GetNumberOfPatterns => "sv_get_number_of_patterns",
    /// Find a pattern by name
    FindPattern => "sv_find_pattern",
    /// Pattern X position (line)
    GetPatternX => "sv_get_pattern_x",
    /// Pattern Y position
    GetPatternY => "sv_get_pattern_y",
    /// Move a pattern (lock required)
    SetPatternXy => "sv_set_pattern_xy",
    /// Pattern track count
    GetPatternTracks => "sv_get_pattern_tracks",
    /// Pattern line count
    GetPatternLines => "sv_get_pattern_lines",
    /// Resize a pattern (lock required)
    SetPatternSize => "sv_set_pattern_size",
    /// Pattern name
    GetPatternName => "sv_get_pattern_name",
    /// Set pattern name (lock required)
    SetPatternName => "sv_set_pattern_name",
    /// Address of the pattern event grid
    GetPatternData => "sv_get_pattern_data",
    /// Write one event
    SetPatternEvent => "sv_set_pattern_event",
    /// Read one event column
    GetPatternEvent => "sv_get_pattern_event",
    /// Mute a pattern (lock required)
    PatternMute => "sv_pattern_mute",
    /// Engine tick counter
    GetTicks => "sv_get_ticks",
    /// Engine ticks per second
    GetTicksPerSecond => "sv_get_ticks_per_second",
    /// Latest log messages
    GetLog => "sv_get_log",
}

impl EntryPoint {
    /// Structural mutations that must run inside `lock_slot`/`unlock_slot`
    /// unless the engine runs in one-thread mode.
    pub fn requires_lock(&self) -> bool {
        matches!(
            self,
            EntryPoint::NewModule
                | EntryPoint::RemoveModule
                | EntryPoint::ConnectModule
                | EntryPoint::DisconnectModule
                | EntryPoint::NewPattern
                | EntryPoint::RemovePattern
                | EntryPoint::SetPatternXy
                | EntryPoint::SetPatternSize
                | EntryPoint::SetPatternName
                | EntryPoint::PatternMute
        )
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Access to an engine living in foreign memory.
///
/// Implementors supply the allocator pair, the raw memory view and the call
/// trampoline; bounds-checked accessors are provided on top.
pub trait Boundary {
    /// Foreign `malloc`. A null return means the foreign allocator is out of memory.
    fn malloc(&mut self, bytes: u32) -> Result<ForeignAddr>;

    /// Foreign `free`.
    fn free(&mut self, addr: ForeignAddr) -> Result<()>;

    /// Invoke an entry point.
    fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32>;

    /// The whole foreign memory region.
    fn memory(&self) -> &[u8];

    /// The whole foreign memory region, mutably.
    fn memory_mut(&mut self) -> &mut [u8];

    /// Borrow `len` bytes at `addr`.
    fn read(&self, addr: ForeignAddr, len: usize) -> Result<&[u8]> {
        let start = addr.0 as usize;
        self.memory()
            .get(start..start.saturating_add(len))
            .ok_or(BridgeError::OutOfBounds { addr: addr.0, len })
    }

    /// Copy `data` to `addr`.
    fn write(&mut self, addr: ForeignAddr, data: &[u8]) -> Result<()> {
        let start = addr.0 as usize;
        let len = data.len();
        self.memory_mut()
            .get_mut(start..start.saturating_add(len))
            .ok_or(BridgeError::OutOfBounds { addr: addr.0, len })?
            .copy_from_slice(data);
        Ok(())
    }

    /// Read a little-endian `u32` at `addr`.
    fn read_u32(&self, addr: ForeignAddr) -> Result<u32> {
        let bytes = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Borrow the NUL-terminated byte string at `addr` (terminator excluded).
    fn read_cstr(&self, addr: ForeignAddr) -> Result<&[u8]> {
        let tail = self
            .memory()
            .get(addr.0 as usize..)
            .ok_or(BridgeError::OutOfBounds { addr: addr.0, len: 1 })?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(BridgeError::OutOfBounds { addr: addr.0, len: tail.len() + 1 })?;
        Ok(&tail[..end])
    }
}

impl<B: Boundary + ?Sized> Boundary for &mut B {
    fn malloc(&mut self, bytes: u32) -> Result<ForeignAddr> {
        (**self).malloc(bytes)
    }

    fn free(&mut self, addr: ForeignAddr) -> Result<()> {
        (**self).free(addr)
    }

    fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        (**self).call(entry, args)
    }

    fn memory(&self) -> &[u8] {
        (**self).memory()
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        (**self).memory_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_names() {
        assert_eq!(EntryPoint::Init.name(), "sv_init");
        assert_eq!(EntryPoint::GetModuleScope2.to_string(), "sv_get_module_scope2");
        assert!(EntryPoint::ALL.iter().all(|e| e.name().starts_with("sv_")));
        assert_eq!(EntryPoint::ALL.len(), 89);
    }

    #[test]
    fn test_lock_required_set() {
        let locked: Vec<_> = EntryPoint::ALL.iter().filter(|e| e.requires_lock()).collect();
        assert_eq!(locked.len(), 10);
        assert!(EntryPoint::PatternMute.requires_lock());
        assert!(EntryPoint::NewPattern.requires_lock());
        assert!(EntryPoint::SetPatternSize.requires_lock());
        assert!(!EntryPoint::GetPatternData.requires_lock());
        assert!(!EntryPoint::SetPatternEvent.requires_lock());
    }

    #[test]
    fn test_foreign_addr() {
        assert!(ForeignAddr::from_ret(0).is_null());
        let a = ForeignAddr::from_ret(0x100);
        assert_eq!(a.offset(8), ForeignAddr(0x108));
        assert_eq!(a.to_string(), "0x100");
    }
}

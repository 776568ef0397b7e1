//! Typed call surface over the engine's entry points.
//!
//! [`Bridge`] owns the [`Boundary`] plus every buffer reused across calls.
//! Each method marshals its arguments into per-call temporaries, invokes one
//! entry point and unmarshals the result; temporaries are freed before the
//! method returns, on every path.
//!
//! ## Return conventions
//!
//! - status-only entry points return `Result<()>`; a negative status is
//!   [`BridgeError::Engine`] carrying the code unmodified
//! - getters return the value, converted to the natural Rust type
//! - `find_*` lookups return `Ok(None)` when nothing matches
//! - engine-owned strings are copied into `String`s and never freed
//!
//! ## Locking
//!
//! Structural mutations (`new_module`, `remove_module`, `connect_module`,
//! `disconnect_module`, `new_pattern`, `remove_pattern`, `set_pattern_xy`,
//! `set_pattern_size`, `set_pattern_name`, `pattern_mute`) must run between
//! `lock_slot` and `unlock_slot` unless the engine was initialized with
//! [`InitFlags::ONE_THREAD`]; the engine rejects them with `-1` otherwise. The bridge does not take the lock for you. It
//! tracks the depth of locks it forwarded and reports unlocked structural
//! calls through `tracing::warn!` and [`Bridge::lock_violations`].
//! [`Bridge::lock`] returns a [`SlotGuard`] that unlocks on drop.
//!
//! ```rust,ignore
//! let mut bridge = Bridge::new(engine);
//! bridge.init(&EngineOptions::offline_float32())?;
//! bridge.open_slot(0)?;
//! {
//!     let mut slot = bridge.lock(0)?;
//!     let gen = slot.new_module(0, "Generator", "Lead", 256, 256, 0)?;
//!     slot.connect_module(0, gen, 0)?;
//! }
//! let mut out = vec![0.0f32; 2 * 1024];
//! bridge.render(SamplesMut::Float32(&mut out), 1024, 0, 0, None)?;
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use crate::buffers::{CallbackBuffers, CurveBuffer, CurveMode, InputStream, SamplesMut, ScopeBuffer};
use crate::config::EngineOptions;
use crate::engine::{Boundary, EntryPoint, ForeignAddr};
use crate::error::{check_status, BridgeError, Result};
use crate::flags::{unpack_finetune, unpack_xy, AudioFormat, InitFlags, ModuleFlags, TimeMapKind};
use crate::marshal::{self, LENGTH_CELL_BYTES};
use crate::memory::{self, CallScope};
use crate::pattern::{EventPatch, EventRecord, LinkView, PatternView, EVENT_BYTES};

/// Host-side facade over one engine instance.
pub struct Bridge<B: Boundary> {
    boundary: B,
    flags: InitFlags,
    callback: Option<CallbackBuffers>,
    scope: ScopeBuffer,
    curve: CurveBuffer,
    lock_depth: HashMap<i32, u32>,
    lock_violations: u64,
}

impl<B: Boundary> Bridge<B> {
    /// Wrap an engine. Nothing is called until [`Bridge::init`].
    pub fn new(boundary: B) -> Self {
        Self {
            boundary,
            flags: InitFlags::NONE,
            callback: None,
            scope: ScopeBuffer::new(),
            curve: CurveBuffer::new(),
            lock_depth: HashMap::new(),
            lock_violations: 0,
        }
    }

    /// The wrapped engine.
    pub fn boundary(&self) -> &B {
        &self.boundary
    }

    /// The wrapped engine, mutably. Calls made through it bypass lock tracking.
    pub fn boundary_mut(&mut self) -> &mut B {
        &mut self.boundary
    }

    /// Output format negotiated at init, `None` before init or after deinit.
    pub fn format(&self) -> Option<AudioFormat> {
        self.callback.as_ref().map(CallbackBuffers::format)
    }

    /// True between a successful `init` and `deinit`.
    pub fn is_initialized(&self) -> bool {
        self.callback.is_some()
    }

    /// Render buffers, once initialized.
    pub fn callback_buffers(&self) -> Option<&CallbackBuffers> {
        self.callback.as_ref()
    }

    /// Structural calls issued without a held slot lock.
    pub fn lock_violations(&self) -> u64 {
        self.lock_violations
    }

    /// Locks currently held on `slot` through this bridge.
    pub fn lock_depth(&self, slot: i32) -> u32 {
        self.lock_depth.get(&slot).copied().unwrap_or(0)
    }

    // ========================================================================
    // Call plumbing
    // ========================================================================

    fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        tracing::trace!(%entry, ?args, "engine call");
        self.boundary.call(entry, args)
    }

    fn call_status(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        let rv = self.call(entry, args)?;
        check_status(entry, rv)
    }

    fn call_unit(&mut self, entry: EntryPoint, args: &[i32]) -> Result<()> {
        self.call_status(entry, args).map(drop)
    }

    fn call_string(&mut self, entry: EntryPoint, args: &[i32]) -> Result<Option<String>> {
        let addr = ForeignAddr::from_ret(self.call(entry, args)?);
        marshal::decode(&self.boundary, addr)
    }

    /// Call with one string argument appended after `args`.
    fn call_with_str(&mut self, entry: EntryPoint, args: &[i32], text: &str) -> Result<i32> {
        tracing::trace!(%entry, ?args, text, "engine call");
        let mut scope = CallScope::new(&mut self.boundary);
        let addr = scope.encode(text)?;
        let mut full = args.to_vec();
        full.push(addr.arg());
        scope.call(entry, &full)
    }

    /// Call with a byte blob spliced in as `(addr, len)` after `head`, then `tail`.
    fn call_with_blob(&mut self, entry: EntryPoint, head: &[i32], data: &[u8], tail: &[i32]) -> Result<i32> {
        tracing::trace!(%entry, ?head, bytes = data.len(), ?tail, "engine call");
        let mut scope = CallScope::new(&mut self.boundary);
        let addr = scope.copy_in(data)?;
        let mut full = head.to_vec();
        full.extend_from_slice(&[addr.arg(), data.len() as i32]);
        full.extend_from_slice(tail);
        scope.call(entry, &full)
    }

    fn check_lock(&mut self, entry: EntryPoint, slot: i32) {
        if !entry.requires_lock() || self.flags.contains(InitFlags::ONE_THREAD) {
            return;
        }
        if self.lock_depth(slot) == 0 {
            self.lock_violations += 1;
            tracing::warn!(slot, %entry, "structural call without holding the slot lock");
        }
    }

    fn release_buffers(&mut self) -> Result<()> {
        if let Some(mut callback) = self.callback.take() {
            callback.release(&mut self.boundary)?;
        }
        self.scope.release(&mut self.boundary)?;
        self.curve.release(&mut self.boundary)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Initialize the engine. Returns the engine version.
    ///
    /// The output format is fixed from `options.flags` until `deinit`.
    pub fn init(&mut self, options: &EngineOptions) -> Result<i32> {
        if self.is_initialized() {
            self.release_buffers()?;
        }
        let args = [
            options.sample_rate as i32,
            options.channels as i32,
            options.flags.bits() as i32,
        ];
        let rv = {
            let mut scope = CallScope::new(&mut self.boundary);
            let config = match &options.config {
                Some(text) => scope.encode(text)?,
                None => ForeignAddr::NULL,
            };
            scope.call(EntryPoint::Init, &[config.arg(), args[0], args[1], args[2]])?
        };
        let version = check_status(EntryPoint::Init, rv)?;

        let format = AudioFormat::from_init(options.flags, options.channels);
        self.flags = options.flags;
        self.callback = Some(CallbackBuffers::new(format));
        tracing::info!(
            version = format_args!("{:#x}", version),
            sample_rate = options.sample_rate,
            channels = options.channels,
            width = ?format.sample_width,
            "engine initialized"
        );
        Ok(version)
    }

    /// Release every reused buffer and shut the engine down.
    pub fn deinit(&mut self) -> Result<()> {
        self.release_buffers()?;
        self.lock_depth.clear();
        self.flags = InitFlags::NONE;
        self.call_unit(EntryPoint::Deinit, &[])?;
        tracing::info!("engine deinitialized");
        Ok(())
    }

    /// Current sample rate.
    pub fn sample_rate(&mut self) -> Result<u32> {
        self.call_status(EntryPoint::GetSampleRate, &[]).map(|v| v as u32)
    }

    /// Apply pending audio input on/off requests.
    pub fn update_input(&mut self) -> Result<()> {
        self.call_unit(EntryPoint::UpdateInput, &[])
    }

    /// Engine tick counter.
    pub fn ticks(&mut self) -> Result<u32> {
        self.call(EntryPoint::GetTicks, &[]).map(|v| v as u32)
    }

    /// Ticks per second.
    pub fn ticks_per_second(&mut self) -> Result<u32> {
        self.call(EntryPoint::GetTicksPerSecond, &[]).map(|v| v as u32)
    }

    /// The last `size` bytes of the engine log.
    pub fn log(&mut self, size: usize) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetLog, &[size as i32])
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    /// Render `frames` interleaved frames into `output`.
    ///
    /// `output` must use the sample width negotiated at init. With `input`
    /// the engine receives an input stream of the given width and channel
    /// count (`sv_audio_callback2`).
    pub fn render(
        &mut self,
        output: SamplesMut<'_>,
        frames: usize,
        latency: i32,
        out_time: u32,
        input: Option<InputStream<'_>>,
    ) -> Result<i32> {
        let Some(callback) = self.callback.as_mut() else {
            return Err(BridgeError::NotInitialized);
        };
        callback.render(&mut self.boundary, output, frames, latency, out_time, input)
    }

    // ========================================================================
    // Slots
    // ========================================================================

    /// Open a slot.
    pub fn open_slot(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::OpenSlot, &[slot])
    }

    /// Close a slot.
    pub fn close_slot(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::CloseSlot, &[slot])?;
        self.lock_depth.remove(&slot);
        Ok(())
    }

    /// Enter the slot's critical section.
    pub fn lock_slot(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::LockSlot, &[slot])?;
        *self.lock_depth.entry(slot).or_insert(0) += 1;
        Ok(())
    }

    /// Leave the slot's critical section.
    pub fn unlock_slot(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::UnlockSlot, &[slot])?;
        if let Some(depth) = self.lock_depth.get_mut(&slot) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                self.lock_depth.remove(&slot);
            }
        }
        Ok(())
    }

    /// Lock `slot` until the returned guard drops.
    pub fn lock(&mut self, slot: i32) -> Result<SlotGuard<'_, B>> {
        self.lock_slot(slot)?;
        Ok(SlotGuard {
            bridge: self,
            slot,
            held: true,
        })
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Load a project from bytes.
    pub fn load(&mut self, slot: i32, data: &[u8]) -> Result<()> {
        let rv = self.call_with_blob(EntryPoint::LoadFromMemory, &[slot], data, &[])?;
        check_status(EntryPoint::LoadFromMemory, rv)?;
        tracing::info!(slot, bytes = data.len(), "project loaded");
        Ok(())
    }

    /// Save the project. `None` if the engine produced nothing.
    pub fn save(&mut self, slot: i32) -> Result<Option<Vec<u8>>> {
        let cell = memory::allocate(&mut self.boundary, LENGTH_CELL_BYTES)?;
        let rv = self
            .boundary
            .write(cell.addr(), &0u32.to_le_bytes())
            .and_then(|()| self.call(EntryPoint::SaveToMemory, &[slot, cell.addr().arg()]));
        let rv = match rv {
            Ok(rv) => rv,
            Err(e) => {
                memory::release(&mut self.boundary, cell)?;
                return Err(e);
            }
        };
        let data = marshal::copy_out(&mut self.boundary, ForeignAddr::from_ret(rv), cell)?;
        tracing::debug!(slot, bytes = data.as_ref().map_or(0, Vec::len), "project saved");
        Ok(data)
    }

    // ========================================================================
    // Playback
    // ========================================================================

    /// Play from the current position.
    pub fn play(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::Play, &[slot])
    }

    /// Play from line 0.
    pub fn play_from_beginning(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::PlayFromBeginning, &[slot])
    }

    /// Stop playback.
    pub fn stop(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::Stop, &[slot])
    }

    /// Pause the slot's audio stream.
    pub fn pause(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::Pause, &[slot])
    }

    /// Resume the slot's audio stream.
    pub fn resume(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::Resume, &[slot])
    }

    /// Resume on the next sync event.
    pub fn sync_resume(&mut self, slot: i32) -> Result<()> {
        self.call_unit(EntryPoint::SyncResume, &[slot])
    }

    /// Stop automatically at the end of the song.
    pub fn set_autostop(&mut self, slot: i32, autostop: bool) -> Result<()> {
        self.call_unit(EntryPoint::SetAutostop, &[slot, autostop as i32])
    }

    /// Autostop mode.
    pub fn autostop(&mut self, slot: i32) -> Result<bool> {
        self.call_status(EntryPoint::GetAutostop, &[slot]).map(|v| v != 0)
    }

    /// True if the slot is not playing.
    pub fn end_of_song(&mut self, slot: i32) -> Result<bool> {
        self.call_status(EntryPoint::EndOfSong, &[slot]).map(|v| v != 0)
    }

    /// Jump to `line`.
    pub fn rewind(&mut self, slot: i32, line: i32) -> Result<()> {
        self.call_unit(EntryPoint::Rewind, &[slot, line])
    }

    /// Set the volume (0..=256) or, with `None`, only query it. Returns the previous volume.
    pub fn volume(&mut self, slot: i32, volume: Option<i32>) -> Result<i32> {
        self.call_status(EntryPoint::Volume, &[slot, volume.unwrap_or(-1)])
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Timestamp subsequent `send_event` calls with `t` (engine ticks), or
    /// with `None` go back to "as soon as possible".
    pub fn set_event_t(&mut self, slot: i32, t: Option<i32>) -> Result<()> {
        let args = match t {
            Some(t) => [slot, 1, t],
            None => [slot, 0, 0],
        };
        self.call_unit(EntryPoint::SetEventT, &args)
    }

    /// Send one event to `track` of the slot's live event stream.
    pub fn send_event(&mut self, slot: i32, track: i32, event: &EventRecord) -> Result<()> {
        self.call_unit(
            EntryPoint::SendEvent,
            &[
                slot,
                track,
                event.note as i32,
                event.velocity as i32,
                event.module as i32,
                event.ctl as i32,
                event.ctl_val as i32,
            ],
        )
    }

    // ========================================================================
    // Song
    // ========================================================================

    /// Current line.
    pub fn current_line(&mut self, slot: i32) -> Result<i32> {
        self.call(EntryPoint::GetCurrentLine, &[slot])
    }

    /// Current line in 27.5 fixed point.
    pub fn current_line2(&mut self, slot: i32) -> Result<i32> {
        self.call(EntryPoint::GetCurrentLine2, &[slot])
    }

    /// Output level of `channel`, 0..=255.
    pub fn current_signal_level(&mut self, slot: i32, channel: i32) -> Result<i32> {
        self.call(EntryPoint::GetCurrentSignalLevel, &[slot, channel])
    }

    /// Project name.
    pub fn song_name(&mut self, slot: i32) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetSongName, &[slot])
    }

    /// Rename the project.
    pub fn set_song_name(&mut self, slot: i32, name: &str) -> Result<()> {
        let rv = self.call_with_str(EntryPoint::SetSongName, &[slot], name)?;
        check_status(EntryPoint::SetSongName, rv).map(drop)
    }

    /// Beats per minute.
    pub fn song_bpm(&mut self, slot: i32) -> Result<i32> {
        self.call(EntryPoint::GetSongBpm, &[slot])
    }

    /// Ticks per line.
    pub fn song_tpl(&mut self, slot: i32) -> Result<i32> {
        self.call(EntryPoint::GetSongTpl, &[slot])
    }

    /// Song length in frames.
    pub fn song_length_frames(&mut self, slot: i32) -> Result<u32> {
        self.call(EntryPoint::GetSongLengthFrames, &[slot]).map(|v| v as u32)
    }

    /// Song length in lines.
    pub fn song_length_lines(&mut self, slot: i32) -> Result<u32> {
        self.call(EntryPoint::GetSongLengthLines, &[slot]).map(|v| v as u32)
    }

    /// Per-line speed or frame map for `len` lines from `start_line`.
    pub fn time_map(&mut self, slot: i32, start_line: i32, len: usize, kind: TimeMapKind) -> Result<Vec<u32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let entry = EntryPoint::GetTimeMap;
        let mut scope = CallScope::new(&mut self.boundary);
        let dest = scope.alloc(len * 4)?;
        let rv = scope.call(entry, &[slot, start_line, len as i32, dest.arg(), kind as i32])?;
        check_status(entry, rv)?;
        let boundary = scope.boundary();
        let bytes = boundary.read(dest, len * 4)?;
        Ok(marshal::u32_from_le(bytes))
    }

    // ========================================================================
    // Modules
    // ========================================================================

    /// Create a module. Requires the slot lock. Returns its number.
    pub fn new_module(&mut self, slot: i32, kind: &str, name: &str, x: i32, y: i32, z: i32) -> Result<i32> {
        let entry = EntryPoint::NewModule;
        self.check_lock(entry, slot);
        let rv = {
            let mut scope = CallScope::new(&mut self.boundary);
            let kind_addr = scope.encode(kind)?;
            let name_addr = scope.encode(name)?;
            scope.call(entry, &[slot, kind_addr.arg(), name_addr.arg(), x, y, z])?
        };
        let module = check_status(entry, rv)?;
        tracing::debug!(slot, module, kind, name, "module created");
        Ok(module)
    }

    /// Remove a module. Requires the slot lock.
    pub fn remove_module(&mut self, slot: i32, module: i32) -> Result<()> {
        self.check_lock(EntryPoint::RemoveModule, slot);
        self.call_unit(EntryPoint::RemoveModule, &[slot, module])
    }

    /// Connect `source` to `destination`. Requires the slot lock.
    pub fn connect_module(&mut self, slot: i32, source: i32, destination: i32) -> Result<()> {
        self.check_lock(EntryPoint::ConnectModule, slot);
        self.call_unit(EntryPoint::ConnectModule, &[slot, source, destination])
    }

    /// Disconnect `source` from `destination`. Requires the slot lock.
    pub fn disconnect_module(&mut self, slot: i32, source: i32, destination: i32) -> Result<()> {
        self.check_lock(EntryPoint::DisconnectModule, slot);
        self.call_unit(EntryPoint::DisconnectModule, &[slot, source, destination])
    }

    /// Load a module (or a sample as a new Sampler) from bytes. Returns its number.
    pub fn load_module(&mut self, slot: i32, data: &[u8], x: i32, y: i32, z: i32) -> Result<i32> {
        let entry = EntryPoint::LoadModuleFromMemory;
        let rv = self.call_with_blob(entry, &[slot], data, &[x, y, z])?;
        let module = check_status(entry, rv)?;
        tracing::info!(slot, module, bytes = data.len(), "module loaded");
        Ok(module)
    }

    /// Load a sample into a Sampler; `sample_slot` `None` replaces the whole instrument.
    pub fn sampler_load(&mut self, slot: i32, module: i32, data: &[u8], sample_slot: Option<i32>) -> Result<()> {
        let entry = EntryPoint::SamplerLoadFromMemory;
        let rv = self.call_with_blob(entry, &[slot, module], data, &[sample_slot.unwrap_or(-1)])?;
        check_status(entry, rv).map(drop)
    }

    /// Read a sampler parameter, or write it when `value` is given.
    pub fn sampler_par(
        &mut self,
        slot: i32,
        module: i32,
        sample_slot: i32,
        par: i32,
        value: Option<i32>,
    ) -> Result<i32> {
        let (value, set) = match value {
            Some(v) => (v, 1),
            None => (0, 0),
        };
        self.call_status(EntryPoint::SamplerPar, &[slot, module, sample_slot, par, value, set])
    }

    /// Load a project into a MetaModule.
    pub fn metamodule_load(&mut self, slot: i32, module: i32, data: &[u8]) -> Result<()> {
        let entry = EntryPoint::MetamoduleLoadFromMemory;
        let rv = self.call_with_blob(entry, &[slot, module], data, &[])?;
        check_status(entry, rv).map(drop)
    }

    /// Load an OGG Vorbis file into a Vorbis player.
    pub fn vplayer_load(&mut self, slot: i32, module: i32, data: &[u8]) -> Result<()> {
        let entry = EntryPoint::VplayerLoadFromMemory;
        let rv = self.call_with_blob(entry, &[slot, module], data, &[])?;
        check_status(entry, rv).map(drop)
    }

    /// Number of module slots (including empty ones).
    pub fn number_of_modules(&mut self, slot: i32) -> Result<usize> {
        self.call_status(EntryPoint::GetNumberOfModules, &[slot]).map(|v| v as usize)
    }

    /// Find a module by name.
    pub fn find_module(&mut self, slot: i32, name: &str) -> Result<Option<i32>> {
        let rv = self.call_with_str(EntryPoint::FindModule, &[slot], name)?;
        Ok((rv >= 0).then_some(rv))
    }

    /// Module flags.
    pub fn module_flags(&mut self, slot: i32, module: i32) -> Result<ModuleFlags> {
        self.call(EntryPoint::GetModuleFlags, &[slot, module])
            .map(|v| ModuleFlags::from_bits(v as u32))
    }

    fn links(&mut self, entry: EntryPoint, slot: i32, module: i32) -> Result<LinkView<'_>> {
        let flags = self.module_flags(slot, module)?;
        let count = match entry {
            EntryPoint::GetModuleInputs => flags.inputs(),
            _ => flags.outputs(),
        };
        let addr = ForeignAddr::from_ret(self.call(entry, &[slot, module])?);
        if addr.is_null() || count == 0 {
            return Ok(LinkView::empty());
        }
        Ok(LinkView::new(self.boundary.read(addr, count * 4)?))
    }

    /// Modules feeding into `module`, viewed in place.
    pub fn module_inputs(&mut self, slot: i32, module: i32) -> Result<LinkView<'_>> {
        self.links(EntryPoint::GetModuleInputs, slot, module)
    }

    /// Modules `module` feeds into, viewed in place.
    pub fn module_outputs(&mut self, slot: i32, module: i32) -> Result<LinkView<'_>> {
        self.links(EntryPoint::GetModuleOutputs, slot, module)
    }

    /// Module type name.
    pub fn module_type(&mut self, slot: i32, module: i32) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetModuleType, &[slot, module])
    }

    /// Module name.
    pub fn module_name(&mut self, slot: i32, module: i32) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetModuleName, &[slot, module])
    }

    /// Rename a module.
    pub fn set_module_name(&mut self, slot: i32, module: i32, name: &str) -> Result<()> {
        let rv = self.call_with_str(EntryPoint::SetModuleName, &[slot, module], name)?;
        check_status(EntryPoint::SetModuleName, rv).map(drop)
    }

    /// Module position.
    pub fn module_xy(&mut self, slot: i32, module: i32) -> Result<(i32, i32)> {
        self.call(EntryPoint::GetModuleXy, &[slot, module])
            .map(|v| unpack_xy(v as u32))
    }

    /// Move a module.
    pub fn set_module_xy(&mut self, slot: i32, module: i32, x: i32, y: i32) -> Result<()> {
        self.call_unit(EntryPoint::SetModuleXy, &[slot, module, x, y])
    }

    /// Module color, `0xBBGGRR`.
    pub fn module_color(&mut self, slot: i32, module: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleColor, &[slot, module])
    }

    /// Set module color.
    pub fn set_module_color(&mut self, slot: i32, module: i32, color: i32) -> Result<()> {
        self.call_unit(EntryPoint::SetModuleColor, &[slot, module, color])
    }

    /// `(finetune, relative_note)`.
    pub fn module_finetune(&mut self, slot: i32, module: i32) -> Result<(i32, i32)> {
        self.call(EntryPoint::GetModuleFinetune, &[slot, module])
            .map(|v| unpack_finetune(v as u32))
    }

    /// Set finetune (-256..=256).
    pub fn set_module_finetune(&mut self, slot: i32, module: i32, finetune: i32) -> Result<()> {
        self.call_unit(EntryPoint::SetModuleFinetune, &[slot, module, finetune])
    }

    /// Set relative note.
    pub fn set_module_relnote(&mut self, slot: i32, module: i32, relnote: i32) -> Result<()> {
        self.call_unit(EntryPoint::SetModuleRelnote, &[slot, module, relnote])
    }

    /// Capture up to `max_samples` oscilloscope samples of a module channel.
    pub fn read_scope(&mut self, slot: i32, module: i32, channel: i32, max_samples: usize) -> Result<Vec<i16>> {
        self.scope.read(&mut self.boundary, slot, module, channel, max_samples)
    }

    /// Transfer a module curve in either direction; see [`CurveBuffer::access`].
    pub fn access_curve(
        &mut self,
        slot: i32,
        module: i32,
        curve: i32,
        mode: CurveMode,
        data: &mut [f32],
        len: Option<usize>,
    ) -> Result<usize> {
        self.curve.access(&mut self.boundary, slot, module, curve, mode, data, len)
    }

    /// Read up to `len` values of a module curve.
    pub fn read_curve(&mut self, slot: i32, module: i32, curve: i32, len: usize) -> Result<Vec<f32>> {
        self.curve.read(&mut self.boundary, slot, module, curve, len)
    }

    /// Write a module curve; `len` defaults to the whole of `data`.
    pub fn write_curve(
        &mut self,
        slot: i32,
        module: i32,
        curve: i32,
        data: &[f32],
        len: Option<usize>,
    ) -> Result<usize> {
        self.curve.write(&mut self.boundary, slot, module, curve, data, len)
    }

    // ========================================================================
    // Controllers
    // ========================================================================

    /// Number of controllers.
    pub fn module_ctl_count(&mut self, slot: i32, module: i32) -> Result<usize> {
        self.call_status(EntryPoint::GetNumberOfModuleCtls, &[slot, module])
            .map(|v| v as usize)
    }

    /// Controller name.
    pub fn module_ctl_name(&mut self, slot: i32, module: i32, ctl: i32) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetModuleCtlName, &[slot, module, ctl])
    }

    /// Controller value; `scaled` selects the engine's scaling mode (0 real, 1 0x0000..=0x8000, 2 displayed).
    pub fn module_ctl_value(&mut self, slot: i32, module: i32, ctl: i32, scaled: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlValue, &[slot, module, ctl, scaled])
    }

    /// Set a controller value.
    pub fn set_module_ctl_value(&mut self, slot: i32, module: i32, ctl: i32, value: i32, scaled: i32) -> Result<()> {
        self.call_unit(EntryPoint::SetModuleCtlValue, &[slot, module, ctl, value, scaled])
    }

    /// Controller minimum.
    pub fn module_ctl_min(&mut self, slot: i32, module: i32, ctl: i32, scaled: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlMin, &[slot, module, ctl, scaled])
    }

    /// Controller maximum.
    pub fn module_ctl_max(&mut self, slot: i32, module: i32, ctl: i32, scaled: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlMax, &[slot, module, ctl, scaled])
    }

    /// Controller display offset.
    pub fn module_ctl_offset(&mut self, slot: i32, module: i32, ctl: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlOffset, &[slot, module, ctl])
    }

    /// Controller type: 0 normal, 1 selector.
    pub fn module_ctl_type(&mut self, slot: i32, module: i32, ctl: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlType, &[slot, module, ctl])
    }

    /// Controller group.
    pub fn module_ctl_group(&mut self, slot: i32, module: i32, ctl: i32) -> Result<i32> {
        self.call(EntryPoint::GetModuleCtlGroup, &[slot, module, ctl])
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    /// Create a pattern, optionally cloning `clone`. Requires the slot lock.
    /// Returns its number.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pattern(
        &mut self,
        slot: i32,
        clone: Option<i32>,
        x: i32,
        y: i32,
        tracks: i32,
        lines: i32,
        icon_seed: i32,
        name: &str,
    ) -> Result<i32> {
        let entry = EntryPoint::NewPattern;
        self.check_lock(entry, slot);
        let rv = self.call_with_str(entry, &[slot, clone.unwrap_or(-1), x, y, tracks, lines, icon_seed], name)?;
        check_status(entry, rv)
    }

    /// Remove a pattern. Requires the slot lock.
    pub fn remove_pattern(&mut self, slot: i32, pattern: i32) -> Result<()> {
        self.check_lock(EntryPoint::RemovePattern, slot);
        self.call_unit(EntryPoint::RemovePattern, &[slot, pattern])
    }

    /// Number of pattern slots (including empty ones).
    pub fn number_of_patterns(&mut self, slot: i32) -> Result<usize> {
        self.call_status(EntryPoint::GetNumberOfPatterns, &[slot]).map(|v| v as usize)
    }

    /// Find a pattern by name.
    pub fn find_pattern(&mut self, slot: i32, name: &str) -> Result<Option<i32>> {
        let rv = self.call_with_str(EntryPoint::FindPattern, &[slot], name)?;
        Ok((rv >= 0).then_some(rv))
    }

    /// Pattern X position (line number).
    pub fn pattern_x(&mut self, slot: i32, pattern: i32) -> Result<i32> {
        self.call(EntryPoint::GetPatternX, &[slot, pattern])
    }

    /// Pattern Y position.
    pub fn pattern_y(&mut self, slot: i32, pattern: i32) -> Result<i32> {
        self.call(EntryPoint::GetPatternY, &[slot, pattern])
    }

    /// Move a pattern. Requires the slot lock.
    pub fn set_pattern_xy(&mut self, slot: i32, pattern: i32, x: i32, y: i32) -> Result<()> {
        self.check_lock(EntryPoint::SetPatternXy, slot);
        self.call_unit(EntryPoint::SetPatternXy, &[slot, pattern, x, y])
    }

    /// Track count.
    pub fn pattern_tracks(&mut self, slot: i32, pattern: i32) -> Result<i32> {
        self.call(EntryPoint::GetPatternTracks, &[slot, pattern])
    }

    /// Line count.
    pub fn pattern_lines(&mut self, slot: i32, pattern: i32) -> Result<i32> {
        self.call(EntryPoint::GetPatternLines, &[slot, pattern])
    }

    /// Resize a pattern; `None` keeps the current dimension. Requires the slot lock.
    pub fn set_pattern_size(&mut self, slot: i32, pattern: i32, tracks: Option<i32>, lines: Option<i32>) -> Result<()> {
        self.check_lock(EntryPoint::SetPatternSize, slot);
        self.call_unit(
            EntryPoint::SetPatternSize,
            &[slot, pattern, tracks.unwrap_or(-1), lines.unwrap_or(-1)],
        )
    }

    /// Pattern name.
    pub fn pattern_name(&mut self, slot: i32, pattern: i32) -> Result<Option<String>> {
        self.call_string(EntryPoint::GetPatternName, &[slot, pattern])
    }

    /// Rename a pattern. Requires the slot lock.
    pub fn set_pattern_name(&mut self, slot: i32, pattern: i32, name: &str) -> Result<()> {
        self.check_lock(EntryPoint::SetPatternName, slot);
        let rv = self.call_with_str(EntryPoint::SetPatternName, &[slot, pattern], name)?;
        check_status(EntryPoint::SetPatternName, rv).map(drop)
    }

    /// View a pattern's event grid in place.
    ///
    /// A pattern with zero tracks or lines (or no data) yields an empty view.
    pub fn pattern_data(&mut self, slot: i32, pattern: i32) -> Result<PatternView<'_>> {
        let tracks = self.pattern_tracks(slot, pattern)?;
        let lines = self.pattern_lines(slot, pattern)?;
        if tracks <= 0 || lines <= 0 {
            return Ok(PatternView::empty());
        }
        let addr = ForeignAddr::from_ret(self.call(EntryPoint::GetPatternData, &[slot, pattern])?);
        if addr.is_null() {
            return Ok(PatternView::empty());
        }
        let (tracks, lines) = (tracks as usize, lines as usize);
        let len = tracks
            .checked_mul(lines)
            .and_then(|cells| cells.checked_mul(EVENT_BYTES))
            .ok_or(BridgeError::OutOfBounds { addr: addr.0, len: usize::MAX })?;
        let bytes = self.boundary.read(addr, len)?;
        Ok(PatternView::new(bytes, tracks, lines))
    }

    /// One event, read through the pattern view. `None` outside the grid.
    pub fn pattern_event(&mut self, slot: i32, pattern: i32, track: usize, line: usize) -> Result<Option<EventRecord>> {
        Ok(self.pattern_data(slot, pattern)?.event(track, line))
    }

    /// One raw event column through `sv_get_pattern_event`:
    /// 0 note, 1 velocity, 2 module, 3 ctl, 4 ctl_val.
    pub fn pattern_event_column(
        &mut self,
        slot: i32,
        pattern: i32,
        track: i32,
        line: i32,
        column: i32,
    ) -> Result<i32> {
        self.call_status(EntryPoint::GetPatternEvent, &[slot, pattern, track, line, column])
    }

    /// Update one event in place; unset patch fields are left unchanged.
    pub fn set_pattern_event(
        &mut self,
        slot: i32,
        pattern: i32,
        track: i32,
        line: i32,
        patch: &EventPatch,
    ) -> Result<()> {
        let [nn, vv, mm, ccee, xxyy] = patch.to_args();
        self.call_unit(
            EntryPoint::SetPatternEvent,
            &[slot, pattern, track, line, nn, vv, mm, ccee, xxyy],
        )
    }

    /// Mute (`Some(true)`), unmute (`Some(false)`) or query (`None`) a
    /// pattern. Requires the slot lock. Returns the previous state.
    pub fn pattern_mute(&mut self, slot: i32, pattern: i32, mute: Option<bool>) -> Result<bool> {
        let entry = EntryPoint::PatternMute;
        self.check_lock(entry, slot);
        let arg = mute.map_or(-1, i32::from);
        self.call_status(entry, &[slot, pattern, arg]).map(|prev| prev != 0)
    }
}

impl<B: Boundary> Drop for Bridge<B> {
    fn drop(&mut self) {
        if let Err(e) = self.release_buffers() {
            tracing::warn!("failed to release bridge buffers: {}", e);
        }
    }
}

/// Holds a slot lock; unlocks when dropped.
///
/// Derefs to the [`Bridge`], so structural calls go straight through it.
pub struct SlotGuard<'a, B: Boundary> {
    bridge: &'a mut Bridge<B>,
    slot: i32,
    held: bool,
}

impl<B: Boundary> SlotGuard<'_, B> {
    /// The locked slot.
    pub fn slot(&self) -> i32 {
        self.slot
    }

    /// Unlock now, reporting any engine failure.
    pub fn unlock(mut self) -> Result<()> {
        self.held = false;
        self.bridge.unlock_slot(self.slot)
    }
}

impl<B: Boundary> Deref for SlotGuard<'_, B> {
    type Target = Bridge<B>;

    fn deref(&self) -> &Self::Target {
        self.bridge
    }
}

impl<B: Boundary> DerefMut for SlotGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.bridge
    }
}

impl<B: Boundary> Drop for SlotGuard<'_, B> {
    fn drop(&mut self) {
        if self.held {
            if let Err(e) = self.bridge.unlock_slot(self.slot) {
                tracing::warn!(slot = self.slot, "failed to unlock slot: {}", e);
            }
        }
    }
}

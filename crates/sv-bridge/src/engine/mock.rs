//! In-process engine double.
//!
//! `MockEngine` implements [`Boundary`] over a plain byte vector standing in
//! for linear memory. It behaves like the real engine where the bridge can
//! observe it (status codes, pointer ownership, buffer sizes) and adds test
//! instrumentation:
//!
//! - allocation tracking (host-owned vs engine-owned), invalid-free counting
//! - allocation failure injection
//! - structural calls outside `sv_lock_slot` rejected with `-1`, as the real
//!   engine does unless initialized with `ONE_THREAD` (can be switched off to
//!   observe races)
//! - a call log of every entry point invoked, with arguments
//! - a simulated real-time audio thread per slot that reads the module graph
//!   under the slot lock and counts torn reads
//!
//! Synthesis output is deterministic filler, not audio.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Boundary, EntryPoint, ForeignAddr};
use crate::error::Result;
use crate::flags::{pack_xy, InitFlags, ModuleFlags};

/// Linear memory size of the mock.
pub const MOCK_MEMORY_BYTES: usize = 4 * 1024 * 1024;
/// Number of slots the mock accepts.
pub const MOCK_MAX_SLOTS: usize = 16;
/// Value returned by a successful `sv_init`.
pub const MOCK_VERSION: i32 = 0x0002_0100;
/// Magic prefix of project blobs accepted by `sv_load_from_memory`.
pub const MOCK_PROJECT_MAGIC: &[u8; 4] = b"SVOX";

const HEAP_START: u32 = 64;
const ALIGN: u32 = 8;
const MAX_TRACKS: i32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Host,
    Engine,
}

/// First-fit allocator over the mock's linear memory.
#[derive(Debug)]
struct Heap {
    next: u32,
    free: Vec<(u32, u32)>,
    live: BTreeMap<u32, (u32, Owner)>,
}

impl Heap {
    fn new() -> Self {
        Self {
            next: HEAP_START,
            free: Vec::new(),
            live: BTreeMap::new(),
        }
    }

    fn alloc(&mut self, size: u32, owner: Owner, limit: usize) -> u32 {
        let size = size.max(1).div_ceil(ALIGN) * ALIGN;
        if let Some(pos) = self.free.iter().position(|&(_, s)| s >= size) {
            let (addr, block) = self.free.swap_remove(pos);
            self.live.insert(addr, (block, owner));
            return addr;
        }
        let addr = self.next;
        let end = addr as usize + size as usize;
        if end > limit {
            return 0;
        }
        self.next = end as u32;
        self.live.insert(addr, (size, owner));
        addr
    }

    fn free(&mut self, addr: u32) -> bool {
        match self.live.remove(&addr) {
            Some((size, _)) => {
                self.free.push((addr, size));
                true
            }
            None => false,
        }
    }

    fn set_owner(&mut self, addr: u32, owner: Owner) {
        if let Some(entry) = self.live.get_mut(&addr) {
            entry.1 = owner;
        }
    }

    fn count(&self, owner: Owner) -> usize {
        self.live.values().filter(|(_, o)| *o == owner).count()
    }
}

/// State shared between a slot and its simulated audio thread.
#[derive(Debug, Default)]
pub struct SlotShared {
    locked: AtomicBool,
    /// Odd while a structural mutation is in progress.
    graph_epoch: AtomicU64,
    torn_reads: AtomicU64,
    reads: AtomicU64,
    audio_running: AtomicBool,
}

impl SlotShared {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Graph reads the audio thread saw mid-mutation.
    pub fn torn_reads(&self) -> u64 {
        self.torn_reads.load(Ordering::Relaxed)
    }

    /// Total graph reads by the audio thread.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

/// Handle to a running simulated audio thread. Stops on drop.
pub struct AudioThread {
    shared: Arc<SlotShared>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioThread {
    /// Counters of the slot this thread renders.
    pub fn stats(&self) -> &SlotShared {
        &self.shared
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) -> Arc<SlotShared> {
        self.join();
        Arc::clone(&self.shared)
    }

    fn join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.shared.audio_running.store(false, Ordering::Relaxed);
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        self.join();
    }
}

#[derive(Debug, Clone)]
struct Ctl {
    name: u32,
    value: i32,
    min: i32,
    max: i32,
    offset: i32,
    kind: i32,
    group: i32,
}

#[derive(Debug)]
struct Module {
    name: u32,
    kind: u32,
    kind_name: String,
    label: String,
    flags: u32,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    inputs_addr: u32,
    outputs_addr: u32,
    xy: u32,
    color: i32,
    finetune: i32,
    relnote: i32,
    ctls: Vec<Ctl>,
    curve: Vec<f32>,
    sampler_pars: HashMap<(i32, i32), i32>,
    loaded_bytes: usize,
}

#[derive(Debug)]
struct Pattern {
    name: u32,
    label: String,
    x: i32,
    y: i32,
    tracks: i32,
    lines: i32,
    data: u32,
    muted: bool,
}

#[derive(Debug)]
struct Slot {
    name: u32,
    project: Vec<u8>,
    modules: Vec<Option<Module>>,
    patterns: Vec<Option<Pattern>>,
    playing: bool,
    line: i32,
    volume: i32,
    autostop: i32,
    event_t: Option<i32>,
    events: Vec<[i32; 6]>,
    host_lock_depth: u32,
}

/// In-process engine double with its own linear memory.
pub struct MockEngine {
    memory: Vec<u8>,
    heap: Heap,
    fail_all: bool,
    fail_after: Option<usize>,
    mallocs: usize,
    invalid_frees: usize,
    calls: Vec<(EntryPoint, Vec<i32>)>,
    initialized: bool,
    flags: InitFlags,
    sample_rate: i32,
    channels: i32,
    slots: Vec<Option<Slot>>,
    shared: Vec<Arc<SlotShared>>,
    scope_available: u32,
    mutation_delay: Duration,
    lock_checks: bool,
    ticks: u32,
    log: u32,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    /// Create an uninitialized engine with empty memory.
    pub fn new() -> Self {
        Self {
            memory: vec![0; MOCK_MEMORY_BYTES],
            heap: Heap::new(),
            fail_all: false,
            fail_after: None,
            mallocs: 0,
            invalid_frees: 0,
            calls: Vec::new(),
            initialized: false,
            flags: InitFlags::NONE,
            sample_rate: 0,
            channels: 0,
            slots: (0..MOCK_MAX_SLOTS).map(|_| None).collect(),
            shared: (0..MOCK_MAX_SLOTS).map(|_| Arc::new(SlotShared::default())).collect(),
            scope_available: 8192,
            mutation_delay: Duration::from_micros(20),
            lock_checks: true,
            ticks: 0,
            log: 0,
        }
    }

    // ========================================================================
    // Instrumentation
    // ========================================================================

    /// Make every subsequent host allocation fail (or stop failing).
    pub fn fail_allocations(&mut self, fail: bool) {
        self.fail_all = fail;
    }

    /// Let `n` more host allocations succeed, then fail the rest.
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.fail_after = Some(self.mallocs + n);
    }

    /// Host-owned allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.heap.count(Owner::Host)
    }

    /// Engine-internal allocations (names, link arrays, pattern grids).
    pub fn engine_allocations(&self) -> usize {
        self.heap.count(Owner::Engine)
    }

    /// Host `malloc` calls so far, including failed ones.
    pub fn malloc_count(&self) -> usize {
        self.mallocs
    }

    /// `free` calls on addresses that were not live.
    pub fn invalid_frees(&self) -> usize {
        self.invalid_frees
    }

    /// Every entry point invoked so far, with arguments.
    pub fn calls(&self) -> &[(EntryPoint, Vec<i32>)] {
        &self.calls
    }

    /// Number of invocations of `entry`.
    pub fn call_count(&self, entry: EntryPoint) -> usize {
        self.calls.iter().filter(|(e, _)| *e == entry).count()
    }

    /// Arguments of the latest invocation of `entry`.
    pub fn last_args(&self, entry: EntryPoint) -> Option<&[i32]> {
        self.calls
            .iter()
            .rev()
            .find(|(e, _)| *e == entry)
            .map(|(_, a)| a.as_slice())
    }

    /// Forget the call log.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// How many scope samples a module can deliver per read.
    pub fn set_scope_available(&mut self, samples: u32) {
        self.scope_available = samples;
    }

    /// How long a structural mutation keeps the graph inconsistent.
    pub fn set_mutation_delay(&mut self, delay: Duration) {
        self.mutation_delay = delay;
    }

    /// Reject structural calls on an unlocked slot (default), or let them
    /// race with the audio thread.
    pub fn set_lock_checks(&mut self, enabled: bool) {
        self.lock_checks = enabled;
    }

    /// Events received by `sv_send_event` on `slot`: `[track, note, vel, module, ctl, ctl_val]`.
    pub fn sent_events(&self, slot: i32) -> Vec<[i32; 6]> {
        self.slot(slot).map(|s| s.events.clone()).unwrap_or_default()
    }

    /// Timestamp set by `sv_set_event_t`, if enabled.
    pub fn event_timestamp(&self, slot: i32) -> Option<i32> {
        self.slot(slot).and_then(|s| s.event_t)
    }

    /// Bytes last loaded into module `m` of `slot`.
    pub fn loaded_bytes(&self, slot: i32, m: i32) -> usize {
        self.module(slot, m).map(|m| m.loaded_bytes).unwrap_or(0)
    }

    /// Shared counters of `slot`.
    pub fn slot_shared(&self, slot: i32) -> Option<Arc<SlotShared>> {
        self.shared.get(usize::try_from(slot).ok()?).cloned()
    }

    /// Start a thread that repeatedly reads `slot`'s module graph under the
    /// slot lock, like the engine's real-time render path.
    pub fn spawn_audio_thread(&self, slot: i32) -> Option<AudioThread> {
        let shared = self.slot_shared(slot)?;
        let stop = Arc::new(AtomicBool::new(false));
        shared.audio_running.store(true, Ordering::Relaxed);
        let thread_shared = Arc::clone(&shared);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                thread_shared.acquire();
                let epoch = thread_shared.graph_epoch.load(Ordering::Acquire);
                if epoch % 2 == 1 {
                    thread_shared.torn_reads.fetch_add(1, Ordering::Relaxed);
                }
                thread_shared.reads.fetch_add(1, Ordering::Relaxed);
                thread_shared.release();
                std::thread::yield_now();
            }
        });
        Some(AudioThread {
            shared,
            stop,
            handle: Some(handle),
        })
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn engine_alloc(&mut self, bytes: usize) -> u32 {
        self.heap.alloc(bytes as u32, Owner::Engine, self.memory.len())
    }

    fn engine_free(&mut self, addr: u32) {
        if addr != 0 {
            self.heap.free(addr);
        }
    }

    fn engine_str(&mut self, text: &str) -> u32 {
        let addr = self.engine_alloc(text.len() + 1);
        if addr != 0 {
            let start = addr as usize;
            self.memory[start..start + text.len()].copy_from_slice(text.as_bytes());
            self.memory[start + text.len()] = 0;
        }
        addr
    }

    fn host_str(&self, addr: i32) -> String {
        self.read_cstr(ForeignAddr::from_ret(addr))
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    fn engine_links(&mut self, old: u32, links: &[i32]) -> u32 {
        self.engine_free(old);
        if links.is_empty() {
            return 0;
        }
        let addr = self.engine_alloc(links.len() * 4);
        if addr != 0 {
            for (i, link) in links.iter().enumerate() {
                let at = addr as usize + i * 4;
                self.memory[at..at + 4].copy_from_slice(&link.to_le_bytes());
            }
        }
        addr
    }

    fn slot(&self, slot: i32) -> Option<&Slot> {
        self.slots.get(usize::try_from(slot).ok()?)?.as_ref()
    }

    fn slot_mut(&mut self, slot: i32) -> Option<&mut Slot> {
        self.slots.get_mut(usize::try_from(slot).ok()?)?.as_mut()
    }

    fn module(&self, slot: i32, m: i32) -> Option<&Module> {
        self.slot(slot)?.modules.get(usize::try_from(m).ok()?)?.as_ref()
    }

    fn module_mut(&mut self, slot: i32, m: i32) -> Option<&mut Module> {
        self.slot_mut(slot)?
            .modules
            .get_mut(usize::try_from(m).ok()?)?
            .as_mut()
    }

    fn pattern(&self, slot: i32, p: i32) -> Option<&Pattern> {
        self.slot(slot)?.patterns.get(usize::try_from(p).ok()?)?.as_ref()
    }

    fn pattern_mut(&mut self, slot: i32, p: i32) -> Option<&mut Pattern> {
        self.slot_mut(slot)?
            .patterns
            .get_mut(usize::try_from(p).ok()?)?
            .as_mut()
    }

    fn unlocked(&self, entry: EntryPoint, slot: i32) -> bool {
        if !self.lock_checks || !entry.requires_lock() || self.flags.contains(InitFlags::ONE_THREAD) {
            return false;
        }
        self.slot(slot).is_some_and(|s| s.host_lock_depth == 0)
    }

    fn begin_mutation(&self, slot: i32) {
        if let Some(shared) = self.slot_shared(slot) {
            shared.graph_epoch.fetch_add(1, Ordering::AcqRel);
            if shared.audio_running.load(Ordering::Relaxed) {
                std::thread::sleep(self.mutation_delay);
            }
        }
    }

    fn end_mutation(&self, slot: i32) {
        if let Some(shared) = self.slot_shared(slot) {
            shared.graph_epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn new_module_at(&mut self, slot: i32, kind: &str, label: &str, xy: u32) -> i32 {
        let name = self.engine_str(label);
        let kind_addr = self.engine_str(kind);
        let role = match kind {
            "Output" => 0,
            "Sampler" | "Generator" | "FM" | "Analog generator" | "Vorbis player" | "MetaModule" => {
                ModuleFlags::GENERATOR.bits()
            }
            _ => ModuleFlags::EFFECT.bits(),
        };
        let ctls = [
            ("Volume", 256, 0, 256, 0, 0, 0),
            ("Panning", 128, 0, 256, -128, 0, 0),
            ("Mode", 0, 0, 3, 0, 1, 1),
        ];
        let ctls = ctls
            .iter()
            .map(|&(n, value, min, max, offset, kind, group)| Ctl {
                name: self.engine_str(n),
                value,
                min,
                max,
                offset,
                kind,
                group,
            })
            .collect();
        let module = Module {
            name,
            kind: kind_addr,
            kind_name: kind.to_string(),
            label: label.to_string(),
            flags: ModuleFlags::EXISTS.bits() | role,
            inputs: Vec::new(),
            outputs: Vec::new(),
            inputs_addr: 0,
            outputs_addr: 0,
            xy,
            color: 0xFFFFFF,
            finetune: 0,
            relnote: 0,
            ctls,
            curve: vec![0.0; 4096],
            sampler_pars: HashMap::new(),
            loaded_bytes: 0,
        };
        let Some(s) = self.slot_mut(slot) else {
            return -1;
        };
        let idx = match s.modules.iter().position(|m| m.is_none()) {
            Some(i) => {
                s.modules[i] = Some(module);
                i
            }
            None => {
                s.modules.push(Some(module));
                s.modules.len() - 1
            }
        };
        idx as i32
    }

    fn free_module(&mut self, module: Module) {
        self.engine_free(module.name);
        self.engine_free(module.kind);
        self.engine_free(module.inputs_addr);
        self.engine_free(module.outputs_addr);
        for ctl in module.ctls {
            self.engine_free(ctl.name);
        }
    }

    fn refresh_links(&mut self, slot: i32, m: i32) {
        let Some(module) = self.module(slot, m) else {
            return;
        };
        let (inputs, outputs) = (module.inputs.clone(), module.outputs.clone());
        let (in_old, out_old) = (module.inputs_addr, module.outputs_addr);
        let in_addr = self.engine_links(in_old, &inputs);
        let out_addr = self.engine_links(out_old, &outputs);
        if let Some(module) = self.module_mut(slot, m) {
            module.inputs_addr = in_addr;
            module.outputs_addr = out_addr;
            module.flags = (module.flags & 0xFFFF)
                | ((inputs.len() as u32 & 0xFF) << ModuleFlags::INPUTS_OFF)
                | ((outputs.len() as u32 & 0xFF) << ModuleFlags::OUTPUTS_OFF);
        }
    }

    fn frames_per_line(&self) -> u64 {
        // 24 ticks per beat at 125 BPM, 6 ticks per line
        let rate = self.sample_rate.max(1) as u64;
        rate * 60 * 6 / (125 * 24)
    }

    fn song_lines(&self, slot: i32) -> i32 {
        self.slot(slot)
            .map(|s| {
                s.patterns
                    .iter()
                    .flatten()
                    .map(|p| p.x + p.lines)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn render(&mut self, args: &[i32], with_input: bool) -> i32 {
        if !self.initialized {
            return -1;
        }
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let buf = arg(0) as u32 as usize;
        let frames = arg(1).max(0) as usize;
        let channels = self.channels.max(0) as usize;
        let float = self.flags.contains(InitFlags::AUDIO_FLOAT32);
        let width = if float { 4 } else { 2 };
        let samples = frames * channels;
        if buf == 0 || buf + samples * width > self.memory.len() {
            return -1;
        }

        let input = if with_input && arg(6) != 0 {
            let in_float = arg(4) == 1;
            let in_channels = arg(5).max(1) as usize;
            let in_buf = arg(6) as u32 as usize;
            let in_width = if in_float { 4 } else { 2 };
            if in_buf + frames * in_channels * in_width > self.memory.len() {
                return -1;
            }
            let values: Vec<f32> = (0..frames * in_channels)
                .map(|k| {
                    let at = in_buf + k * in_width;
                    if in_float {
                        f32::from_le_bytes([
                            self.memory[at],
                            self.memory[at + 1],
                            self.memory[at + 2],
                            self.memory[at + 3],
                        ])
                    } else {
                        i16::from_le_bytes([self.memory[at], self.memory[at + 1]]) as f32 / 32768.0
                    }
                })
                .collect();
            Some((values, in_channels))
        } else {
            None
        };

        for k in 0..samples {
            let v = match &input {
                Some((values, in_channels)) => {
                    let frame = k / channels.max(1);
                    let ch = k % channels.max(1);
                    values[frame * in_channels + ch % in_channels]
                }
                None => (k % 64) as f32 / 64.0,
            };
            let at = buf + k * width;
            if float {
                self.memory[at..at + 4].copy_from_slice(&v.to_le_bytes());
            } else {
                let s = (v * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
                self.memory[at..at + 2].copy_from_slice(&s.to_le_bytes());
            }
        }
        1
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    fn dispatch(&mut self, entry: EntryPoint, a: &[i32]) -> i32 {
        use EntryPoint::*;
        let arg = |i: usize| a.get(i).copied().unwrap_or(0);
        let slot = arg(0);

        if self.unlocked(entry, slot) {
            tracing::debug!(%entry, slot, "mock rejected unlocked structural call");
            return -1;
        }

        match entry {
            Init => {
                self.flags = InitFlags::from_bits(arg(3) as u32);
                self.sample_rate = arg(1);
                self.channels = arg(2);
                self.initialized = true;
                MOCK_VERSION
            }
            Deinit => {
                self.initialized = false;
                0
            }
            GetSampleRate => self.sample_rate,
            UpdateInput => 0,
            AudioCallback => self.render(a, false),
            AudioCallback2 => self.render(a, true),
            GetTicks => {
                self.ticks = self.ticks.wrapping_add(1);
                self.ticks as i32
            }
            GetTicksPerSecond => 1000,
            GetLog => {
                let text = "mock engine ready\n";
                let size = (arg(0).max(0) as usize).min(text.len());
                let old = self.log;
                self.engine_free(old);
                self.log = self.engine_str(&text[text.len() - size..]);
                self.log as i32
            }
            OpenSlot => {
                let Some(existing) = usize::try_from(slot).ok().and_then(|i| self.slots.get(i)) else {
                    return -1;
                };
                if existing.is_some() {
                    return 0;
                }
                let name = self.engine_str("");
                self.slots[slot as usize] = Some(Slot {
                    name,
                    project: Vec::new(),
                    modules: Vec::new(),
                    patterns: Vec::new(),
                    playing: false,
                    line: 0,
                    volume: 256,
                    autostop: 1,
                    event_t: None,
                    events: Vec::new(),
                    host_lock_depth: 0,
                });
                self.new_module_at(slot, "Output", "Output", pack_xy(512, 512));
                0
            }
            CloseSlot => {
                let Some(s) = usize::try_from(slot).ok().and_then(|i| self.slots.get_mut(i)) else {
                    return -1;
                };
                let Some(s) = s.take() else {
                    return -1;
                };
                self.engine_free(s.name);
                for module in s.modules.into_iter().flatten() {
                    self.free_module(module);
                }
                for pattern in s.patterns.into_iter().flatten() {
                    self.engine_free(pattern.name);
                    self.engine_free(pattern.data);
                }
                0
            }
            LockSlot => {
                let Some(shared) = self.slot_shared(slot) else {
                    return -1;
                };
                let Some(s) = self.slot_mut(slot) else {
                    return -1;
                };
                if s.host_lock_depth == 0 {
                    shared.acquire();
                }
                s.host_lock_depth += 1;
                0
            }
            UnlockSlot => {
                let Some(shared) = self.slot_shared(slot) else {
                    return -1;
                };
                let Some(s) = self.slot_mut(slot) else {
                    return -1;
                };
                if s.host_lock_depth == 0 {
                    return -1;
                }
                s.host_lock_depth -= 1;
                if s.host_lock_depth == 0 {
                    shared.release();
                }
                0
            }
            LoadFromMemory => {
                let (addr, len) = (arg(1) as u32, arg(2).max(0) as usize);
                let Ok(bytes) = self.read(ForeignAddr(addr), len).map(|b| b.to_vec()) else {
                    return -1;
                };
                if !bytes.starts_with(MOCK_PROJECT_MAGIC) {
                    return -1;
                }
                let title = String::from_utf8_lossy(&bytes[4..]).into_owned();
                let name = self.engine_str(&title);
                let Some(s) = self.slot_mut(slot) else {
                    return -1;
                };
                let old = std::mem::replace(&mut s.name, name);
                s.project = bytes;
                self.engine_free(old);
                0
            }
            SaveToMemory => {
                let Some(s) = self.slot(slot) else {
                    return 0;
                };
                let project = if s.project.is_empty() {
                    MOCK_PROJECT_MAGIC.to_vec()
                } else {
                    s.project.clone()
                };
                let size_cell = ForeignAddr(arg(1) as u32);
                if self.write(size_cell, &(project.len() as u32).to_le_bytes()).is_err() {
                    return 0;
                }
                let out = self.engine_alloc(project.len());
                if out == 0 {
                    return 0;
                }
                self.memory[out as usize..out as usize + project.len()].copy_from_slice(&project);
                // Ownership passes to the caller.
                self.heap.set_owner(out, Owner::Host);
                out as i32
            }
            Play | PlayFromBeginning | Stop => {
                let Some(s) = self.slot_mut(slot) else {
                    return -1;
                };
                match entry {
                    Play => s.playing = true,
                    PlayFromBeginning => {
                        s.playing = true;
                        s.line = 0;
                    }
                    _ => s.playing = false,
                }
                0
            }
            Pause | Resume | SyncResume => {
                if self.slot(slot).is_some() {
                    0
                } else {
                    -1
                }
            }
            SetAutostop => match self.slot_mut(slot) {
                Some(s) => {
                    s.autostop = arg(1);
                    0
                }
                None => -1,
            },
            GetAutostop => self.slot(slot).map(|s| s.autostop).unwrap_or(-1),
            EndOfSong => self.slot(slot).map(|s| (!s.playing) as i32).unwrap_or(-1),
            Rewind => match self.slot_mut(slot) {
                Some(s) => {
                    s.line = arg(1);
                    0
                }
                None => -1,
            },
            Volume => match self.slot_mut(slot) {
                Some(s) => {
                    let prev = s.volume;
                    if arg(1) >= 0 {
                        s.volume = arg(1).min(256);
                    }
                    prev
                }
                None => -1,
            },
            SetEventT => match self.slot_mut(slot) {
                Some(s) => {
                    s.event_t = (arg(1) != 0).then_some(arg(2));
                    0
                }
                None => -1,
            },
            SendEvent => match self.slot_mut(slot) {
                Some(s) if (0..16).contains(&arg(1)) => {
                    s.events.push([arg(1), arg(2), arg(3), arg(4), arg(5), arg(6)]);
                    0
                }
                _ => -1,
            },
            GetCurrentLine => self.slot(slot).map(|s| s.line).unwrap_or(0),
            GetCurrentLine2 => self.slot(slot).map(|s| s.line << 5).unwrap_or(0),
            GetCurrentSignalLevel => self
                .slot(slot)
                .map(|s| if s.playing { 128 } else { 0 })
                .unwrap_or(0),
            GetSongName => self.slot(slot).map(|s| s.name as i32).unwrap_or(0),
            SetSongName => {
                let title = self.host_str(arg(1));
                let name = self.engine_str(&title);
                let Some(s) = self.slot_mut(slot) else {
                    self.engine_free(name);
                    return -1;
                };
                let old = std::mem::replace(&mut s.name, name);
                self.engine_free(old);
                0
            }
            GetSongBpm => self.slot(slot).map(|_| 125).unwrap_or(0),
            GetSongTpl => self.slot(slot).map(|_| 6).unwrap_or(0),
            GetSongLengthLines => self.song_lines(slot),
            GetSongLengthFrames => {
                (self.song_lines(slot).max(0) as u64 * self.frames_per_line()) as u32 as i32
            }
            GetTimeMap => {
                let (start, len, dest, kind) = (arg(1), arg(2), arg(3) as u32, arg(4) & 3);
                if self.slot(slot).is_none() || len <= 0 || dest == 0 {
                    return -1;
                }
                let fpl = self.frames_per_line();
                for i in 0..len as usize {
                    let value = if kind == 0 {
                        125u32 | (6 << 16)
                    } else {
                        ((start as u64 + i as u64) * fpl) as u32
                    };
                    if self.write(ForeignAddr(dest).offset(i * 4), &value.to_le_bytes()).is_err() {
                        return -1;
                    }
                }
                0
            }
            NewModule => {
                if self.slot(slot).is_none() {
                    return -1;
                }
                let kind = self.host_str(arg(1));
                let label = self.host_str(arg(2));
                self.begin_mutation(slot);
                let rv = self.new_module_at(slot, &kind, &label, pack_xy(arg(3), arg(4)));
                self.end_mutation(slot);
                rv
            }
            RemoveModule => {
                let m = arg(1);
                if m <= 0 || self.module(slot, m).is_none() {
                    return -1;
                }
                self.begin_mutation(slot);
                let removed = self.slot_mut(slot).and_then(|s| s.modules[m as usize].take());
                let mut touched = Vec::new();
                if let Some(s) = self.slot_mut(slot) {
                    for (i, other) in s.modules.iter_mut().enumerate() {
                        if let Some(other) = other {
                            let before = other.inputs.len() + other.outputs.len();
                            other.inputs.retain(|&l| l != m);
                            other.outputs.retain(|&l| l != m);
                            if other.inputs.len() + other.outputs.len() != before {
                                touched.push(i as i32);
                            }
                        }
                    }
                }
                for i in touched {
                    self.refresh_links(slot, i);
                }
                if let Some(module) = removed {
                    self.free_module(module);
                }
                self.end_mutation(slot);
                0
            }
            ConnectModule | DisconnectModule => {
                let (src, dst) = (arg(1), arg(2));
                if src == dst || self.module(slot, src).is_none() || self.module(slot, dst).is_none() {
                    return -1;
                }
                self.begin_mutation(slot);
                let connect = entry == ConnectModule;
                if let Some(m) = self.module_mut(slot, src) {
                    m.outputs.retain(|&l| l != dst);
                    if connect {
                        m.outputs.push(dst);
                    }
                }
                if let Some(m) = self.module_mut(slot, dst) {
                    m.inputs.retain(|&l| l != src);
                    if connect {
                        m.inputs.push(src);
                    }
                }
                self.refresh_links(slot, src);
                self.refresh_links(slot, dst);
                self.end_mutation(slot);
                0
            }
            LoadModuleFromMemory => {
                let len = arg(2).max(0) as usize;
                if self.slot(slot).is_none() || len == 0 {
                    return -1;
                }
                let count = self.slot(slot).map(|s| s.modules.len()).unwrap_or(0);
                let label = format!("Sampler{}", count);
                let idx = self.new_module_at(slot, "Sampler", &label, pack_xy(arg(3), arg(4)));
                if let Some(m) = self.module_mut(slot, idx) {
                    m.loaded_bytes = len;
                }
                idx
            }
            SamplerLoadFromMemory | MetamoduleLoadFromMemory | VplayerLoadFromMemory => {
                let expected = match entry {
                    SamplerLoadFromMemory => "Sampler",
                    MetamoduleLoadFromMemory => "MetaModule",
                    _ => "Vorbis player",
                };
                let len = arg(3).max(0) as usize;
                match self.module_mut(slot, arg(1)) {
                    Some(m) if m.kind_name == expected && len > 0 => {
                        m.loaded_bytes = len;
                        0
                    }
                    _ => -1,
                }
            }
            SamplerPar => {
                let (sample_slot, par, value, set) = (arg(2), arg(3), arg(4), arg(5));
                match self.module_mut(slot, arg(1)) {
                    Some(m) if m.kind_name == "Sampler" => {
                        if set != 0 {
                            m.sampler_pars.insert((sample_slot, par), value);
                            0
                        } else {
                            m.sampler_pars.get(&(sample_slot, par)).copied().unwrap_or(0)
                        }
                    }
                    _ => -1,
                }
            }
            GetNumberOfModules => self.slot(slot).map(|s| s.modules.len() as i32).unwrap_or(0),
            FindModule => {
                let name = self.host_str(arg(1));
                self.slot(slot)
                    .and_then(|s| {
                        s.modules
                            .iter()
                            .position(|m| m.as_ref().is_some_and(|m| m.label == name))
                    })
                    .map(|i| i as i32)
                    .unwrap_or(-1)
            }
            GetModuleFlags => self.module(slot, arg(1)).map(|m| m.flags as i32).unwrap_or(0),
            GetModuleInputs => self.module(slot, arg(1)).map(|m| m.inputs_addr as i32).unwrap_or(0),
            GetModuleOutputs => self
                .module(slot, arg(1))
                .map(|m| m.outputs_addr as i32)
                .unwrap_or(0),
            GetModuleType => self.module(slot, arg(1)).map(|m| m.kind as i32).unwrap_or(0),
            GetModuleName => self.module(slot, arg(1)).map(|m| m.name as i32).unwrap_or(0),
            SetModuleName => {
                if self.module(slot, arg(1)).is_none() {
                    return -1;
                }
                let label = self.host_str(arg(2));
                let name = self.engine_str(&label);
                let old = match self.module_mut(slot, arg(1)) {
                    Some(m) => {
                        m.label = label;
                        std::mem::replace(&mut m.name, name)
                    }
                    None => name,
                };
                self.engine_free(old);
                0
            }
            GetModuleXy => self.module(slot, arg(1)).map(|m| m.xy as i32).unwrap_or(0),
            SetModuleXy => match self.module_mut(slot, arg(1)) {
                Some(m) => {
                    m.xy = pack_xy(arg(2), arg(3));
                    0
                }
                None => -1,
            },
            GetModuleColor => self.module(slot, arg(1)).map(|m| m.color).unwrap_or(0),
            SetModuleColor => match self.module_mut(slot, arg(1)) {
                Some(m) => {
                    m.color = arg(2);
                    0
                }
                None => -1,
            },
            GetModuleFinetune => self
                .module(slot, arg(1))
                .map(|m| pack_xy(m.finetune, m.relnote) as i32)
                .unwrap_or(0),
            SetModuleFinetune | SetModuleRelnote => match self.module_mut(slot, arg(1)) {
                Some(m) => {
                    if entry == SetModuleFinetune {
                        m.finetune = arg(2);
                    } else {
                        m.relnote = arg(2);
                    }
                    0
                }
                None => -1,
            },
            GetModuleScope2 => {
                let (m, channel, dest, want) = (arg(1), arg(2), arg(3) as u32, arg(4) as u32);
                if self.module(slot, m).is_none() || dest == 0 {
                    return 0;
                }
                let n = want.min(self.scope_available) as usize;
                for i in 0..n {
                    let v = (m * 100 + channel * 10) as i16 + (i % 1000) as i16;
                    if self.write(ForeignAddr(dest).offset(i * 2), &v.to_le_bytes()).is_err() {
                        return 0;
                    }
                }
                n as i32
            }
            ModuleCurve => {
                let (m, curve, data, len, w) = (arg(1), arg(2), arg(3) as u32, arg(4), arg(5));
                if curve != 0 || data == 0 {
                    return 0;
                }
                let Some(available) = self.module(slot, m).map(|m| m.curve.len()) else {
                    return 0;
                };
                let n = if len <= 0 { available } else { (len as usize).min(available) };
                if w == 1 {
                    let Ok(bytes) = self.read(ForeignAddr(data), n * 4).map(|b| b.to_vec()) else {
                        return 0;
                    };
                    if let Some(module) = self.module_mut(slot, m) {
                        for (i, c) in bytes.chunks_exact(4).enumerate() {
                            module.curve[i] = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                        }
                    }
                } else {
                    let values: Vec<u8> = self
                        .module(slot, m)
                        .map(|module| module.curve[..n].iter().flat_map(|v| v.to_le_bytes()).collect())
                        .unwrap_or_default();
                    if self.write(ForeignAddr(data), &values).is_err() {
                        return 0;
                    }
                }
                n as i32
            }
            GetNumberOfModuleCtls => self.module(slot, arg(1)).map(|m| m.ctls.len() as i32).unwrap_or(0),
            GetModuleCtlName | GetModuleCtlValue | GetModuleCtlMin | GetModuleCtlMax
            | GetModuleCtlOffset | GetModuleCtlType | GetModuleCtlGroup => {
                let Some(ctl) = self
                    .module(slot, arg(1))
                    .and_then(|m| m.ctls.get(usize::try_from(arg(2)).ok()?))
                else {
                    return 0;
                };
                match entry {
                    GetModuleCtlName => ctl.name as i32,
                    GetModuleCtlValue => ctl.value,
                    GetModuleCtlMin => ctl.min,
                    GetModuleCtlMax => ctl.max,
                    GetModuleCtlOffset => ctl.offset,
                    GetModuleCtlType => ctl.kind,
                    _ => ctl.group,
                }
            }
            SetModuleCtlValue => {
                let value = arg(3);
                match self
                    .module_mut(slot, arg(1))
                    .and_then(|m| m.ctls.get_mut(usize::try_from(arg(2)).ok()?))
                {
                    Some(ctl) => {
                        ctl.value = value.clamp(ctl.min, ctl.max);
                        0
                    }
                    None => -1,
                }
            }
            NewPattern => {
                let (clone, x, y, tracks, lines) = (arg(1), arg(2), arg(3), arg(4), arg(5));
                if self.slot(slot).is_none() || !(1..=MAX_TRACKS).contains(&tracks) || lines <= 0 {
                    return -1;
                }
                let label = self.host_str(arg(7));
                let bytes = (tracks * lines * 8) as usize;
                let data = self.engine_alloc(bytes);
                if data == 0 {
                    return -1;
                }
                let source = self
                    .pattern(slot, clone)
                    .filter(|p| p.tracks == tracks && p.lines == lines)
                    .map(|p| p.data as usize);
                match source {
                    Some(src) => self.memory.copy_within(src..src + bytes, data as usize),
                    None => self.memory[data as usize..data as usize + bytes].fill(0),
                }
                let name = self.engine_str(&label);
                let pattern = Pattern {
                    name,
                    label,
                    x,
                    y,
                    tracks,
                    lines,
                    data,
                    muted: false,
                };
                let Some(s) = self.slot_mut(slot) else {
                    return -1;
                };
                s.patterns.push(Some(pattern));
                (s.patterns.len() - 1) as i32
            }
            RemovePattern => {
                let taken = self
                    .slot_mut(slot)
                    .and_then(|s| s.patterns.get_mut(usize::try_from(arg(1)).ok()?)?.take());
                match taken {
                    Some(p) => {
                        self.engine_free(p.name);
                        self.engine_free(p.data);
                        0
                    }
                    None => -1,
                }
            }
            GetNumberOfPatterns => self.slot(slot).map(|s| s.patterns.len() as i32).unwrap_or(0),
            FindPattern => {
                let name = self.host_str(arg(1));
                self.slot(slot)
                    .and_then(|s| {
                        s.patterns
                            .iter()
                            .position(|p| p.as_ref().is_some_and(|p| p.label == name))
                    })
                    .map(|i| i as i32)
                    .unwrap_or(-1)
            }
            GetPatternX => self.pattern(slot, arg(1)).map(|p| p.x).unwrap_or(0),
            GetPatternY => self.pattern(slot, arg(1)).map(|p| p.y).unwrap_or(0),
            SetPatternXy => match self.pattern_mut(slot, arg(1)) {
                Some(p) => {
                    p.x = arg(2);
                    p.y = arg(3);
                    0
                }
                None => -1,
            },
            GetPatternTracks => self.pattern(slot, arg(1)).map(|p| p.tracks).unwrap_or(0),
            GetPatternLines => self.pattern(slot, arg(1)).map(|p| p.lines).unwrap_or(0),
            SetPatternSize => {
                let Some((old_tracks, old_lines, old_data)) =
                    self.pattern(slot, arg(1)).map(|p| (p.tracks, p.lines, p.data))
                else {
                    return -1;
                };
                let tracks = if arg(2) < 0 { old_tracks } else { arg(2) };
                let lines = if arg(3) < 0 { old_lines } else { arg(3) };
                if !(1..=MAX_TRACKS).contains(&tracks) || lines <= 0 {
                    return -1;
                }
                let data = self.engine_alloc((tracks * lines * 8) as usize);
                if data == 0 {
                    return -1;
                }
                let start = data as usize;
                self.memory[start..start + (tracks * lines * 8) as usize].fill(0);
                for line in 0..old_lines.min(lines) {
                    for track in 0..old_tracks.min(tracks) {
                        let from = old_data as usize + ((line * old_tracks + track) * 8) as usize;
                        let to = start + ((line * tracks + track) * 8) as usize;
                        self.memory.copy_within(from..from + 8, to);
                    }
                }
                self.engine_free(old_data);
                if let Some(p) = self.pattern_mut(slot, arg(1)) {
                    p.tracks = tracks;
                    p.lines = lines;
                    p.data = data;
                }
                0
            }
            GetPatternName => self.pattern(slot, arg(1)).map(|p| p.name as i32).unwrap_or(0),
            SetPatternName => {
                if self.pattern(slot, arg(1)).is_none() {
                    return -1;
                }
                let label = self.host_str(arg(2));
                let name = self.engine_str(&label);
                let old = match self.pattern_mut(slot, arg(1)) {
                    Some(p) => {
                        p.label = label;
                        std::mem::replace(&mut p.name, name)
                    }
                    None => name,
                };
                self.engine_free(old);
                0
            }
            GetPatternData => self.pattern(slot, arg(1)).map(|p| p.data as i32).unwrap_or(0),
            SetPatternEvent | GetPatternEvent => {
                let Some((tracks, lines, data)) =
                    self.pattern(slot, arg(1)).map(|p| (p.tracks, p.lines, p.data))
                else {
                    return -2;
                };
                let (track, line) = (arg(2), arg(3));
                if !(0..tracks).contains(&track) {
                    return -3;
                }
                if !(0..lines).contains(&line) {
                    return -4;
                }
                let at = data as usize + ((line * tracks + track) * 8) as usize;
                let cell = &mut self.memory[at..at + 8];
                if entry == GetPatternEvent {
                    return match arg(4) {
                        0 => cell[0] as i32,
                        1 => cell[1] as i32,
                        2 => u16::from_le_bytes([cell[2], cell[3]]) as i32,
                        3 => u16::from_le_bytes([cell[4], cell[5]]) as i32,
                        4 => u16::from_le_bytes([cell[6], cell[7]]) as i32,
                        _ => -1,
                    };
                }
                if arg(4) >= 0 {
                    cell[0] = arg(4) as u8;
                }
                if arg(5) >= 0 {
                    cell[1] = arg(5) as u8;
                }
                if arg(6) >= 0 {
                    cell[2..4].copy_from_slice(&(arg(6) as u16).to_le_bytes());
                }
                if arg(7) >= 0 {
                    cell[4..6].copy_from_slice(&(arg(7) as u16).to_le_bytes());
                }
                if arg(8) >= 0 {
                    cell[6..8].copy_from_slice(&(arg(8) as u16).to_le_bytes());
                }
                0
            }
            PatternMute => {
                if self.pattern(slot, arg(1)).is_none() {
                    return -1;
                }
                self.begin_mutation(slot);
                let prev = match self.pattern_mut(slot, arg(1)) {
                    Some(p) => {
                        let prev = p.muted as i32;
                        if arg(2) >= 0 {
                            p.muted = arg(2) != 0;
                        }
                        prev
                    }
                    None => -1,
                };
                self.end_mutation(slot);
                prev
            }
        }
    }
}

impl Boundary for MockEngine {
    fn malloc(&mut self, bytes: u32) -> Result<ForeignAddr> {
        self.mallocs += 1;
        let exhausted = self.fail_after.is_some_and(|limit| self.mallocs > limit);
        if self.fail_all || exhausted {
            return Ok(ForeignAddr::NULL);
        }
        Ok(ForeignAddr(self.heap.alloc(bytes, Owner::Host, self.memory.len())))
    }

    fn free(&mut self, addr: ForeignAddr) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        if !self.heap.free(addr.0) {
            tracing::error!(%addr, "mock engine: free of an address that is not live");
            self.invalid_frees += 1;
        }
        Ok(())
    }

    fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        self.calls.push((entry, args.to_vec()));
        Ok(self.dispatch(entry, args))
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_reuses_freed_blocks() {
        let mut mock = MockEngine::new();
        let a = mock.malloc(32).unwrap();
        mock.free(a).unwrap();
        let b = mock.malloc(16).unwrap();
        assert_eq!(a, b);
        assert_eq!(mock.live_allocations(), 1);
    }

    #[test]
    fn test_invalid_free_is_counted() {
        let mut mock = MockEngine::new();
        let a = mock.malloc(8).unwrap();
        mock.free(a).unwrap();
        mock.free(a).unwrap();
        assert_eq!(mock.invalid_frees(), 1);
    }

    #[test]
    fn test_open_slot_creates_output_module() {
        let mut mock = MockEngine::new();
        assert_eq!(mock.call(EntryPoint::OpenSlot, &[0]).unwrap(), 0);
        assert_eq!(mock.call(EntryPoint::GetNumberOfModules, &[0]).unwrap(), 1);
        let flags = mock.call(EntryPoint::GetModuleFlags, &[0, 0]).unwrap();
        assert_eq!(flags & 1, 1);
        assert_eq!(mock.call(EntryPoint::OpenSlot, &[99]).unwrap(), -1);
    }

    #[test]
    fn test_close_slot_releases_engine_memory() {
        let mut mock = MockEngine::new();
        mock.call(EntryPoint::OpenSlot, &[1]).unwrap();
        assert!(mock.engine_allocations() > 0);
        mock.call(EntryPoint::CloseSlot, &[1]).unwrap();
        assert_eq!(mock.engine_allocations(), 0);
    }

    #[test]
    fn test_structural_calls_need_the_lock() {
        let mut mock = MockEngine::new();
        let threaded = (InitFlags::USER_AUDIO_CALLBACK | InitFlags::AUDIO_FLOAT32).bits() as i32;
        mock.call(EntryPoint::Init, &[0, 44100, 2, threaded]).unwrap();
        mock.call(EntryPoint::OpenSlot, &[0]).unwrap();
        let new_pattern = [0, -1, 0, 0, 4, 16, 0, 0];

        assert_eq!(mock.call(EntryPoint::NewPattern, &new_pattern).unwrap(), -1);
        assert_eq!(mock.call(EntryPoint::GetNumberOfPatterns, &[0]).unwrap(), 0);

        mock.call(EntryPoint::LockSlot, &[0]).unwrap();
        assert_eq!(mock.call(EntryPoint::NewPattern, &new_pattern).unwrap(), 0);
        mock.call(EntryPoint::UnlockSlot, &[0]).unwrap();
        assert_eq!(mock.call(EntryPoint::SetPatternXy, &[0, 0, 8, 1]).unwrap(), -1);
        assert_eq!(mock.call(EntryPoint::GetPatternX, &[0, 0]).unwrap(), 0);

        mock.set_lock_checks(false);
        assert_eq!(mock.call(EntryPoint::RemovePattern, &[0, 0]).unwrap(), 0);
    }

    #[test]
    fn test_failure_injection() {
        let mut mock = MockEngine::new();
        mock.fail_allocations_after(2);
        assert!(!mock.malloc(4).unwrap().is_null());
        assert!(!mock.malloc(4).unwrap().is_null());
        assert!(mock.malloc(4).unwrap().is_null());
        assert_eq!(mock.malloc_count(), 3);
    }
}

//! # sv-bridge
//!
//! Host-side boundary layer for a modular synthesizer engine that lives in
//! foreign memory, typically an engine compiled to WebAssembly.
//!
//! The engine exposes a flat table of `sv_*` entry points that take and
//! return 32-bit integers. Strings, blobs and sample buffers cross the
//! boundary as addresses into the engine's linear memory. This crate owns
//! that marshalling: it allocates foreign memory for every argument, frees it
//! on every path, decodes engine-owned results and keeps the long-lived
//! render, oscilloscope and curve buffers.
//!
//! ## Layers
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | Boundary | [`engine`] | raw allocator, memory view, entry-point calls |
//! | Ownership | [`memory`] | owned handles, per-call scopes |
//! | Marshalling | [`marshal`] | strings, blobs, length cells |
//! | Buffers | [`buffers`] | render/scope/curve buffers reused across calls |
//! | Data | [`pattern`], [`flags`] | event records, zero-copy views, bit fields |
//! | Facade | [`session`] | one typed method per entry point, lock tracking |
//! | Runtime | `wasm` | wasmtime host implementing [`Boundary`] |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sv_bridge::{Bridge, EngineOptions, SamplesMut, WasmConfig, WasmRuntime};
//!
//! let runtime = WasmRuntime::new(WasmConfig::realtime())?;
//! let module = runtime.load_engine("sunvox.wasm")?;
//! let mut bridge = Bridge::new(runtime.instantiate(&module)?);
//!
//! bridge.init(&EngineOptions::offline_float32())?;
//! bridge.open_slot(0)?;
//! bridge.load(0, &std::fs::read("song.sunvox")?)?;
//! bridge.play_from_beginning(0)?;
//!
//! let mut out = vec![0.0f32; 2 * 1024];
//! bridge.render(SamplesMut::Float32(&mut out), 1024, 0, 0, None)?;
//! ```
//!
//! ## Features
//!
//! - `wasm` (default) - wasmtime backend
//! - `mock` - `engine::mock::MockEngine`, an in-process engine double for tests

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod buffers;
pub mod config;
pub mod engine;
pub mod error;
pub mod flags;
pub mod marshal;
pub mod memory;
pub mod pattern;
pub mod session;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export main types
pub use buffers::{CallbackBuffers, CurveMode, InputStream, Samples, SamplesMut};
pub use config::{BridgeConfig, EngineOptions, ExportNames, WasiCapabilities, WasmConfig};
pub use engine::{Boundary, EntryPoint, ForeignAddr};
pub use error::{BridgeError, Result};
pub use flags::{AudioFormat, InitFlags, ModuleFlags, NoteCmd, SampleWidth, TimeMapKind};
pub use memory::{CallScope, Handle};
pub use pattern::{EventPatch, EventRecord, LinkView, PatternView};
pub use session::{Bridge, SlotGuard};

#[cfg(feature = "wasm")]
pub use wasm::{EngineModule, WasmEngine, WasmRuntime};

//! WebAssembly engine backend.
//!
//! Hosts an engine compiled to WebAssembly in wasmtime and exposes it as a
//! [`Boundary`](crate::engine::Boundary): linear memory is the foreign memory
//! region, the module's `malloc`/`free` exports are the foreign allocator and
//! every `sv_*` export is an entry point.
//!
//! ## Isolation
//!
//! - **Memory**: the engine only sees its own linear memory, capped by
//!   [`WasmConfig::max_memory`](crate::WasmConfig)
//! - **Deny-by-default WASI**: preview1 imports are linked only when
//!   [`WasiCapabilities::link`](crate::WasiCapabilities) is set; stdio,
//!   directories and environment each need explicit grants
//! - **Fuel**: with a fuel limit, every entry-point call gets a fresh budget
//!   and a runaway call traps instead of hanging the host
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sv_bridge::{Bridge, EngineOptions, WasmConfig, WasmRuntime};
//!
//! let runtime = WasmRuntime::new(WasmConfig::realtime())?;
//! let module = runtime.load_engine("sunvox.wasm")?;
//! let mut bridge = Bridge::new(runtime.instantiate(&module)?);
//! bridge.init(&EngineOptions::offline_float32())?;
//! ```

mod runtime;

pub use runtime::{EngineHostState, EngineModule, WasmEngine, WasmRuntime};

#[cfg(test)]
mod tests;

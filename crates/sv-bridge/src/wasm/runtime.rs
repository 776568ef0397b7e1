//! wasmtime host for an engine compiled to WebAssembly.
//!
//! Uses wasmtime-wasi preview1 for engines built against a WASI libc.

use crate::config::{WasiCapabilities, WasmConfig};
use crate::engine::{Boundary, EntryPoint, ForeignAddr};
use crate::error::{BridgeError, Result};

use std::collections::HashMap;
use std::path::Path;

use wasmtime::*;

/// Host state for the engine's store.
pub struct EngineHostState {
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
}

impl EngineHostState {
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// Compiles and instantiates engine modules.
pub struct WasmRuntime {
    engine: Engine,
    config: WasmConfig,
}

/// A compiled engine module.
pub struct EngineModule {
    module: Module,
    name: String,
}

/// An exported function with its parameter and result counts.
#[derive(Clone)]
struct ExportedFunc {
    func: Func,
    params: usize,
    results: usize,
}

/// An instantiated engine; implements [`Boundary`] over its linear memory.
pub struct WasmEngine {
    store: Store<EngineHostState>,
    instance: Instance,
    memory: Memory,
    malloc: ExportedFunc,
    free: ExportedFunc,
    entries: HashMap<EntryPoint, ExportedFunc>,
    fuel_limit: Option<u64>,
    name: String,
}

fn wasm_err(what: &str, e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Wasm(format!("{}: {}", what, e))
}

impl WasmRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });
        engine_config.wasm_simd(config.enable_simd);
        engine_config.wasm_threads(config.enable_threads);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config).map_err(|e| wasm_err("engine creation failed", e))?;

        Ok(Self { engine, config })
    }

    /// Compile an engine from a `.wasm` (or `.wat`) file.
    pub fn load_engine(&self, path: impl AsRef<Path>) -> Result<EngineModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path).map_err(|e| wasm_err("module load failed", e))?;
        tracing::info!(engine = %name, path = %path.display(), "compiled engine module");

        Ok(EngineModule { module, name })
    }

    /// Compile an engine from bytes (binary or text format).
    pub fn load_engine_bytes(&self, name: &str, bytes: &[u8]) -> Result<EngineModule> {
        let module = Module::new(&self.engine, bytes).map_err(|e| wasm_err("module creation failed", e))?;

        Ok(EngineModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate a compiled engine.
    ///
    /// Fails with [`BridgeError::MissingExport`] if the module lacks its
    /// memory or allocator exports. Entry points are resolved on first use.
    pub fn instantiate(&self, module: &EngineModule) -> Result<WasmEngine> {
        let host_state = self.build_host_state(&self.config.capabilities)?;
        let mut store = Store::new(&self.engine, host_state);

        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store.set_fuel(fuel).map_err(|e| wasm_err("fuel setup failed", e))?;
        }

        let mut linker: Linker<EngineHostState> = Linker::new(&self.engine);
        if self.config.capabilities.link {
            wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
                .map_err(|e| wasm_err("WASI link failed", e))?;
        }

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| wasm_err("instantiation failed", e))?;

        let names = &self.config.exports;
        let memory = instance
            .get_memory(&mut store, &names.memory)
            .ok_or_else(|| BridgeError::MissingExport(names.memory.clone()))?;
        let malloc = lookup(&instance, &mut store, &names.malloc)?;
        let free = lookup(&instance, &mut store, &names.free)?;

        tracing::info!(
            engine = %module.name,
            memory_bytes = memory.data_size(&store),
            metered = self.config.fuel_limit.is_some(),
            "engine instantiated"
        );

        Ok(WasmEngine {
            store,
            instance,
            memory,
            malloc,
            free,
            entries: HashMap::new(),
            fuel_limit: self.config.fuel_limit,
            name: module.name.clone(),
        })
    }

    fn build_host_state(&self, caps: &WasiCapabilities) -> Result<EngineHostState> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }

        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }

        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| wasm_err(&format!("failed to open dir {:?}", dir), e))?;
        }

        let preview1 = builder.build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        Ok(EngineHostState { preview1, limits })
    }

    /// The runtime configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

fn lookup(instance: &Instance, store: &mut Store<EngineHostState>, name: &str) -> Result<ExportedFunc> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
    let ty = func.ty(&*store);
    let params = ty.params().len();
    let results = ty.results().len();
    Ok(ExportedFunc { func, params, results })
}

impl EngineModule {
    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }

    /// Entry points this module does not export.
    pub fn missing_entry_points(&self) -> Vec<EntryPoint> {
        let exported: Vec<&str> = self.exports().collect();
        EntryPoint::ALL
            .iter()
            .copied()
            .filter(|entry| !exported.contains(&entry.name()))
            .collect()
    }
}

impl WasmEngine {
    /// Module name the engine was compiled from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remaining fuel of the current call budget (if metered).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    fn export(&mut self, entry: EntryPoint) -> Result<ExportedFunc> {
        if let Some(export) = self.entries.get(&entry) {
            return Ok(export.clone());
        }
        let export = lookup(&self.instance, &mut self.store, entry.name())?;
        self.entries.insert(entry, export.clone());
        Ok(export)
    }

    fn invoke(&mut self, name: &str, export: &ExportedFunc, args: &[i32]) -> Result<i32> {
        if export.params != args.len() {
            return Err(BridgeError::Wasm(format!(
                "{} takes {} arguments, got {}",
                name,
                export.params,
                args.len()
            )));
        }
        if let Some(fuel) = self.fuel_limit {
            self.store.set_fuel(fuel).map_err(|e| wasm_err("refuel failed", e))?;
        }

        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = vec![Val::I32(0); export.results];
        export
            .func
            .call(&mut self.store, &params, &mut results)
            .map_err(|e| wasm_err(&format!("{} trapped", name), e))?;

        match results.first() {
            None => Ok(0),
            Some(val) => val
                .i32()
                .ok_or_else(|| BridgeError::Wasm(format!("{} returned a non-i32 value", name))),
        }
    }
}

impl Boundary for WasmEngine {
    fn malloc(&mut self, bytes: u32) -> Result<ForeignAddr> {
        let export = self.malloc.clone();
        self.invoke("malloc", &export, &[bytes as i32]).map(ForeignAddr::from_ret)
    }

    fn free(&mut self, addr: ForeignAddr) -> Result<()> {
        if addr.is_null() {
            return Ok(());
        }
        let export = self.free.clone();
        self.invoke("free", &export, &[addr.arg()]).map(drop)
    }

    fn call(&mut self, entry: EntryPoint, args: &[i32]) -> Result<i32> {
        let export = self.export(entry)?;
        self.invoke(entry.name(), &export, args)
    }

    fn memory(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }
}

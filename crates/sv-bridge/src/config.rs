//! Configuration for the bridge and the WebAssembly engine host.
//!
//! Everything here is plain serde data so a host can keep it in a JSON file:
//!
//! ```json
//! {
//!   "engine": { "sample_rate": 48000, "channels": 2, "flags": 26 },
//!   "runtime": { "max_memory": 134217728, "fuel_limit": null }
//! }
//! ```
//!
//! Missing fields take their defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::flags::InitFlags;

/// Arguments for `sv_init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Engine config string (`"buffer=1024|audiodriver=alsa"` style); `None` passes null
    pub config: Option<String>,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Output channel count
    pub channels: u32,

    /// Init flags
    pub flags: InitFlags,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::offline_float32()
    }
}

impl EngineOptions {
    /// Host-driven rendering, stereo float32 at 44.1 kHz, single thread.
    pub fn offline_float32() -> Self {
        Self {
            config: None,
            sample_rate: 44100,
            channels: 2,
            flags: InitFlags::NO_DEBUG_OUTPUT
                | InitFlags::USER_AUDIO_CALLBACK
                | InitFlags::AUDIO_FLOAT32
                | InitFlags::ONE_THREAD,
        }
    }

    /// Host-driven rendering, stereo int16 at 44.1 kHz, single thread.
    pub fn offline_int16() -> Self {
        Self {
            flags: InitFlags::NO_DEBUG_OUTPUT
                | InitFlags::USER_AUDIO_CALLBACK
                | InitFlags::AUDIO_INT16
                | InitFlags::ONE_THREAD,
            ..Self::offline_float32()
        }
    }

    /// Builder: set sample rate
    pub fn sample_rate(mut self, hz: u32) -> Self {
        self.sample_rate = hz;
        self
    }

    /// Builder: set channel count
    pub fn channels(mut self, channels: u32) -> Self {
        self.channels = channels;
        self
    }

    /// Builder: set init flags
    pub fn flags(mut self, flags: InitFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builder: set the engine config string
    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }
}

/// WASI grants for the engine instance.
///
/// Engines built without a libc shim need no WASI imports at all; leave
/// `link` off for those.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Link the WASI preview1 imports
    pub link: bool,

    /// Inherit stdout (engine debug output)
    pub stdout: bool,

    /// Inherit stderr
    pub stderr: bool,

    /// Directories to pre-open read-only (sample libraries, projects)
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,
}

impl WasiCapabilities {
    /// No WASI at all
    pub fn none() -> Self {
        Self::default()
    }

    /// WASI linked with nothing granted
    pub fn linked() -> Self {
        Self {
            link: true,
            ..Default::default()
        }
    }

    /// WASI linked with stdout/stderr inherited
    pub fn with_stdio() -> Self {
        Self {
            link: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: inherit stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: inherit stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory (implies `link`)
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.link = true;
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

/// Names of the non-`sv_*` exports the bridge needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportNames {
    /// Linear memory
    pub memory: String,
    /// Allocator
    pub malloc: String,
    /// Deallocator
    pub free: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            memory: "memory".to_string(),
            malloc: "malloc".to_string(),
            free: "free".to_string(),
        }
    }
}

/// Runtime limits and features for the wasmtime host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// WASI grants
    pub capabilities: WasiCapabilities,

    /// Maximum linear memory in bytes
    pub max_memory: usize,

    /// Fuel granted to every entry-point call (`None` = unmetered)
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Enable the threads proposal (shared memory engines)
    pub enable_threads: bool,

    /// wasmtime cache config file for compiled modules
    pub cache_path: Option<PathBuf>,

    /// Export names of memory and allocator
    pub exports: ExportNames,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 256 * 1024 * 1024, // 256 MB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            enable_threads: false,
            cache_path: None,
            exports: ExportNames::default(),
        }
    }
}

impl WasmConfig {
    /// Tight limits for untrusted engine builds
    pub fn minimal() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: Some(1_000_000_000),
            ..Default::default()
        }
    }

    /// Unmetered, fully optimized; for render loops
    pub fn realtime() -> Self {
        Self {
            max_memory: 512 * 1024 * 1024, // sample-heavy projects
            optimization_level: 2,
            enable_simd: true,
            ..Default::default()
        }
    }

    /// Fast compilation and engine output on the console
    pub fn development() -> Self {
        Self {
            capabilities: WasiCapabilities::with_stdio(),
            optimization_level: 0,
            ..Default::default()
        }
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set per-call fuel
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Builder: set allocator export names
    pub fn allocator(mut self, malloc: impl Into<String>, free: impl Into<String>) -> Self {
        self.exports.malloc = malloc.into();
        self.exports.free = free.into();
        self
    }
}

/// Top-level configuration: engine init arguments plus runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// `sv_init` arguments
    pub engine: EngineOptions,
    /// wasmtime host settings
    pub runtime: WasmConfig,
}

impl BridgeConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.sample_rate == 0 {
            return Err(BridgeError::Config("sample_rate must be positive".into()));
        }
        if self.engine.channels == 0 {
            return Err(BridgeError::Config("channels must be positive".into()));
        }
        let flags = self.engine.flags;
        if flags.contains(InitFlags::AUDIO_INT16) && flags.contains(InitFlags::AUDIO_FLOAT32) {
            return Err(BridgeError::Config(
                "AUDIO_INT16 and AUDIO_FLOAT32 are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

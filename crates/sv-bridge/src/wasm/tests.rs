//! Tests for the wasmtime engine backend.

use super::*;
use crate::config::{WasiCapabilities, WasmConfig};
use crate::engine::{Boundary, EntryPoint, ForeignAddr};
use crate::error::BridgeError;

const ALLOCATOR_ONLY: &str = r#"
(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (func (export "malloc") (param $n i32) (result i32)
    (local $a i32)
    (local.set $a (global.get $heap))
    (global.set $heap (i32.add (local.get $a) (local.get $n)))
    (local.get $a))
  (func (export "free") (param i32))
  (func (export "sv_get_ticks") (result i32) (i32.const 7))
  (func (export "sv_open_slot") (param i32) (result i32) (i32.const 0))
)
"#;

const NO_MEMORY: &str = r#"
(module
  (func (export "malloc") (param i32) (result i32) (i32.const 0))
  (func (export "free") (param i32))
)
"#;

const RENAMED_ALLOCATOR: &str = r#"
(module
  (memory (export "mem") 1)
  (func (export "sv_malloc") (param i32) (result i32) (i32.const 64))
  (func (export "sv_free") (param i32))
)
"#;

fn instantiate(config: WasmConfig, wat: &str) -> crate::Result<WasmEngine> {
    let runtime = WasmRuntime::new(config)?;
    let module = runtime.load_engine_bytes("test", wat.as_bytes())?;
    runtime.instantiate(&module)
}

#[test]
fn test_runtime_creation() {
    assert!(WasmRuntime::new(WasmConfig::default()).is_ok());
    assert!(WasmRuntime::new(WasmConfig::minimal()).is_ok());
    assert!(WasmRuntime::new(WasmConfig::development()).is_ok());
}

#[test]
fn test_call_and_memory() {
    let mut engine = instantiate(WasmConfig::default(), ALLOCATOR_ONLY).unwrap();
    assert_eq!(engine.name(), "test");
    assert_eq!(engine.call(EntryPoint::GetTicks, &[]).unwrap(), 7);

    let addr = engine.malloc(4).unwrap();
    assert_eq!(addr, ForeignAddr(1024));
    engine.write(addr, b"abc\0").unwrap();
    assert_eq!(engine.read_cstr(addr).unwrap(), b"abc");
    assert_eq!(engine.memory().len(), 65536);
    engine.free(addr).unwrap();
}

#[test]
fn test_missing_entry_point() {
    let mut engine = instantiate(WasmConfig::default(), ALLOCATOR_ONLY).unwrap();
    let err = engine.call(EntryPoint::Play, &[0]).unwrap_err();
    assert!(matches!(err, BridgeError::MissingExport(ref name) if name == "sv_play"));
}

#[test]
fn test_argument_count_is_checked() {
    let mut engine = instantiate(WasmConfig::default(), ALLOCATOR_ONLY).unwrap();
    let err = engine.call(EntryPoint::OpenSlot, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::Wasm(_)));
    assert_eq!(engine.call(EntryPoint::OpenSlot, &[0]).unwrap(), 0);
}

#[test]
fn test_missing_memory_export() {
    let err = instantiate(WasmConfig::default(), NO_MEMORY).err().unwrap();
    assert!(matches!(err, BridgeError::MissingExport(ref name) if name == "memory"));
}

#[test]
fn test_custom_export_names() {
    let mut config = WasmConfig::default().allocator("sv_malloc", "sv_free");
    config.exports.memory = "mem".to_string();
    let mut engine = instantiate(config, RENAMED_ALLOCATOR).unwrap();
    assert_eq!(engine.malloc(8).unwrap(), ForeignAddr(64));

    let err = instantiate(WasmConfig::default(), RENAMED_ALLOCATOR).err().unwrap();
    assert!(matches!(err, BridgeError::MissingExport(_)));
}

#[test]
fn test_missing_entry_points_listed() {
    let runtime = WasmRuntime::new(WasmConfig::default()).unwrap();
    let module = runtime.load_engine_bytes("test", ALLOCATOR_ONLY.as_bytes()).unwrap();
    let missing = module.missing_entry_points();
    assert!(missing.contains(&EntryPoint::Init));
    assert!(!missing.contains(&EntryPoint::GetTicks));
    assert_eq!(missing.len(), EntryPoint::ALL.len() - 2);
}

#[test]
fn test_wasi_link_is_opt_in() {
    let wasi_import = r#"
    (module
      (import "wasi_snapshot_preview1" "proc_exit" (func (param i32)))
      (memory (export "memory") 1)
      (func (export "malloc") (param i32) (result i32) (i32.const 8))
      (func (export "free") (param i32))
    )
    "#;
    assert!(matches!(
        instantiate(WasmConfig::default(), wasi_import).err(),
        Some(BridgeError::Wasm(_))
    ));
    let linked = WasmConfig::default().capabilities(WasiCapabilities::linked());
    assert!(instantiate(linked, wasi_import).is_ok());
}

#[test]
fn test_fuel_is_per_call() {
    let config = WasmConfig::default().fuel_limit(10_000);
    let mut engine = instantiate(config, ALLOCATOR_ONLY).unwrap();
    for _ in 0..1000 {
        assert_eq!(engine.call(EntryPoint::GetTicks, &[]).unwrap(), 7);
    }
    assert!(engine.remaining_fuel().unwrap() > 0);
}

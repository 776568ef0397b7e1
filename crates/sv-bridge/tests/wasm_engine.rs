//! Integration tests for the bridge over a real wasmtime instance.
//!
//! Tests load `tiny_engine.wat`, a hand-written engine exporting a subset of
//! the entry-point table, and drive it through the typed facade.

#![cfg(feature = "wasm")]

use sv_bridge::{
    Boundary, Bridge, BridgeError, EngineOptions, EntryPoint, EventRecord, SamplesMut, WasmConfig, WasmEngine,
    WasmRuntime,
};

const ENGINE_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/tiny_engine.wat");

fn engine(config: WasmConfig) -> WasmEngine {
    let runtime = WasmRuntime::new(config).expect("failed to create runtime");
    let module = runtime.load_engine(ENGINE_PATH).expect("failed to load engine");
    assert_eq!(module.name(), "tiny_engine");
    runtime.instantiate(&module).expect("failed to instantiate")
}

fn bridge() -> Bridge<WasmEngine> {
    let mut bridge = Bridge::new(engine(WasmConfig::default()));
    let version = bridge.init(&EngineOptions::offline_float32()).expect("init failed");
    assert_eq!(version, 0x20100);
    bridge.open_slot(0).expect("open_slot failed");
    bridge
}

#[test]
fn test_exports() {
    let runtime = WasmRuntime::new(WasmConfig::default()).expect("failed to create runtime");
    let module = runtime.load_engine(ENGINE_PATH).expect("failed to load engine");
    let exports: Vec<&str> = module.exports().collect();
    assert!(exports.contains(&"sv_init"));
    assert!(exports.contains(&"malloc"));
    let missing = module.missing_entry_points();
    assert!(missing.contains(&EntryPoint::Stop));
    assert!(!missing.contains(&EntryPoint::AudioCallback));
}

#[test]
fn test_render_through_linear_memory() {
    let mut bridge = bridge();
    let mut out = vec![0.0f32; 2 * 128];
    let status = bridge
        .render(SamplesMut::Float32(&mut out), 128, 0, 0, None)
        .expect("render failed");
    assert_eq!(status, 1);
    assert!(out.iter().all(|&s| s == 0.5));
    assert_eq!(bridge.sample_rate().unwrap(), 44100);
}

#[test]
fn test_engine_owned_string() {
    let mut bridge = bridge();
    assert_eq!(bridge.song_name(0).unwrap().as_deref(), Some("wat song"));
    // Engine-owned: reading it twice must give the same bytes.
    assert_eq!(bridge.song_name(0).unwrap().as_deref(), Some("wat song"));
}

#[test]
fn test_save_load_round_trip() {
    let mut bridge = bridge();
    let project: Vec<u8> = (0u8..=255).cycle().take(1500).collect();
    bridge.load(0, &project).expect("load failed");
    assert_eq!(bridge.save(0).expect("save failed"), Some(project));

    let err = bridge.load(0, &vec![0u8; 4096]).unwrap_err();
    assert!(matches!(err, BridgeError::Engine { entry: EntryPoint::LoadFromMemory, code: -1 }));
}

#[test]
fn test_allocator_exhaustion() {
    let mut bridge = bridge();
    let err = bridge.load(0, &vec![0u8; 70_000]).unwrap_err();
    assert!(matches!(err, BridgeError::Alloc { bytes: 70_000 }));
    assert_eq!(err.status(), -1);
}

#[test]
fn test_find_not_found() {
    let mut bridge = bridge();
    assert_eq!(bridge.find_module(0, "Anything").unwrap(), None);
}

#[test]
fn test_pattern_view_decodes_engine_bytes() {
    let mut bridge = bridge();
    let view = bridge.pattern_data(0, 0).expect("pattern_data failed");
    assert_eq!(view.len(), 1);
    let event = view.event(0, 0).expect("no event");
    assert_eq!(
        event,
        EventRecord {
            note: 0x3D,
            velocity: 0x40,
            module: 2,
            ctl: 0x0201,
            ctl_val: 0x8000,
        }
    );
    assert_eq!(event.module_index(), Some(1));
}

#[test]
fn test_missing_entry_point_is_reported() {
    let mut bridge = bridge();
    let err = bridge.stop(0).unwrap_err();
    assert!(matches!(err, BridgeError::MissingExport(ref name) if name == "sv_stop"));
    assert_eq!(err.status(), -1);
}

#[test]
fn test_slot_guard_over_wasm() {
    let mut bridge = bridge();
    let guard = bridge.lock(0).expect("lock failed");
    assert_eq!(guard.slot(), 0);
    guard.unlock().expect("unlock failed");
    assert_eq!(bridge.lock_depth(0), 0);
}

#[test]
fn test_fuel_stops_runaway_call() {
    let mut bridge = Bridge::new(engine(WasmConfig::default().fuel_limit(1_000_000)));
    bridge.init(&EngineOptions::offline_float32()).expect("init failed");

    let err = bridge.play(0).unwrap_err();
    assert!(matches!(err, BridgeError::Wasm(_)), "unexpected error: {}", err);

    // The next call gets a fresh budget.
    assert_eq!(bridge.sample_rate().unwrap(), 44100);
    assert!(bridge.boundary().remaining_fuel().unwrap() > 0);
}

#[test]
fn test_memory_view_matches_boundary_reads() {
    let mut engine = engine(WasmConfig::default());
    let addr = engine.malloc(8).unwrap();
    engine.write(addr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert_eq!(engine.read_u32(addr).unwrap(), 0x0403_0201);
    assert!(engine.read(addr, usize::MAX).is_err());
}

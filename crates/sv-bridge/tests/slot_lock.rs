//! Slot lock discipline under a concurrently running audio thread.
//!
//! The engine double renders on its own thread and reads the module graph
//! under the slot lock. A structural mutation leaves the graph inconsistent
//! for a short while; the audio thread counts every read that lands inside
//! such a window.

use std::time::{Duration, Instant};

use sv_bridge::engine::mock::MockEngine;
use sv_bridge::{Bridge, EngineOptions, InitFlags};

const DEADLINE: Duration = Duration::from_secs(10);

fn threaded_bridge() -> Bridge<MockEngine> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sv_bridge=error")
        .try_init();
    let options = EngineOptions::offline_float32().flags(InitFlags::USER_AUDIO_CALLBACK | InitFlags::AUDIO_FLOAT32);
    let mut bridge = Bridge::new(MockEngine::new());
    bridge.init(&options).expect("init failed");
    bridge.open_slot(0).expect("open_slot failed");
    bridge.boundary_mut().set_mutation_delay(Duration::from_micros(200));
    bridge
}

fn mutate(bridge: &mut Bridge<MockEngine>) {
    let m = bridge
        .new_module(0, "Generator", "Churn", 0, 0, 0)
        .expect("new_module failed");
    bridge.connect_module(0, m, 0).expect("connect failed");
    bridge.remove_module(0, m).expect("remove failed");
}

#[test]
fn test_unlocked_mutation_races_with_render() {
    let mut bridge = threaded_bridge();
    // Let unlocked mutations through so the race can be observed.
    bridge.boundary_mut().set_lock_checks(false);
    let audio = bridge.boundary().spawn_audio_thread(0).expect("no audio thread");

    let start = Instant::now();
    while audio.stats().torn_reads() == 0 && start.elapsed() < DEADLINE {
        mutate(&mut bridge);
    }
    let stats = audio.stop();

    assert!(stats.torn_reads() > 0, "expected the audio thread to observe a half-applied mutation");
    assert!(bridge.lock_violations() > 0);
}

#[test]
fn test_locked_mutation_is_never_observed() {
    let mut bridge = threaded_bridge();
    let audio = bridge.boundary().spawn_audio_thread(0).expect("no audio thread");

    let start = Instant::now();
    let mut rounds = 0;
    while (rounds < 200 || audio.stats().reads() < 100) && start.elapsed() < DEADLINE {
        {
            let mut slot = bridge.lock(0).expect("lock failed");
            mutate(&mut slot);
        }
        rounds += 1;
        std::thread::sleep(Duration::from_micros(50));
    }
    let stats = audio.stop();

    assert!(stats.reads() > 0, "audio thread never ran");
    assert_eq!(stats.torn_reads(), 0);
    assert_eq!(bridge.lock_violations(), 0);
    assert_eq!(bridge.lock_depth(0), 0);
}

#[test]
fn test_one_thread_mode_needs_no_lock() {
    let mut bridge = Bridge::new(MockEngine::new());
    bridge.init(&EngineOptions::offline_float32()).expect("init failed");
    bridge.open_slot(0).expect("open_slot failed");
    mutate(&mut bridge);
    assert_eq!(bridge.lock_violations(), 0);
}

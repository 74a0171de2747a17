//! Cross-thread entry points: executor ordering and timer behavior.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spillway::{Config, Runtime};

fn client_only_runtime() -> Runtime {
    let config = Config::builder()
        .host("127.0.0.1")
        .port(0)
        .client_initializer(|_pipeline| {})
        .build()
        .unwrap();
    Runtime::start(config).unwrap()
}

#[test]
fn execute_preserves_submission_order() {
    let runtime = client_only_runtime();
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = Arc::clone(&order);
        runtime.execute(move || order.lock().unwrap().push(i));
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while order.lock().unwrap().len() < 100 {
        assert!(Instant::now() < deadline, "tasks did not all run");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn execute_on_loop_thread_runs_inline() {
    let runtime = client_only_runtime();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let outer_log = Arc::clone(&log);
    let handle = runtime.handle();
    runtime.execute(move || {
        outer_log.lock().unwrap().push("outer-start");
        let inner_log = Arc::clone(&outer_log);
        // Already on the loop thread: this must run before we return.
        handle.execute(move || inner_log.lock().unwrap().push("inner"));
        outer_log.lock().unwrap().push("outer-end");
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while log.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "tasks did not run");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*log.lock().unwrap(), ["outer-start", "inner", "outer-end"]);
}

#[test]
fn one_shot_timer_fires_once_at_or_after_deadline() {
    let runtime = client_only_runtime();
    let fires: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let scheduled_at = Instant::now();
    let timer_fires = Arc::clone(&fires);
    runtime.schedule(Duration::from_millis(100), None, move || {
        timer_fires.lock().unwrap().push(Instant::now());
    });

    std::thread::sleep(Duration::from_millis(600));
    let fires = fires.lock().unwrap();
    assert_eq!(fires.len(), 1);
    assert!(fires[0] >= scheduled_at + Duration::from_millis(100));
}

#[test]
fn periodic_timer_repeats_until_cancelled() {
    let runtime = client_only_runtime();
    let fires: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let scheduled_at = Instant::now();
    let timer_fires = Arc::clone(&fires);
    let handle = runtime.schedule(
        Duration::from_millis(50),
        Some(Duration::from_millis(50)),
        move || timer_fires.lock().unwrap().push(Instant::now()),
    );

    let deadline = Instant::now() + Duration::from_secs(3);
    while fires.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "periodic timer stalled");
        std::thread::sleep(Duration::from_millis(10));
    }
    handle.cancel();

    {
        let fires = fires.lock().unwrap();
        for (i, at) in fires.iter().take(3).enumerate() {
            let min = scheduled_at + Duration::from_millis(50) * (i as u32 + 1);
            assert!(*at >= min, "firing {i} arrived before {min:?}");
        }
    }

    // Cancellation is lazy but must stick.
    std::thread::sleep(Duration::from_millis(200));
    let settled = fires.lock().unwrap().len();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fires.lock().unwrap().len(), settled);
}

#[test]
fn shutdown_is_idempotent() {
    let mut runtime = client_only_runtime();
    runtime.shutdown();
    runtime.shutdown();
    runtime.join();
    // Dropping after an explicit shutdown+join must also be fine.
}

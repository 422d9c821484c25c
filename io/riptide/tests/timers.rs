//! Timer queue behavior: ordering, repetition, cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use riptide::{Config, EventLoopThread, TimerId};

fn spawn_loop(name: &str) -> EventLoopThread {
    EventLoopThread::spawn(name, Config::default(), None).expect("loop thread")
}

/// Firing log: (label, observed offset from t0).
type Log = Arc<Mutex<Vec<(&'static str, Duration)>>>;

fn record(log: &Log, t0: Instant, label: &'static str) {
    log.lock().push((label, t0.elapsed()));
}

#[test]
fn one_shot_and_repeating_interleave_in_order() {
    let lt = spawn_loop("timers-order");
    let handle = lt.handle().clone();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let repeater_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    // Schedule everything from the loop thread against a shared t0:
    //   a: one-shot at t0+100ms
    //   b: repeating every 50ms, first firing at t0+60ms
    //   c: one-shot at t0+200ms
    //   cancel(b) at t0+170ms
    // Expected: b@60 a@100 b@110 b@160 c@200, and nothing after.
    let h = handle.clone();
    let setup_log = log.clone();
    let setup_id = repeater_id.clone();
    handle.run_in_loop(move || {
        let t0 = Instant::now();
        {
            let log = setup_log.clone();
            h.run_after(Duration::from_millis(100), move || record(&log, t0, "a"));
        }
        {
            let log = setup_log.clone();
            h.run_after(Duration::from_millis(200), move || record(&log, t0, "c"));
        }
        {
            let h2 = h.clone();
            let log = setup_log.clone();
            let slot = setup_id.clone();
            h.run_after(Duration::from_millis(10), move || {
                let log = log.clone();
                let id = h2.run_every(Duration::from_millis(50), move || record(&log, t0, "b"));
                *slot.lock() = Some(id);
            });
        }
        {
            let h2 = h.clone();
            let slot = setup_id.clone();
            h.run_after(Duration::from_millis(170), move || {
                if let Some(id) = *slot.lock() {
                    h2.cancel(id);
                }
            });
        }
    });

    std::thread::sleep(Duration::from_millis(350));

    let events = log.lock().clone();
    let labels: Vec<&str> = events.iter().map(|(l, _)| *l).collect();
    assert_eq!(
        labels,
        vec!["b", "a", "b", "b", "c"],
        "got {events:?}"
    );

    // Offsets are approximate (scheduling jitter), order above is exact.
    let expected = [60u64, 100, 110, 160, 200];
    for ((_, offset), want_ms) in events.iter().zip(expected) {
        let want = Duration::from_millis(want_ms);
        let slack = Duration::from_millis(40);
        assert!(
            *offset + slack > want && *offset < want + slack,
            "offset {offset:?} not within {slack:?} of {want:?} ({events:?})"
        );
    }
}

#[test]
fn cancel_before_expiry_never_fires() {
    let lt = spawn_loop("timers-cancel");
    let handle = lt.handle().clone();
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let id = handle.run_after(Duration::from_millis(50), move || {
        f.fetch_add(1, Ordering::SeqCst);
    });
    handle.cancel(id);

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_from_own_callback_stops_repetition() {
    let lt = spawn_loop("timers-self-cancel");
    let handle = lt.handle().clone();
    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let f = fired.clone();
    let slot = id_slot.clone();
    let h = handle.clone();
    let id = handle.run_every(Duration::from_millis(20), move || {
        let n = f.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 2 {
            let id = slot.lock().take().expect("id published before second fire");
            h.cancel(id);
        }
    });
    *id_slot.lock() = Some(id);

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn cancel_of_expired_one_shot_is_noop() {
    let lt = spawn_loop("timers-late-cancel");
    let handle = lt.handle().clone();
    let (tx, rx) = mpsc::channel();

    let id = handle.run_after(Duration::from_millis(10), move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    handle.cancel(id);
}

#[test]
fn run_at_in_the_past_fires_promptly() {
    let lt = spawn_loop("timers-past");
    let handle = lt.handle().clone();
    let (tx, rx) = mpsc::channel();

    let started = Instant::now();
    handle.run_at(Instant::now() - Duration::from_secs(1), move || {
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn repeating_timer_keeps_its_interval() {
    let lt = spawn_loop("timers-interval");
    let handle = lt.handle().clone();
    let log: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let l = log.clone();
    let id = handle.run_every(Duration::from_millis(40), move || {
        l.lock().push(Instant::now());
    });

    std::thread::sleep(Duration::from_millis(240));
    handle.cancel(id);
    let stamps = log.lock().clone();
    assert!(stamps.len() >= 4, "expected >= 4 fires, got {}", stamps.len());
    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap > Duration::from_millis(20) && gap < Duration::from_millis(100),
            "fire gap {gap:?} strayed from the 40ms interval"
        );
    }
}

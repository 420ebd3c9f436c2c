#![cfg(unix)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use timermux::{
    enable_timeouts, get_timeout_indicator, get_timeout_start_time, initialize_timeouts,
    register_timeout, set_interrupt_wakeup, EnableTimeoutParams, Timestamp, USER_TIMEOUT,
};

// handlers and the wakeup hook run in signal context, so they may only touch
// atomics
static SEQ: AtomicUsize = AtomicUsize::new(0);
static SLOW_POS: AtomicUsize = AtomicUsize::new(0);
static FAST_POS: AtomicUsize = AtomicUsize::new(0);
static WAKEUPS: AtomicUsize = AtomicUsize::new(0);

fn slow_fired() {
    SLOW_POS.store(SEQ.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
}

fn fast_fired() {
    FAST_POS.store(SEQ.fetch_add(1, Ordering::Relaxed) + 1, Ordering::Relaxed);
}

fn woke() {
    WAKEUPS.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn sigalrm_fires_due_timeouts_in_deadline_order() {
    initialize_timeouts();
    set_interrupt_wakeup(Some(woke));

    // let the clock move off its epoch so an armed start_time is
    // distinguishable from "never armed"
    thread::sleep(Duration::from_millis(1));

    let slow = register_timeout(USER_TIMEOUT, slow_fired);
    let fast = register_timeout(USER_TIMEOUT, fast_fired);

    enable_timeouts(&[
        EnableTimeoutParams::After {
            id: slow,
            delay: Duration::from_millis(120),
        },
        EnableTimeoutParams::After {
            id: fast,
            delay: Duration::from_millis(40),
        },
    ]);
    assert!(get_timeout_start_time(fast) > Timestamp::ZERO);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !(get_timeout_indicator(slow, false) && get_timeout_indicator(fast, false)) {
        assert!(Instant::now() < deadline, "timeouts never fired");
        thread::sleep(Duration::from_millis(10));
    }

    let fast_pos = FAST_POS.load(Ordering::Relaxed);
    let slow_pos = SLOW_POS.load(Ordering::Relaxed);
    assert!(fast_pos >= 1 && slow_pos >= 1);
    assert!(fast_pos < slow_pos, "nearer deadline must fire first");
    assert!(WAKEUPS.load(Ordering::Relaxed) >= 1);

    // a fired indicator reads true until explicitly reset
    assert!(get_timeout_indicator(fast, true));
    assert!(!get_timeout_indicator(fast, false));
}

// Multiplexing of the single process countdown timer across any number of
// registered timeout reasons. The active queue is shared between the mutator
// and the interrupt handler, which may preempt it between almost any two
// instructions; no lock is safe to take in interrupt context, so every
// mutating operation disarms the timer, mutates, then re-arms for the new
// queue head.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use log::{error, trace};

use crate::alarm::AlarmTimer;
use crate::clock::{timestamp_difference, Clock, Timestamp};

// identifier of one timeout reason
pub type TimeoutId = usize;

// handlers run in interrupt context and must be async-signal-safe; a handler
// that needs context must stash it in its own process-scoped state
pub type TimeoutHandler = fn();

// reserved well-known reasons; ids at USER_TIMEOUT and above are allocated
// dynamically by register
pub const DEADLOCK_TIMEOUT: TimeoutId = 0;
pub const STATEMENT_TIMEOUT: TimeoutId = 1;
pub const LOCK_WAIT_TIMEOUT: TimeoutId = 2;
pub const USER_TIMEOUT: TimeoutId = 3;
pub const MAX_TIMEOUTS: usize = 16;

// one entry of a batched enable_timeouts call; After fires `delay` after the
// batch's single clock read, At fires at a caller-supplied instant
#[derive(Debug, Clone, Copy)]
pub enum EnableTimeoutParams {
    After { id: TimeoutId, delay: Duration },
    At { id: TimeoutId, fin_time: Timestamp },
}

// one entry of a batched disable_timeouts call
#[derive(Debug, Clone, Copy)]
pub struct DisableTimeoutParams {
    pub id: TimeoutId,
    pub keep_indicator: bool,
}

// Data about any one timeout reason. indicator and fin_time are written from
// the interrupt handler, so every shared field is atomic; relaxed ordering is
// enough because the interrupt runs on the mutator's own thread.
struct TimeoutEntry {
    // identifier of this reason, used for tie-breaking equal deadlines
    index: TimeoutId,
    // true if the timeout has fired and was not cleared since
    indicator: AtomicBool,
    // callback for the reason, or None if not registered
    handler: AtomicCell<Option<TimeoutHandler>>,
    // time the reason was last armed
    start_time: AtomicCell<Timestamp>,
    // if armed, time it is due to fire
    fin_time: AtomicCell<Timestamp>,
}

impl TimeoutEntry {
    fn new(index: TimeoutId) -> Self {
        TimeoutEntry {
            index,
            indicator: AtomicBool::new(false),
            handler: AtomicCell::new(None),
            start_time: AtomicCell::new(Timestamp::ZERO),
            fin_time: AtomicCell::new(Timestamp::ZERO),
        }
    }
}

// The timeout multiplexer: the registry of timeout reasons plus the queue of
// currently armed ones, served off one AlarmTimer. There must be exactly one
// instance per underlying timer; the process-wide one lives behind the free
// functions below. All methods take &self; the mutator side is meant to be
// driven from a single thread, and on_interrupt is the one entry point that
// may preempt it asynchronously.
pub struct TimeoutMux {
    alarm: &'static dyn AlarmTimer,
    clock: &'static dyn Clock,
    initialized: AtomicBool,
    // registry of all reasons, indexed by TimeoutId
    timeouts: [TimeoutEntry; MAX_TIMEOUTS],
    // armed reasons in ascending (fin_time, index) order; only the first
    // num_active slots are meaningful
    active: [AtomicUsize; MAX_TIMEOUTS],
    num_active: AtomicUsize,
    // optional process latch hook, called on every interrupt delivery
    wakeup: AtomicCell<Option<fn()>>,
}

impl TimeoutMux {
    pub fn new(alarm: &'static dyn AlarmTimer, clock: &'static dyn Clock) -> Self {
        TimeoutMux {
            alarm,
            clock,
            initialized: AtomicBool::new(false),
            timeouts: std::array::from_fn(TimeoutEntry::new),
            active: std::array::from_fn(|_| AtomicUsize::new(0)),
            num_active: AtomicUsize::new(0),
            wakeup: AtomicCell::new(None),
        }
    }

    // Reset all multiplexer state and install the interrupt handler. Must be
    // called before any other operation, and again in a forked child before
    // it re-enables signals: the child inherits the registry but neither the
    // kernel timer nor a coherent signal disposition, and handlers meant for
    // the parent must not run in it.
    pub fn initialize(&self) {
        self.num_active.store(0, Ordering::Relaxed);
        for entry in &self.timeouts {
            entry.indicator.store(false, Ordering::Relaxed);
            entry.handler.store(None);
            entry.start_time.store(Timestamp::ZERO);
            entry.fin_time.store(Timestamp::ZERO);
        }
        self.wakeup.store(None);
        self.initialized.store(true, Ordering::Relaxed);

        // touch the clock so its epoch exists before the first interrupt
        // can read it
        let _ = self.clock.current();

        if let Err(e) = self.alarm.install() {
            timer_failure("install alarm handler", e);
        }
    }

    // Register handler for a timeout reason and return the id in use. A
    // reserved id below USER_TIMEOUT records the handler at that slot; any
    // user-range id is a request to allocate the first free user slot.
    // Registration never arms the reason.
    pub fn register(&self, id: TimeoutId, handler: TimeoutHandler) -> TimeoutId {
        assert!(
            self.initialized.load(Ordering::Relaxed),
            "timeout service not initialized"
        );

        let mut id = id;
        if id >= USER_TIMEOUT {
            // allocate a user-defined timeout reason
            id = (USER_TIMEOUT..MAX_TIMEOUTS)
                .find(|&slot| self.timeouts[slot].handler.load().is_none())
                .unwrap_or_else(|| panic!("cannot add more timeout reasons"));
        }

        assert!(
            self.timeouts[id].handler.load().is_none(),
            "timeout reason {} already registered",
            id
        );
        self.timeouts[id].handler.store(Some(handler));
        id
    }

    // arm id to fire `delay` after now
    pub fn enable_timeout_after(&self, id: TimeoutId, delay: Duration) {
        self.disable_alarm(false);
        let now = self.clock.current();
        let fin_time = now.saturating_add(delay);
        self.enable(id, now, fin_time);
        self.schedule_alarm(now);
    }

    // arm id to fire at fin_time; for callers that computed the deadline
    // relative to some point other than "now", and spares the second clock
    // read enable_timeout_after would pay
    pub fn enable_timeout_at(&self, id: TimeoutId, fin_time: Timestamp) {
        self.disable_alarm(false);
        let now = self.clock.current();
        self.enable(id, now, fin_time);
        self.schedule_alarm(now);
    }

    // arm several reasons with one clock read and one timer programming
    pub fn enable_timeouts(&self, timeouts: &[EnableTimeoutParams]) {
        self.disable_alarm(timeouts.len() > 1);
        let now = self.clock.current();
        for param in timeouts {
            match *param {
                EnableTimeoutParams::After { id, delay } => {
                    self.enable(id, now, now.saturating_add(delay));
                }
                EnableTimeoutParams::At { id, fin_time } => {
                    self.enable(id, now, fin_time);
                }
            }
        }
        self.schedule_alarm(now);
    }

    // Disarm id, leaving any other armed reason in force. The fired
    // indicator is also reset unless keep_indicator is set. Disabling a
    // reason that is not armed is not an error.
    pub fn disable_timeout(&self, id: TimeoutId, keep_indicator: bool) {
        assert!(
            self.initialized.load(Ordering::Relaxed),
            "timeout service not initialized"
        );
        assert!(
            self.timeouts[id].handler.load().is_some(),
            "timeout reason {} not registered",
            id
        );

        self.disable_alarm(false);

        if let Some(pos) = self.find_active(id) {
            self.remove_active(pos);
        }
        if !keep_indicator {
            self.timeouts[id].indicator.store(false, Ordering::Relaxed);
        }
        if self.num_active.load(Ordering::Relaxed) > 0 {
            self.schedule_alarm(self.clock.current());
        }
    }

    // disarm several reasons with at most one clock read at the reschedule
    pub fn disable_timeouts(&self, timeouts: &[DisableTimeoutParams]) {
        assert!(
            self.initialized.load(Ordering::Relaxed),
            "timeout service not initialized"
        );

        self.disable_alarm(false);

        for param in timeouts {
            assert!(
                self.timeouts[param.id].handler.load().is_some(),
                "timeout reason {} not registered",
                param.id
            );
            if let Some(pos) = self.find_active(param.id) {
                self.remove_active(pos);
            }
            if !param.keep_indicator {
                self.timeouts[param.id]
                    .indicator
                    .store(false, Ordering::Relaxed);
            }
        }
        if self.num_active.load(Ordering::Relaxed) > 0 {
            self.schedule_alarm(self.clock.current());
        }
    }

    // force the timer off and empty the queue, optionally clearing every
    // indicator; handler registrations survive and the reasons can be armed
    // again without re-registering
    pub fn disable_all_timeouts(&self, keep_indicators: bool) {
        // forcibly reset the timer whether we think it is armed or not
        if let Err(e) = self.alarm.disarm() {
            timer_failure("disable alarm timer", e);
        }

        self.num_active.store(0, Ordering::Relaxed);

        if !keep_indicators {
            for entry in &self.timeouts {
                entry.indicator.store(false, Ordering::Relaxed);
            }
        }
    }

    // Whether id has fired since its indicator was last cleared. With reset,
    // a true indicator is cleared before returning; a false indicator is
    // never written back, since clearing on the false path would race with a
    // concurrent firing and could silently lose it.
    pub fn get_timeout_indicator(&self, id: TimeoutId, reset: bool) -> bool {
        if self.timeouts[id].indicator.load(Ordering::Relaxed) {
            if reset {
                self.timeouts[id].indicator.store(false, Ordering::Relaxed);
            }
            return true;
        }
        false
    }

    // the instant id was last armed, or Timestamp::ZERO if never;
    // deliberately not reset when the reason fires, so a reader racing the
    // interrupt handler cannot observe a spurious zero
    pub fn get_timeout_start_time(&self, id: TimeoutId) -> Timestamp {
        self.timeouts[id].start_time.load()
    }

    // the instant id is due to fire, meaningful only while armed
    pub fn get_timeout_fin_time(&self, id: TimeoutId) -> Timestamp {
        self.timeouts[id].fin_time.load()
    }

    // install (or clear) a hook called on every interrupt delivery, whether
    // or not any logical timeout is due, so blocked waits re-check their
    // conditions; the hook runs in interrupt context and must be
    // async-signal-safe
    pub fn set_wakeup(&self, hook: Option<fn()>) {
        self.wakeup.store(hook);
    }

    /// Entry point for each delivery of the countdown-timer interrupt.
    /// Everything reached from here runs in interrupt context, including
    /// the registered handlers.
    pub fn on_interrupt(&self) {
        // always wake the process, even when no logical timeout is due
        if let Some(wake) = self.wakeup.load() {
            wake();
        }

        // a stale interrupt with an empty queue must touch nothing; the
        // single-insert path of disable_alarm depends on this check
        if self.num_active.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut now = self.clock.current();
        while self.num_active.load(Ordering::Relaxed) > 0 {
            let entry = &self.timeouts[self.active_id(0)];
            if entry.fin_time.load() > now {
                break;
            }

            self.remove_active(0);
            entry.indicator.store(true, Ordering::Relaxed);
            let handler = entry.handler.load().expect("active timeout has no handler");
            handler();

            // the handler may not be cheap (deadlock checks in particular),
            // so refresh our idea of "now" after each one
            now = self.clock.current();
        }

        self.schedule_alarm(now);
    }

    // Keep the interrupt from firing while the caller mutates the queue.
    // When the queue is empty and the caller will do only a single insert,
    // the disarm is skipped: should a stale interrupt land during the
    // mutation, it observes num_active == 0 at its entry point (the count is
    // incremented last) and does nothing, and the worst case is one useless
    // later wakeup. A caller about to do several inserts passes multi_insert
    // to force the timer off, since the interrupt could otherwise land
    // between its inserts and walk a half-built queue.
    fn disable_alarm(&self, multi_insert: bool) {
        if multi_insert || self.num_active.load(Ordering::Relaxed) > 0 {
            if let Err(e) = self.alarm.disarm() {
                timer_failure("disable alarm timer", e);
            }
        }
    }

    // re-arm the timer for the queue head, if any; the caller supplies its
    // own idea of "now", or a close-enough approximation
    fn schedule_alarm(&self, now: Timestamp) {
        if self.num_active.load(Ordering::Relaxed) == 0 {
            return;
        }

        let head = &self.timeouts[self.active_id(0)];
        let (secs, mut usecs) = timestamp_difference(now, head.fin_time.load());

        // the difference can be under a microsecond; a zero value would
        // disarm the timer rather than fire it immediately
        if secs == 0 && usecs == 0 {
            usecs = 1;
        }

        if let Err(e) = self.alarm.arm(Duration::new(secs, usecs * 1_000)) {
            timer_failure("enable alarm timer", e);
        }
    }

    #[inline]
    fn active_id(&self, pos: usize) -> TimeoutId {
        self.active[pos].load(Ordering::Relaxed)
    }

    // queue position of id, if armed
    fn find_active(&self, id: TimeoutId) -> Option<usize> {
        let n = self.num_active.load(Ordering::Relaxed);
        (0..n).find(|&pos| self.active_id(pos) == id)
    }

    // insert id at queue position pos, shifting later entries right
    fn insert_active(&self, id: TimeoutId, pos: usize) {
        let n = self.num_active.load(Ordering::Relaxed);
        assert!(pos <= n, "timeout index {} out of range 0..{}", pos, n);

        for i in (pos..n).rev() {
            self.active[i + 1].store(self.active[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.active[pos].store(id, Ordering::Relaxed);

        // NB: this must be the last step, see disable_alarm
        self.num_active.store(n + 1, Ordering::Relaxed);
    }

    // remove the queue entry at pos, shifting later entries left
    fn remove_active(&self, pos: usize) {
        let n = self.num_active.load(Ordering::Relaxed);
        assert!(pos < n, "timeout index {} out of range 0..{}", pos, n);

        for i in pos + 1..n {
            self.active[i - 1].store(self.active[i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.num_active.store(n - 1, Ordering::Relaxed);
    }

    // arm id to fire at fin_time; an enable of an already-armed reason is a
    // directive to reschedule it
    fn enable(&self, id: TimeoutId, now: Timestamp, fin_time: Timestamp) {
        assert!(
            self.initialized.load(Ordering::Relaxed),
            "timeout service not initialized"
        );
        let entry = &self.timeouts[id];
        assert!(
            entry.handler.load().is_some(),
            "timeout reason {} not registered",
            id
        );

        if let Some(pos) = self.find_active(id) {
            self.remove_active(pos);
        }

        // insertion point: the queue is kept in ascending (fin_time, index)
        // order
        let n = self.num_active.load(Ordering::Relaxed);
        let mut pos = n;
        for i in 0..n {
            let other = &self.timeouts[self.active_id(i)];
            let other_fin = other.fin_time.load();
            if fin_time < other_fin || (fin_time == other_fin && id < other.index) {
                pos = i;
                break;
            }
        }

        entry.indicator.store(false, Ordering::Relaxed);
        entry.start_time.store(now);
        entry.fin_time.store(fin_time);
        self.insert_active(id, pos);
        trace!("timeout {} armed to fire at {:?}", id, fin_time);
    }

    #[cfg(test)]
    pub(crate) fn active_snapshot(&self) -> Vec<TimeoutId> {
        let n = self.num_active.load(Ordering::Relaxed);
        (0..n).map(|pos| self.active_id(pos)).collect()
    }

    #[cfg(test)]
    pub(crate) fn registered(&self, id: TimeoutId) -> bool {
        self.timeouts[id].handler.load().is_some()
    }
}

// The process timer is the only interrupt source; if it cannot be programmed
// there is nothing to salvage.
fn timer_failure(action: &str, err: io::Error) -> ! {
    error!("could not {}: {}", action, err);
    std::process::abort();
}

#[cfg(unix)]
pub use self::process::*;

// the process-wide instance, multiplexing the real setitimer alarm
#[cfg(unix)]
mod process {
    use once_cell::sync::Lazy;

    use super::*;
    use crate::alarm::SetitimerAlarm;
    use crate::clock::MonotonicClock;

    static SYSTEM_ALARM: SetitimerAlarm = SetitimerAlarm::new(handle_sig_alarm);
    static SYSTEM_CLOCK: MonotonicClock = MonotonicClock;
    static PROCESS_MUX: Lazy<TimeoutMux> =
        Lazy::new(|| TimeoutMux::new(&SYSTEM_ALARM, &SYSTEM_CLOCK));

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
    unsafe fn errno_location() -> *mut libc::c_int {
        libc::__errno_location()
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    unsafe fn errno_location() -> *mut libc::c_int {
        libc::__error()
    }

    #[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
    unsafe fn errno_location() -> *mut libc::c_int {
        libc::__errno()
    }

    // SIGALRM shim. The interrupted code may be between a syscall and its
    // errno check, so preserve errno across the dispatcher.
    extern "C" fn handle_sig_alarm(_signum: libc::c_int) {
        let saved_errno = unsafe { *errno_location() };
        PROCESS_MUX.on_interrupt();
        unsafe { *errno_location() = saved_errno };
    }

    // initialize, or after a fork re-initialize, the process timeout service
    pub fn initialize_timeouts() {
        PROCESS_MUX.initialize();
    }

    pub fn register_timeout(id: TimeoutId, handler: TimeoutHandler) -> TimeoutId {
        PROCESS_MUX.register(id, handler)
    }

    pub fn enable_timeout_after(id: TimeoutId, delay: Duration) {
        PROCESS_MUX.enable_timeout_after(id, delay);
    }

    pub fn enable_timeout_at(id: TimeoutId, fin_time: Timestamp) {
        PROCESS_MUX.enable_timeout_at(id, fin_time);
    }

    pub fn enable_timeouts(timeouts: &[EnableTimeoutParams]) {
        PROCESS_MUX.enable_timeouts(timeouts);
    }

    pub fn disable_timeout(id: TimeoutId, keep_indicator: bool) {
        PROCESS_MUX.disable_timeout(id, keep_indicator);
    }

    pub fn disable_timeouts(timeouts: &[DisableTimeoutParams]) {
        PROCESS_MUX.disable_timeouts(timeouts);
    }

    pub fn disable_all_timeouts(keep_indicators: bool) {
        PROCESS_MUX.disable_all_timeouts(keep_indicators);
    }

    pub fn get_timeout_indicator(id: TimeoutId, reset: bool) -> bool {
        PROCESS_MUX.get_timeout_indicator(id, reset)
    }

    pub fn get_timeout_start_time(id: TimeoutId) -> Timestamp {
        PROCESS_MUX.get_timeout_start_time(id)
    }

    pub fn get_timeout_fin_time(id: TimeoutId) -> Timestamp {
        PROCESS_MUX.get_timeout_fin_time(id)
    }

    // install the process latch hook
    pub fn set_interrupt_wakeup(hook: Option<fn()>) {
        PROCESS_MUX.set_wakeup(hook);
    }
}

use std::io;
use std::time::Duration;

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

// Driver for the single process-wide countdown timer. The multiplexer owns
// exactly one of these and keeps it programmed for the nearest pending
// deadline; the interrupt entry point is fixed at install time.
pub trait AlarmTimer: Sync {
    // install the interrupt handler, once per process before the timer is
    // first armed, and again in a forked child before it re-enables signals
    fn install(&self) -> io::Result<()>;

    // program the timer to fire once, `delay` from now; `delay` must be
    // nonzero, some timers read a zero value as "disarm"
    fn arm(&self, delay: Duration) -> io::Result<()>;

    // forcibly clear the timer; a disarmed timer delivers no interrupt
    fn disarm(&self) -> io::Result<()>;
}

#[cfg(unix)]
pub use self::unix::SetitimerAlarm;

#[cfg(unix)]
mod unix {
    use std::io;
    use std::ptr;
    use std::time::Duration;

    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    use super::AlarmTimer;

    // setitimer(ITIMER_REAL) driver: a one-shot wall-clock countdown
    // delivered to the process as SIGALRM
    pub struct SetitimerAlarm {
        handler: extern "C" fn(libc::c_int),
    }

    impl SetitimerAlarm {
        pub const fn new(handler: extern "C" fn(libc::c_int)) -> Self {
            SetitimerAlarm { handler }
        }

        fn set_timer(&self, secs: u64, usecs: u32) -> io::Result<()> {
            let value = libc::itimerval {
                it_interval: libc::timeval {
                    tv_sec: 0,
                    tv_usec: 0,
                },
                it_value: libc::timeval {
                    tv_sec: secs as libc::time_t,
                    tv_usec: usecs as libc::suseconds_t,
                },
            };
            let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, ptr::null_mut()) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl AlarmTimer for SetitimerAlarm {
        fn install(&self) -> io::Result<()> {
            let action = SigAction::new(
                SigHandler::Handler(self.handler),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            unsafe { sigaction(Signal::SIGALRM, &action) }
                .map(drop)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }

        fn arm(&self, delay: Duration) -> io::Result<()> {
            debug_assert!(delay > Duration::from_secs(0));
            self.set_timer(delay.as_secs(), delay.subsec_micros())
        }

        fn disarm(&self) -> io::Result<()> {
            self.set_timer(0, 0)
        }
    }
}

// test driver that records every timer programming so tests can deliver the
// interrupt themselves
#[cfg(test)]
pub(crate) struct ManualAlarm {
    armed: parking_lot::Mutex<Vec<Duration>>,
    disarms: AtomicUsize,
}

#[cfg(test)]
impl ManualAlarm {
    pub fn new() -> Self {
        ManualAlarm {
            armed: parking_lot::Mutex::new(Vec::new()),
            disarms: AtomicUsize::new(0),
        }
    }

    pub fn arm_calls(&self) -> usize {
        self.armed.lock().len()
    }

    pub fn last_arm(&self) -> Option<Duration> {
        self.armed.lock().last().copied()
    }

    pub fn disarm_calls(&self) -> usize {
        self.disarms.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl AlarmTimer for ManualAlarm {
    fn install(&self) -> io::Result<()> {
        Ok(())
    }

    fn arm(&self, delay: Duration) -> io::Result<()> {
        assert!(delay > Duration::from_secs(0), "armed with a zero countdown");
        self.armed.lock().push(delay);
        Ok(())
    }

    fn disarm(&self) -> io::Result<()> {
        self.disarms.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

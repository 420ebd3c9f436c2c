//! Multiplex the single process-wide countdown timer across independent
//! timeout reasons.
//!
//! A long-running process gets exactly one interval timer from the OS,
//! delivering one asynchronous interrupt. This crate lets every subsystem
//! register its own logical timeout with its own handler; the multiplexer
//! arms the underlying timer for whichever deadline is nearest, runs all due
//! handlers when the interrupt arrives, and re-arms for the next pending
//! deadline.
//!
//! ```no_run
//! use std::time::Duration;
//! use timermux::{enable_timeout_after, initialize_timeouts, register_timeout, USER_TIMEOUT};
//!
//! fn statement_timed_out() {
//!     // set a flag your main loop checks; runs in interrupt context
//! }
//!
//! initialize_timeouts();
//! let id = register_timeout(USER_TIMEOUT, statement_timed_out);
//! enable_timeout_after(id, Duration::from_millis(500));
//! ```
//!
//! The free functions drive the one process-wide instance backed by
//! `setitimer`/`SIGALRM`. [`TimeoutMux`] is the underlying machinery, usable
//! against any [`AlarmTimer`]/[`Clock`] pair, but a process must only ever
//! run one instance against the real timer.

pub mod alarm;
pub mod clock;
pub mod timeout;

pub use crate::alarm::AlarmTimer;
#[cfg(unix)]
pub use crate::alarm::SetitimerAlarm;
pub use crate::clock::{timestamp_difference, Clock, MonotonicClock, Timestamp};
pub use crate::timeout::*;

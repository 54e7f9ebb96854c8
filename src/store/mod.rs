//! Shared counter storage and time sources.

mod clock;
mod counter;

pub use clock::{Clock, MockClock, SystemClock, Timestamp};
pub use counter::{CasOutcome, ScopeKey, SharedCounterStore};

//! Shared hardware access: the cross-process lease and the session built on it.

pub mod lease;
pub mod session;

pub use lease::{InstrumentLease, LeaseError, LeaseGuard, LeaseSettings, LeaseState};
pub use session::{check_equipment, select_channel, InstrumentSession, SessionTiming};

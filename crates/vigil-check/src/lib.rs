//! Active service checks.
//!
//! A check runs its protocol probe every minute, 30 seconds after going
//! not-ok, and immediately when one of its persistent TCP connections
//! breaks and cannot be reestablished.

mod base;
pub mod ntp;
pub mod tcp;

pub use base::{BaseCheck, Probe};
pub use ntp::NtpProbe;
pub use tcp::TcpProbe;

//! Warden: access-control kernel for an HR portal.
//!
//! Authenticates accounts with lockout and an optional TOTP second factor,
//! keeps server-side sessions with an inactivity countdown, evaluates
//! capability and route checks, lets superusers impersonate other
//! principals, and records a bounded audit trail.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod kernel;
pub mod logging;
pub mod types;

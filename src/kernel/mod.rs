//! Access-control kernel.
//!
//! Every authentication, session, authorization and impersonation decision
//! is made here. Application code talks to [`service::AccessKernel`].

pub mod accounts;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod impersonation;
pub mod permissions;
pub mod persistence;
pub mod service;
pub mod session;
pub mod two_factor;

pub use service::{AccessKernel, ImpersonationStatus, KernelDeps, LoginResponse};

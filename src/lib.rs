//! execgate: host binary-authorization agent.
//!
//! Intercepts process executions reported by the OS security provider and
//! allows or denies each one based on code-signature validity and a
//! hash-keyed rule database.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;
pub mod notification;
pub mod types;

pub mod endpoint;
pub mod rules;
pub mod signature;

pub mod agent;
pub mod authorization;
pub mod decision;

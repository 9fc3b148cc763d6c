//! Mutex coordination for plugins contending on shared system resources
//!
//! Mutex identity is a plain string with no hierarchy: `pkgmgr:apt` and
//! `pkgmgr:dpkg` are independent unless a plugin lists both.

pub mod coordinator;

pub use coordinator::*;

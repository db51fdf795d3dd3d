//! The daemon's moving parts, exposed as a library so the worker pipeline
//! and boot checks are testable without spawning the binary.

pub mod integrity;
pub mod worker;

//! The uniform call surface over the delegate endpoints.
//!
//! `DelegateAdapter` is the seam: the HTTP adapter talks to real endpoints,
//! the scripted adapter replays canned envelopes in tests, and `GatedAdapter`
//! wraps any of them with the rate limiter, the cost gate, and the circuit
//! breaker — in that order, so a quota rejection never consumes a breaker
//! probe.

pub mod adapter;
pub mod gate;
pub mod http;
pub mod scripted;

pub use adapter::{DelegateAdapter, DelegateRequest};
pub use gate::GatedAdapter;
pub use http::HttpDelegateAdapter;
pub use scripted::ScriptedAdapter;

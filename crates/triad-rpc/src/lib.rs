//! JSON-RPC 2.0 surface: task submission, task and event queries, health,
//! and the operator pause switch. Consumers poll the event log by sequence
//! id; there is no push.

pub mod api;
pub mod server;
pub mod types;

pub use server::{RpcServer, RpcServerState};

//! The durable system-of-record.
//!
//! One SQLite database holds tasks, events, workers, votes, breakers, costs,
//! and phases. All writes serialize through a single connection behind a
//! mutex; busy/locked errors retry with exponential backoff and jitter;
//! conditional transitions run inside BEGIN IMMEDIATE transactions so that
//! two transitions with the same "from" state can never both succeed.

pub mod breakers;
pub mod costs;
pub mod db;
pub mod events;
pub mod kv;
pub mod paths;
pub mod phases;
pub mod schema;
pub mod tasks;
pub mod votes;
pub mod workers;

pub use db::Store;

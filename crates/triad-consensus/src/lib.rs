//! The tri-agent consensus engine.
//!
//! A review fans out to the roster for its review type, collects validated
//! envelopes into votes (everything malformed, missing, or late becomes
//! ABSTAIN with a recorded reason), and aggregates under the quorum and
//! confidence rules. Votes are idempotent per (request, model).

pub mod aggregate;
pub mod engine;
pub mod roster;

pub use aggregate::{aggregate, AggregationRules, Outcome};
pub use engine::{ConsensusEngine, ReviewSpec};
pub use roster::Roster;

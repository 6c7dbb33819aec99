pub mod candidates;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod model;
pub mod providers;
pub mod sampling;
pub mod storage;

pub use candidates::{CandidatePool, CandidatePoolBuilder};
pub use engine::{PollOutcome, Runner, Worker};

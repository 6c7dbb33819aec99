pub mod runner;
pub mod worker;

pub use runner::{RunPolicy, Runner};
pub use worker::{PollOutcome, Worker};

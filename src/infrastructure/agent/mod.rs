//! Agent client implementations.

pub mod cli_agent;
pub mod mock;

pub use cli_agent::CliAgentClient;
pub use mock::{MockAgentClient, MockOutcome};

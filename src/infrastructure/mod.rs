//! Infrastructure layer: git, state files, locking, configuration,
//! logging, the retrieval index, and agent clients.

pub mod agent;
pub mod config;
pub mod git;
pub mod index;
pub mod lockfile;
pub mod logging;
pub mod state;

pub use config::ConfigLoader;
pub use git::{validate_ref, GitClient, RebaseOutcome};
pub use lockfile::GrindLock;
pub use logging::Logger;

// Public API - the probing engine and its collaborators
pub mod config;
pub mod error;
pub mod export;
pub mod prober;
pub mod remotes;
pub mod scion;

// Wiring and plumbing used by the binary and the integration tests
pub mod cli;
pub mod daemon;
pub mod host;
pub mod probe;

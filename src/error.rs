//! Error types for scion-multiping.

use std::io;

use thiserror::Error;

/// Errors that are fatal to process startup.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to initialize SCION host context: {0}")]
    HostContext(anyhow::Error),

    #[error("failed to open exporter database: {0}")]
    ExporterOpen(#[source] rusqlite::Error),
}

/// Errors raised while setting up or driving a probe socket.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// The underlay socket could not be created or bound. Fatal for the
    /// affected destination's client; the destination itself is retained.
    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] io::Error),

    /// The echo request could not be assembled (no path to a remote IA,
    /// or an address that does not serialize).
    #[error("failed to pack echo request: {0}")]
    PackFailed(String),

    /// The underlay write failed.
    #[error("failed to write echo request: {0}")]
    WriteFailed(#[source] io::Error),
}

/// A path lookup against the SCION daemon failed. Warn-and-continue; the
/// next sweep retries.
#[derive(Error, Debug)]
#[error("path lookup for {destination} failed: {cause}")]
pub struct PathLookupError {
    pub destination: String,
    pub cause: anyhow::Error,
}

/// A single exporter row could not be written. Logged; never aborts a tick.
#[derive(Error, Debug)]
#[error("exporter write failed: {0}")]
pub struct ExporterWriteError(#[from] pub rusqlite::Error);

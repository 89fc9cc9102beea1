//! The error type shared by every part of Muster.
//!
//! Only failures that happen on the controller are errors. A remote command that exits with a
//! non-zero status is not an error; its status is recorded in [Response::exit_code].
//!
//! [Response::exit_code]: crate::Response::exit_code

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A boxed error from the transport layer, which speaks [anyhow].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shorthand for results that fail with [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong on the controller side of Muster.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not reach or authenticate with the host.
    #[error("failed to connect to {target}")]
    Connection {
        target: String,
        #[source]
        source: BoxError,
    },

    /// [Node::connect] was called on a node that is already listening.
    ///
    /// [Node::connect]: crate::Node::connect
    #[error("{target} is already listening")]
    AlreadyListening { target: String },

    /// [Node::connect] was called while another call to it was still dialing.
    ///
    /// [Node::connect]: crate::Node::connect
    #[error("{target} is already connecting")]
    AlreadyConnecting { target: String },

    /// [Node::close] was called on a node that was never connected or is already closed.
    ///
    /// [Node::close]: crate::Node::close
    #[error("{target} is not listening")]
    NotListening { target: String },

    /// A request was submitted to a node that is not connected.
    #[error("{target} is not connected")]
    NotConnected { target: String },

    /// [Node::connect] was called on a node that has been closed. Closed nodes never reopen.
    ///
    /// [Node::connect]: crate::Node::connect
    #[error("{target} has been closed")]
    Closed { target: String },

    /// The node claims to be listening, but its worker is gone, so the request could not be
    /// queued.
    #[error("failed to dispatch a request to {target}: {reason}")]
    Dispatch { target: String, reason: String },

    /// A request outlived its deadline.
    #[error("request on {target} timed out after {after:?}")]
    TimedOut { target: String, after: Duration },

    /// A local file could not be read.
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote-copy header could not be encoded for the chosen receiver.
    #[error("invalid copy header: {0}")]
    InvalidHeader(String),

    /// The remote-copy destination has no usable file name.
    #[error("invalid copy destination: {0:?}")]
    InvalidDestination(String),

    /// A host specification could not be parsed.
    #[error("invalid target {0}")]
    InvalidTarget(String),

    /// The operating system refused to start a node's worker thread.
    #[error("failed to start the worker thread for {target}")]
    Spawn {
        target: String,
        #[source]
        source: io::Error,
    },
}

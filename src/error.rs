//! Error taxonomy for the pool, the driver, the script executor and the
//! script loader. Each layer gets its own `thiserror` enum rather than one
//! grab-bag type, so callers can match on exactly the failures that layer
//! can produce.

use std::io;

use thiserror::Error;

/// Errors a `Driver` implementation can report while opening, shutting
/// down or validating a connection to a [`ServerEndpoint`](crate::endpoint::ServerEndpoint).
#[derive(Debug, Error)]
pub enum DriverError {
    /// TCP connect, handshake or login failed.
    #[error("failed to connect to {endpoint}: {message}")]
    Connect {
        /// The endpoint that could not be reached.
        endpoint: String,
        /// Human-readable detail.
        message: String,
    },

    /// The server requested login and the supplied credentials were
    /// rejected, or none were supplied.
    #[error("authentication failed for {endpoint}")]
    Auth {
        /// The endpoint that rejected the credentials.
        endpoint: String,
    },

    /// A transport-level failure on an otherwise-established connection
    /// (broken pipe, reset, short read). Distinct from a script-level
    /// evaluation error, which is not a `DriverError` at all.
    #[error("transport error on {endpoint}: {message}")]
    Transport {
        /// The endpoint the connection was talking to.
        endpoint: String,
        /// Human-readable detail.
        message: String,
    },

    /// Spawning or waiting on an embedded backend process failed.
    #[error("startup failed for {endpoint}: {message}")]
    Startup {
        /// The endpoint the process was meant to serve.
        endpoint: String,
        /// Human-readable detail.
        message: String,
    },

    /// An I/O error from the underlying socket or pipe.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors the connection pool can report.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed (explicitly, or because it was configured
    /// with zero valid slots). Every operation after this point fails the
    /// same way.
    #[error("pool is closed")]
    Closed,

    /// `release`/`invalidate` was called with a connection the pool does
    /// not currently have checked out (includes the null/absent case).
    #[error("connection is not owned by this pool")]
    NotOwned,

    /// A slot exceeded its failure budget, or the embedded-startup probe
    /// loop never observed a live backend.
    #[error("could not connect to backend: {0}")]
    Connect(#[source] DriverError),

    /// The configuration document was unreadable or missing required
    /// attributes.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

/// Errors the script executor can report.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A null/absent value was passed to `set_input`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Acquiring a connection from the pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Assigning an input, evaluating the script, or reading an output
    /// failed at the driver level.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Errors the script loader can report.
#[derive(Debug, Error)]
pub enum ScriptLoaderError {
    /// No resource by that name was found on the search path.
    #[error("script not found: {0}")]
    NotFound(String),

    /// The resource was found but could not be read.
    #[error(transparent)]
    Io(#[from] io::Error),
}

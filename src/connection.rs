//! The connection handle abstraction (spec §3 "Connection handle").
//!
//! Exactly one handle exists per endpoint at any time; the pool is
//! responsible for making sure it lives in the idle deque or the active map
//! but never both (see [`crate::pool`]).

use crate::error::DriverError;
use crate::value::RValue;

/// An open, blocking connection to one backend endpoint.
///
/// Implementations are produced by a [`crate::driver::Driver`] and consumed
/// by the [`crate::pool::Pool`] and [`crate::executor::ScriptExecutor`].
/// Not `Clone`: a connection has exactly one owner at a time.
pub trait Connection: Send + 'static {
    /// Cheap, synchronous liveness check. Must not block on network I/O
    /// beyond what the implementation already tracks locally (e.g. a
    /// half-closed socket flag); it is called on every acquire for a
    /// cached connection and must be fast.
    fn is_connected(&self) -> bool;

    /// Closes the underlying socket. Idempotent.
    fn close(&mut self);

    /// Binds `value` to `name` in the remote global environment.
    fn assign(&mut self, name: &str, value: &RValue) -> Result<(), DriverError>;

    /// Evaluates `expr` in the remote global environment and returns the
    /// result.
    fn eval(&mut self, expr: &str) -> Result<RValue, DriverError>;

    /// Performs the login handshake with the given credentials.
    fn login(&mut self, username: &str, password: &str) -> Result<(), DriverError>;

    /// Whether the server demanded login before the first `eval`/`assign`.
    fn needs_login(&self) -> bool;
}

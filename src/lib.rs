//! A pooled client for remote statistical-computation engines.
//!
//! The pool (`pool`) manages a bounded set of long-lived TCP connections to
//! one or more backend compute servers (`endpoint`), handing them out in a
//! thread-blocking, FIFO-ish discipline with failure-budgeted invalidation,
//! graceful shutdown, and process-exit cleanup. On top of the pool sits a
//! thin one-shot script executor (`executor`) that binds named inputs,
//! triggers a single remote evaluation, and extracts named outputs, backed
//! by a memoizing script loader (`script`).
//!
//! ```no_run
//! use rstat_pool::config::PoolConfig;
//! use rstat_pool::driver::RserveDriver;
//! use rstat_pool::executor::{OutputType, ScriptExecutor};
//! use rstat_pool::pool::Pool;
//! use rstat_pool::value::RValue;
//!
//! let config = PoolConfig::empty();
//! let pool = Pool::<RserveDriver>::configure_with_driver(RserveDriver, config);
//!
//! let mut executor = ScriptExecutor::new(pool);
//! executor.set_input("base", RValue::Num(2.0));
//! executor.set_output("sum", OutputType::Num);
//! executor.execute("sum <- base + 1").ok();
//! ```

pub mod config;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod pool;
pub mod script;
pub mod value;
pub mod wire;

pub use endpoint::ServerEndpoint;
pub use error::{DriverError, ExecutorError, PoolError, ScriptLoaderError};
pub use executor::{OutputType, ScriptExecutor};
pub use pool::Pool;
pub use value::RValue;

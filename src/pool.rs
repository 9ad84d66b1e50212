//! The connection pool (spec §3, §4.3): a bounded, thread-safe resource
//! manager with blocking/timeout acquisition, invalidation, graceful
//! shutdown, process-exit cleanup, and a singleton convenience.
//!
//! The source system blocks *threads*, not futures (spec §5), so this is
//! built on `parking_lot::{Mutex, Condvar}` rather than `bb8`'s tokio/futures
//! plumbing (see `DESIGN.md` for why that substitution is in scope).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, instrument, warn};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::driver::{Driver, RserveDriver};
use crate::endpoint::ServerEndpoint;
use crate::error::PoolError;

/// Up to 30 probes at 200ms, replacing the source's five-second sleep after
/// spawning an embedded backend (Design Notes §9 Open Question, resolved).
const STARTUP_PROBE_ATTEMPTS: u32 = 30;
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(200);

struct EndpointSlot<C> {
    endpoint: ServerEndpoint,
    conn: Option<C>,
    consecutive_failures: u32,
    embedded: bool,
    command: String,
    /// Present only for `embedded` slots; kept so `close` can fall back to
    /// killing the child if the protocol-level shutdown command fails.
    startup: Option<crate::driver::StartupHandle>,
}

impl<C> EndpointSlot<C> {
    fn fresh(endpoint: ServerEndpoint, embedded: bool, command: String) -> Self {
        Self {
            endpoint,
            conn: None,
            consecutive_failures: 0,
            embedded,
            command,
            startup: None,
        }
    }
}

struct Internals<C> {
    idle: VecDeque<EndpointSlot<C>>,
    active: HashMap<u64, EndpointSlot<C>>,
    total: u32,
    closed: bool,
    next_id: u64,
}

impl<C> Internals<C> {
    fn empty() -> Self {
        Self {
            idle: VecDeque::new(),
            active: HashMap::new(),
            total: 0,
            closed: true,
            next_id: 0,
        }
    }
}

struct PoolInner<D: Driver> {
    driver: D,
    failure_budget: u32,
    config: Mutex<PoolConfig>,
    state: Mutex<Internals<D::Conn>>,
    not_empty: Condvar,
}

/// A bounded pool of connections to one or more configured backend
/// endpoints. Cheap to clone (it is a handle around a shared `Arc`), so
/// every caller can hold its own `Pool` value.
pub struct Pool<D: Driver = RserveDriver> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Driver> Clone for Pool<D> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> std::fmt::Debug for Pool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Pool")
            .field("total", &state.total)
            .field("active", &state.active)
            .field("idle", &state.idle)
            .field("closed", &state.closed)
            .finish()
    }
}

/// A point-in-time snapshot of pool occupancy (spec §4.3 counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    /// Idle plus checked-out slots still enrolled in the pool.
    pub total: u32,
    /// Slots currently checked out.
    pub active: u32,
    /// Slots currently idle.
    pub idle: u32,
    /// Whether the pool has been closed.
    pub closed: bool,
}

enum ReturnOutcome {
    Returned,
    Closed,
    NotOwned,
}

impl<D: Driver> Pool<D> {
    /// Builds and enrolls a pool from `config` using the given driver.
    /// Embedded entries are started and probed (`validate`, up to
    /// [`STARTUP_PROBE_ATTEMPTS`] times) before being considered enrolled;
    /// an embedded entry whose backend never comes up is skipped rather
    /// than failing the whole configure (spec §4.4: only a *total* of zero
    /// enrolled slots closes the pool).
    #[instrument(skip(driver, config))]
    pub fn configure_with_driver(driver: D, config: PoolConfig) -> Self {
        let internals = Self::build_internals(&driver, &config);
        Pool {
            inner: Arc::new(PoolInner {
                driver,
                failure_budget: config.failure_budget,
                config: Mutex::new(config),
                state: Mutex::new(internals),
                not_empty: Condvar::new(),
            }),
        }
    }

    fn build_internals(driver: &D, config: &PoolConfig) -> Internals<D::Conn> {
        let mut idle = VecDeque::new();
        for entry in &config.entries {
            let mut slot = EndpointSlot::fresh(entry.endpoint.clone(), entry.embedded, entry.command.clone());
            if entry.embedded {
                match driver.startup(&entry.endpoint, &entry.command) {
                    Ok(handle) => {
                        if !Self::wait_for_embedded_backend(driver, &entry.endpoint) {
                            warn!(endpoint = %entry.endpoint, "embedded backend never became reachable; skipping slot");
                            continue;
                        }
                        slot.startup = Some(handle);
                    }
                    Err(e) => {
                        warn!(endpoint = %entry.endpoint, error = %e, "failed to start embedded backend; skipping slot");
                        continue;
                    }
                }
            }
            idle.push_back(slot);
        }

        let total = idle.len() as u32;
        Internals {
            idle,
            active: HashMap::new(),
            total,
            closed: total == 0,
            next_id: 0,
        }
    }

    fn wait_for_embedded_backend(driver: &D, endpoint: &ServerEndpoint) -> bool {
        for _ in 0..STARTUP_PROBE_ATTEMPTS {
            if driver.validate(endpoint) {
                return true;
            }
            thread::sleep(STARTUP_PROBE_INTERVAL);
        }
        false
    }

    /// Blocks until a connection is available, or fails immediately if the
    /// pool is closed.
    pub fn acquire(&self) -> Result<PooledConnection<D>, PoolError> {
        self.acquire_inner(None)?.ok_or(PoolError::Closed)
    }

    /// Blocks up to `timeout`; returns `Ok(None)` on expiry rather than an
    /// error (spec §4.3).
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<PooledConnection<D>>, PoolError> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    #[instrument(skip(self))]
    fn acquire_inner(&self, deadline: Option<Instant>) -> Result<Option<PooledConnection<D>>, PoolError> {
        loop {
            let mut slot = {
                let mut state = self.inner.state.lock();
                loop {
                    if state.closed {
                        return Err(PoolError::Closed);
                    }
                    if let Some(slot) = state.idle.pop_front() {
                        break slot;
                    }
                    match deadline {
                        None => {
                            self.inner.not_empty.wait(&mut state);
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Ok(None);
                            }
                            let timed_out = self
                                .inner
                                .not_empty
                                .wait_for(&mut state, deadline - now)
                                .timed_out();
                            if timed_out && state.idle.is_empty() && !state.closed {
                                return Ok(None);
                            }
                        }
                    }
                }
            };

            let reused = slot.conn.take().filter(|c| c.is_connected());
            let open_result = match reused {
                Some(conn) => Ok(conn),
                None => self.inner.driver.open(&slot.endpoint),
            };

            match open_result {
                Ok(conn) => {
                    let mut state = self.inner.state.lock();
                    slot.consecutive_failures = 0;
                    let id = state.next_id;
                    state.next_id += 1;
                    state.active.insert(id, slot);
                    drop(state);
                    return Ok(Some(PooledConnection {
                        pool: self.clone(),
                        id,
                        conn: Some(conn),
                    }));
                }
                Err(e) => {
                    slot.consecutive_failures += 1;
                    let mut state = self.inner.state.lock();
                    if slot.consecutive_failures >= self.inner.failure_budget {
                        state.total -= 1;
                        if state.total == 0 {
                            state.closed = true;
                        }
                        drop(state);
                        self.inner.not_empty.notify_all();
                        debug!(endpoint = %slot.endpoint, "slot exceeded failure budget, permanently invalidated");
                        return Err(PoolError::Connect(e));
                    }
                    // Tail rotation: a flaky backend cannot monopolise the head.
                    state.idle.push_back(slot);
                    drop(state);
                    self.inner.not_empty.notify_all();
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    fn try_return(&self, id: u64, mut conn: D::Conn) -> ReturnOutcome {
        let mut state = self.inner.state.lock();
        if state.closed {
            conn.close();
            return ReturnOutcome::Closed;
        }
        match state.active.remove(&id) {
            Some(mut slot) => {
                slot.conn = Some(conn);
                // LIFO: a just-released connection is the most likely one
                // handed out next, keeping it hot.
                state.idle.push_front(slot);
                drop(state);
                self.inner.not_empty.notify_one();
                ReturnOutcome::Returned
            }
            None => ReturnOutcome::NotOwned,
        }
    }

    /// Returns `conn` to the idle set. Fails `NotOwned` if `conn` did not
    /// come from this pool instance, and `Closed` if the pool closed
    /// concurrently.
    pub fn release(&self, mut conn: PooledConnection<D>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&self.inner, &conn.pool.inner) {
            return Err(PoolError::NotOwned);
        }
        let id = conn.id;
        let c = conn.conn.take().ok_or(PoolError::NotOwned)?;
        match self.try_return(id, c) {
            ReturnOutcome::Returned => Ok(()),
            ReturnOutcome::Closed => Err(PoolError::Closed),
            ReturnOutcome::NotOwned => Err(PoolError::NotOwned),
        }
    }

    /// Permanently removes `conn` from the pool, closing the underlying
    /// handle. If this drains the last slot, the pool transitions to
    /// closed.
    pub fn invalidate(&self, mut conn: PooledConnection<D>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&self.inner, &conn.pool.inner) {
            return Err(PoolError::NotOwned);
        }
        let id = conn.id;
        let mut c = conn.conn.take().ok_or(PoolError::NotOwned)?;
        c.close();

        let mut state = self.inner.state.lock();
        if state.active.remove(&id).is_none() {
            return Err(PoolError::NotOwned);
        }
        state.total -= 1;
        if state.total == 0 {
            state.closed = true;
        }
        drop(state);
        self.inner.not_empty.notify_all();
        Ok(())
    }

    /// Idempotent. Closes every idle and active slot, sending a shutdown
    /// command to embedded backends (best effort, errors logged and
    /// swallowed: close must finish regardless).
    #[instrument(skip(self))]
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle: Vec<_> = state.idle.drain(..).collect();
        let active: Vec<_> = state.active.drain().map(|(_, slot)| slot).collect();
        state.total = 0;
        drop(state);

        for mut slot in idle.into_iter().chain(active) {
            if let Some(mut conn) = slot.conn.take() {
                conn.close();
            }
            if slot.embedded {
                if let Err(e) = self.inner.driver.shutdown(&slot.endpoint) {
                    warn!(endpoint = %slot.endpoint, error = %e, "shutdown of embedded backend failed during close, killing process");
                    if let Some(mut handle) = slot.startup.take() {
                        handle.kill();
                    }
                }
            }
        }
        self.inner.not_empty.notify_all();
    }

    /// Closes the pool, then re-enrolls it from the configuration supplied
    /// at construction time.
    pub fn reopen(&self) {
        self.close();
        let config = self.inner.config.lock().clone();
        let fresh = Self::build_internals(&self.inner.driver, &config);
        let mut state = self.inner.state.lock();
        *state = fresh;
        drop(state);
        self.inner.not_empty.notify_all();
    }

    /// A point-in-time snapshot of occupancy.
    pub fn state(&self) -> State {
        let state = self.inner.state.lock();
        State {
            total: state.total,
            active: state.active.len() as u32,
            idle: state.idle.len() as u32,
            closed: state.closed,
        }
    }

    /// Convenience accessor; see [`Pool::state`].
    pub fn total(&self) -> u32 {
        self.state().total
    }

    /// Convenience accessor; see [`Pool::state`].
    pub fn active(&self) -> u32 {
        self.state().active
    }

    /// Convenience accessor; see [`Pool::state`].
    pub fn idle(&self) -> u32 {
        self.state().idle
    }

    /// Convenience accessor; see [`Pool::state`].
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// A connection checked out of a [`Pool`]. Derefs to the underlying
/// [`Connection`]. If dropped without an explicit [`Pool::release`] or
/// [`Pool::invalidate`], it is returned to the pool automatically: the
/// RAII idiom standing in for the source's try/finally discipline (spec
/// §4.5).
pub struct PooledConnection<D: Driver> {
    pool: Pool<D>,
    id: u64,
    conn: Option<D::Conn>,
}

impl<D: Driver> std::ops::Deref for PooledConnection<D> {
    type Target = D::Conn;

    fn deref(&self) -> &D::Conn {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<D: Driver> std::ops::DerefMut for PooledConnection<D> {
    fn deref_mut(&mut self) -> &mut D::Conn {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.try_return(self.id, conn);
        }
    }
}

static SINGLETON: OnceCell<Pool<RserveDriver>> = OnceCell::new();
static SINGLETON_INIT: Mutex<()> = Mutex::new(());
static ATEXIT_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Returns the process-wide pool, configuring it from the default
/// configuration document (spec §6) on first call.
pub fn instance() -> Pool<RserveDriver> {
    if let Some(p) = SINGLETON.get() {
        return p.clone();
    }
    let config = crate::config::load_default().unwrap_or_else(|e| {
        warn!(error = %e, "no usable default configuration; starting with zero slots");
        PoolConfig::empty()
    });
    instance_with_config(config)
}

/// Returns the process-wide pool, configuring it from `config` on first
/// call. A later caller's `config` argument is silently ignored once the
/// singleton exists (the source's documented "first wins" rule, spec
/// §4.3), not an invariant to defend.
pub fn instance_with_config(config: PoolConfig) -> Pool<RserveDriver> {
    if let Some(p) = SINGLETON.get() {
        return p.clone();
    }
    let _guard = SINGLETON_INIT.lock();
    if let Some(p) = SINGLETON.get() {
        return p.clone();
    }
    let pool = Pool::configure_with_driver(RserveDriver, config);
    register_atexit_cleanup();
    // Another thread may have raced us between the double-checked read and
    // this lock; `set` only fails if so, in which case we drop our pool and
    // defer to the winner, matching "first wins".
    match SINGLETON.set(pool.clone()) {
        Ok(()) => pool,
        Err(_) => SINGLETON.get().expect("just set").clone(),
    }
}

fn register_atexit_cleanup() {
    if ATEXIT_REGISTERED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        unsafe {
            libc::atexit(atexit_cleanup);
        }
    }
}

extern "C" fn atexit_cleanup() {
    if let Some(pool) = SINGLETON.get() {
        pool.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Mutex as StdMutex;

    /// An in-memory fake connection used to exercise the pool without a
    /// live backend.
    #[derive(Debug)]
    pub struct FakeConnection {
        pub connected: bool,
    }

    impl Connection for FakeConnection {
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn close(&mut self) {
            self.connected = false;
        }
        fn assign(&mut self, _name: &str, _value: &crate::value::RValue) -> Result<(), DriverError> {
            Ok(())
        }
        fn eval(&mut self, _expr: &str) -> Result<crate::value::RValue, DriverError> {
            Ok(crate::value::RValue::Num(0.0))
        }
        fn login(&mut self, _username: &str, _password: &str) -> Result<(), DriverError> {
            Ok(())
        }
        fn needs_login(&self) -> bool {
            false
        }
    }

    /// A `Driver` whose endpoints are always reachable, unless explicitly
    /// poisoned via `fail_next`. Tracks shutdown calls for embedded-slot
    /// assertions.
    #[derive(Debug, Default)]
    pub struct FakeDriver {
        pub fail_count: AtomicU32,
        pub shutdown_calls: StdMutex<Vec<String>>,
    }

    impl FakeDriver {
        pub fn failing(n: u32) -> Self {
            Self {
                fail_count: AtomicU32::new(n),
                shutdown_calls: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Driver for FakeDriver {
        type Conn = FakeConnection;

        fn open(&self, endpoint: &ServerEndpoint) -> Result<Self::Conn, DriverError> {
            if self.fail_count.load(AtomicOrdering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(DriverError::Connect {
                    endpoint: endpoint.to_string(),
                    message: "simulated failure".to_string(),
                });
            }
            Ok(FakeConnection { connected: true })
        }

        fn shutdown(&self, endpoint: &ServerEndpoint) -> Result<(), DriverError> {
            self.shutdown_calls.lock().unwrap().push(endpoint.to_string());
            Ok(())
        }

        fn validate(&self, endpoint: &ServerEndpoint) -> bool {
            self.open(endpoint).is_ok()
        }

        fn startup(
            &self,
            _endpoint: &ServerEndpoint,
            _command: &str,
        ) -> Result<crate::driver::StartupHandle, DriverError> {
            unreachable!("tests do not exercise embedded startup through FakeDriver")
        }
    }

    fn one_slot_config() -> PoolConfig {
        PoolConfig::empty().with_entry(crate::config::PoolEntry {
            endpoint: ServerEndpoint::new("localhost", 6311),
            embedded: false,
            command: "Rserve".to_string(),
        })
    }

    #[test]
    fn happy_path_single_server() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        assert_eq!(pool.state(), State { total: 1, active: 0, idle: 1, closed: false });

        let c1 = pool.acquire().unwrap();
        assert_eq!(pool.state(), State { total: 1, active: 1, idle: 0, closed: false });

        let none = pool.acquire_timeout(Duration::from_millis(50)).unwrap();
        assert!(none.is_none());

        pool.release(c1).unwrap();
        assert_eq!(pool.state(), State { total: 1, active: 0, idle: 1, closed: false });

        let second = pool.acquire_timeout(Duration::from_millis(50)).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn empty_configuration_closes_pool() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), PoolConfig::empty());
        assert!(pool.is_closed());
        assert_eq!(pool.total(), 0);
        assert!(matches!(pool.acquire(), Err(PoolError::Closed)));
    }

    #[test]
    fn close_then_release_or_acquire_fails_closed() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        let c = pool.acquire().unwrap();
        pool.close();
        assert!(matches!(pool.release(c), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire(), Err(PoolError::Closed)));
    }

    #[test]
    fn close_is_idempotent() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        pool.close();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
    }

    #[test]
    fn invalidate_drains_pool_to_closed() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        let c = pool.acquire().unwrap();
        pool.invalidate(c).unwrap();
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.idle(), 0);
        assert!(pool.is_closed());
    }

    #[test]
    fn release_from_foreign_pool_is_not_owned() {
        let pool_a = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        let pool_b = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        let guard_from_a = pool_a.acquire().unwrap();
        assert!(matches!(pool_b.release(guard_from_a), Err(PoolError::NotOwned)));
    }

    #[test]
    fn drop_without_explicit_release_returns_connection() {
        let pool = Pool::configure_with_driver(FakeDriver::default(), one_slot_config());
        {
            let _c = pool.acquire().unwrap();
            assert_eq!(pool.active(), 1);
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn failure_budget_invalidates_after_three_strikes() {
        // Three consecutive failures hit the default budget and demote the
        // slot on the spot.
        let pool = Pool::configure_with_driver(FakeDriver::failing(3), one_slot_config());
        let result = pool.acquire();
        assert!(matches!(result, Err(PoolError::Connect(_))));
        assert!(pool.is_closed());
    }

    #[tracing_test::traced_test]
    #[test]
    fn demotion_is_logged() {
        let pool = Pool::configure_with_driver(FakeDriver::failing(3), one_slot_config());
        let _ = pool.acquire();
        assert!(tracing_test::logs_contain("exceeded failure budget"));
    }

    #[test]
    fn failure_within_budget_eventually_succeeds() {
        let pool = Pool::configure_with_driver(FakeDriver::failing(2), one_slot_config());
        let conn = pool.acquire().unwrap();
        assert!(conn.is_connected());
    }

    #[test]
    fn concurrent_acquire_release_respects_capacity() {
        let pool = Arc::new(Pool::configure_with_driver(
            FakeDriver::default(),
            PoolConfig::empty()
                .with_entry(crate::config::PoolEntry {
                    endpoint: ServerEndpoint::new("h1", 6311),
                    embedded: false,
                    command: "Rserve".to_string(),
                })
                .with_entry(crate::config::PoolEntry {
                    endpoint: ServerEndpoint::new("h2", 6311),
                    embedded: false,
                    command: "Rserve".to_string(),
                }),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    if let Ok(Some(conn)) = pool.acquire_timeout(Duration::from_millis(200)) {
                        let state = pool.state();
                        assert!(state.active <= 2);
                        assert!(state.idle + state.active <= state.total);
                        assert!(state.total <= 2);
                        pool.release(conn).unwrap();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.total(), 2);
    }
}

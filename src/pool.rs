//! Role-aware connection pool over a set of cluster endpoints.
//!
//! The pool keeps one endpoint record per configured address. Each admitted
//! endpoint is driven by its own controller task that reconnects after
//! failures, re-probes the instance role on a periodic tick and relocates
//! the connection between the role subpools when the role changes. Request
//! dispatch picks a connection from the subpool implied by the caller's
//! [`Mode`] using per-subpool round-robin rotation.
//!
//! Lock order is fixed: the endpoint map lock first, the subpools lock
//! second, the watcher registry lock third. User callbacks (the
//! [`ConnectionHandler`] hooks and watch callbacks) are never invoked while
//! any pool lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::conn::{Conn, ConnEvent, ConnOpts, Connect, ProtocolFeature, WatchCallback};
use crate::error::{Error, Result};
use crate::request::{Prepared, Request, Response, ResponseFuture, Stream};
use crate::role::{Mode, Role};
use crate::round_robin::RoundRobin;
use crate::watcher::{PoolWatcher, WatcherRegistry};

/// Capacity of the per-endpoint state-change channel. Publishing is lossy on
/// overflow; the periodic check tick recovers anything that was dropped.
const NOTIFY_CAPACITY: usize = 100;

/// Default interval of the per-endpoint check tick.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Function invoked on an instance to discover its status and role.
const ROLE_PROBE_FUNCTION: &str = "box.info";

/// Status an instance must report to be admitted into the pool.
const STATUS_RUNNING: &str = "running";

/// Lifecycle hooks for code interested in connection membership changes.
///
/// `discovered` runs when a connection with a role has been detected, before
/// it becomes available for dispatch; returning an error cancels the
/// admission, the connection is closed and the endpoint retries on a later
/// tick. `deactivated` runs when a connection stops being available under a
/// role, either because it closed or because its role changed; errors from
/// it are logged and otherwise ignored.
///
/// On a role change the pool calls `deactivated` with the old role and then
/// `discovered` with the new one. Neither hook is invoked under a pool lock,
/// so hooks may call back into the pool.
pub trait ConnectionHandler<C: Conn>: Send + Sync {
    fn discovered(&self, conn: &C, role: Role) -> Result<()>;
    fn deactivated(&self, conn: &C, role: Role) -> Result<()>;
}

/// Pool construction options.
pub struct PoolConfig<C: Conn> {
    /// Interval of the per-endpoint tick that reopens closed connections and
    /// relocates connections whose role changed. Must be greater than zero.
    pub check_interval: Duration,
    /// Bound on the initial fill and on the dial performed by
    /// [`Pool::add`]. `None` leaves dialing unbounded. Reconnects performed
    /// by endpoint controllers are not affected; they are canceled through
    /// the endpoint lifecycle instead.
    pub connect_timeout: Option<Duration>,
    /// Optional membership hooks.
    pub handler: Option<Arc<dyn ConnectionHandler<C>>>,
}

impl<C: Conn> Default for PoolConfig<C> {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            connect_timeout: None,
            handler: None,
        }
    }
}

impl<C: Conn> Clone for PoolConfig<C> {
    fn clone(&self) -> Self {
        Self {
            check_interval: self.check_interval,
            connect_timeout: self.connect_timeout,
            handler: self.handler.clone(),
        }
    }
}

impl<C: Conn> std::fmt::Debug for PoolConfig<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("check_interval", &self.check_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl<C: Conn> PoolConfig<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ConnectionHandler<C>>) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// Status snapshot of one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Whether the connection transport is established right now.
    pub connected_now: bool,
    /// Role subpool the connection is registered under.
    pub role: Role,
}

/// Counters describing pool activity since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub dials: u64,
    pub dial_failures: u64,
    pub deactivations: u64,
    pub role_flips: u64,
    pub dispatches: u64,
    pub dispatch_failures: u64,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    dials: AtomicU64,
    dial_failures: AtomicU64,
    deactivations: AtomicU64,
    role_flips: AtomicU64,
    dispatches: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl PoolMetrics {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            dials: self.dials.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            deactivations: self.deactivations.load(Ordering::Relaxed),
            role_flips: self.role_flips.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Global pool lifecycle state. Progression is monotonic:
/// `Unknown → Connected → (Shutdown →)? Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Unknown = 0,
    Connected = 1,
    Shutdown = 2,
    Closed = 3,
}

struct PoolState(AtomicU8);

impl PoolState {
    fn new(state: State) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn get(&self) -> State {
        match self.0.load(Ordering::SeqCst) {
            0 => State::Unknown,
            1 => State::Connected,
            2 => State::Shutdown,
            _ => State::Closed,
        }
    }

    fn set(&self, state: State) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn cas(&self, from: State, to: State) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One-shot latched signal. Firing is idempotent; waiters see the signal
/// whether they subscribe before or after it fires.
struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    fn fire(&self) {
        self.tx.send_replace(true);
    }

    fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Per-address record. The conn slot and role are meaningful only while the
/// connection is registered in the subpools or an admission is in progress;
/// controllers are the only writers after construction.
struct Endpoint<C> {
    addr: String,
    conn: Mutex<Option<Arc<C>>>,
    role: Mutex<Role>,
    notify_tx: mpsc::Sender<ConnEvent>,
    notify_rx: Mutex<Option<mpsc::Receiver<ConnEvent>>>,
    /// Graceful close requested.
    shutdown: Signal,
    /// Immediate close requested; overrides a graceful close in progress.
    close: Signal,
    /// The endpoint finished closing; the record holds no live connection.
    closed: Signal,
    /// Cancels a dial in progress.
    cancel: Signal,
    close_err: Mutex<Option<Error>>,
}

impl<C> Endpoint<C> {
    fn new(addr: &str) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CAPACITY);
        Arc::new(Self {
            addr: addr.to_string(),
            conn: Mutex::new(None),
            role: Mutex::new(Role::Unknown),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            shutdown: Signal::new(),
            close: Signal::new(),
            closed: Signal::new(),
            cancel: Signal::new(),
            close_err: Mutex::new(None),
        })
    }

    fn conn(&self) -> Option<Arc<C>> {
        self.conn.lock().clone()
    }

    fn set_conn(&self, conn: Option<Arc<C>>) {
        *self.conn.lock() = conn;
    }

    fn role(&self) -> Role {
        *self.role.lock()
    }

    fn set_role(&self, role: Role) {
        *self.role.lock() = role;
    }
}

struct SubPools<C> {
    rw: RoundRobin<C>,
    ro: RoundRobin<C>,
    any: RoundRobin<C>,
}

impl<C> SubPools<C> {
    fn new() -> Self {
        Self {
            rw: RoundRobin::new(),
            ro: RoundRobin::new(),
            any: RoundRobin::new(),
        }
    }

    fn lookup(&self, addr: &str) -> Option<(Arc<C>, Role)> {
        if let Some(conn) = self.rw.get_by_addr(addr) {
            return Some((conn, Role::Master));
        }
        if let Some(conn) = self.ro.get_by_addr(addr) {
            return Some((conn, Role::Replica));
        }
        self.any.get_by_addr(addr).map(|conn| (conn, Role::Unknown))
    }
}

struct PoolInner<N: Connect> {
    connector: N,
    conn_opts: ConnOpts,
    config: PoolConfig<N::Conn>,
    state: PoolState,
    endpoints: RwLock<HashMap<String, Arc<Endpoint<N::Conn>>>>,
    pools: RwLock<SubPools<N::Conn>>,
    watchers: Arc<WatcherRegistry<N::Conn>>,
    metrics: PoolMetrics,
    next_stream_id: AtomicU64,
}

/// A role-aware pool of connections to a replicated cluster.
///
/// Cloning the handle is cheap; all clones drive the same pool.
pub struct Pool<N: Connect> {
    inner: Arc<PoolInner<N>>,
}

impl<N: Connect> Clone for Pool<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: Connect> Pool<N> {
    /// Connect to the cluster with default options (one second check
    /// interval, unbounded dials).
    pub async fn connect(connector: N, addrs: &[&str], conn_opts: ConnOpts) -> Result<Self> {
        Self::connect_with_config(connector, addrs, conn_opts, PoolConfig::default()).await
    }

    /// Connect to the cluster.
    ///
    /// Every address is dialed once. Construction succeeds if at least one
    /// instance was admitted; endpoints that failed keep retrying on their
    /// check tick. If `config.connect_timeout` expires mid-fill the
    /// connections opened so far are deactivated in address order and the
    /// call fails with [`Error::Canceled`]. If no instance was admitted the
    /// call fails with [`Error::NoConnection`].
    pub async fn connect_with_config(
        connector: N,
        addrs: &[&str],
        conn_opts: ConnOpts,
        config: PoolConfig<N::Conn>,
    ) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::EmptyAddrs);
        }
        if config.check_interval.is_zero() {
            return Err(Error::WrongCheckInterval);
        }

        let deadline = config.connect_timeout.map(|t| time::Instant::now() + t);

        let inner = Arc::new(PoolInner {
            connector,
            conn_opts,
            config,
            state: PoolState::new(State::Unknown),
            endpoints: RwLock::new(HashMap::new()),
            pools: RwLock::new(SubPools::new()),
            watchers: Arc::new(WatcherRegistry::new()),
            metrics: PoolMetrics::default(),
            next_stream_id: AtomicU64::new(0),
        });

        let mut order: Vec<String> = Vec::with_capacity(addrs.len());
        let mut somebody_alive = false;
        for addr in addrs {
            let addr = addr.to_string();
            if inner.endpoints.read().contains_key(&addr) {
                continue;
            }
            let endpoint = Endpoint::new(&addr);
            inner
                .endpoints
                .write()
                .insert(addr.clone(), endpoint.clone());
            order.push(addr.clone());

            match inner.try_connect(&endpoint, deadline).await {
                Ok(()) => somebody_alive = true,
                Err(Error::Canceled) => {
                    warn!(target: "boxpool::pool", "initial fill canceled");
                    inner.deactivate_all(&order);
                    inner.state.set(State::Closed);
                    return Err(Error::Canceled);
                }
                Err(err) => {
                    warn!(
                        target: "boxpool::pool",
                        addr = %addr,
                        error = %err,
                        "connect failed during initial fill"
                    );
                }
            }
        }

        if !somebody_alive {
            inner.state.set(State::Closed);
            return Err(Error::NoConnection);
        }

        inner.state.set(State::Connected);

        let endpoints: Vec<_> = inner.endpoints.read().values().cloned().collect();
        for endpoint in endpoints {
            spawn_controller(&inner, endpoint);
        }

        Ok(Self { inner })
    }

    /// Add a new endpoint to a connected pool. The endpoint is admitted only
    /// after a successful dial, role probe and registration; on failure the
    /// record is rolled back and the error returned.
    pub async fn add(&self, addr: &str) -> Result<()> {
        let endpoint = Endpoint::new(addr);
        {
            let mut endpoints = self.inner.endpoints.write();
            if self.inner.state.get() != State::Connected {
                return Err(Error::Closed);
            }
            if endpoints.contains_key(addr) {
                return Err(Error::EndpointExists);
            }
            endpoints.insert(addr.to_string(), endpoint.clone());
        }

        let deadline = self
            .inner
            .config
            .connect_timeout
            .map(|t| time::Instant::now() + t);
        if let Err(err) = self.inner.try_connect(&endpoint, deadline).await {
            self.inner.endpoints.write().remove(addr);
            endpoint.cancel.fire();
            endpoint.closed.fire();
            return Err(err);
        }

        spawn_controller(&self.inner, endpoint);
        Ok(())
    }

    /// Remove an endpoint from the pool, closing its connection gracefully.
    /// Blocks until the endpoint has finished closing.
    pub async fn remove(&self, addr: &str) -> Result<()> {
        let endpoint = {
            let mut endpoints = self.inner.endpoints.write();
            let Some(endpoint) = endpoints.get(addr).cloned() else {
                return Err(Error::EndpointNotFound);
            };
            // A close or graceful close already in progress wins; the
            // endpoint only needs one teardown underway.
            if !endpoint.close.is_fired() && !endpoint.shutdown.is_fired() {
                endpoint.cancel.fire();
                endpoint.shutdown.fire();
            }
            endpoints.remove(addr);
            endpoint
        };

        endpoint.closed.fired().await;
        Ok(())
    }

    /// Dispatch a request.
    ///
    /// Free requests are routed to the subpool implied by `mode`.
    /// Connection-bound requests (prepared statements, stream operations)
    /// ignore `mode` and go to their originating connection; if that
    /// connection has left the pool the returned future is pre-failed with
    /// [`Error::UnknownRequest`].
    pub fn send(&self, request: Request, mode: Mode) -> ResponseFuture {
        if let Some(addr) = request.bound_addr() {
            let found = {
                let pools = self.inner.pools.read();
                pools.lookup(addr).map(|(conn, _)| conn)
            };
            return match found {
                Some(conn) => conn.submit(request),
                None => ResponseFuture::failed(Error::UnknownRequest),
            };
        }

        match self.inner.next_conn(mode) {
            Ok(conn) => {
                self.inner.metrics.dispatches.fetch_add(1, Ordering::Relaxed);
                conn.submit(request)
            }
            Err(err) => {
                self.inner
                    .metrics
                    .dispatch_failures
                    .fetch_add(1, Ordering::Relaxed);
                ResponseFuture::failed(err)
            }
        }
    }

    /// Send an empty liveness request.
    pub async fn ping(&self, mode: Mode) -> Result<Response> {
        self.send(Request::ping(), mode).await
    }

    /// Call a server-side function.
    pub async fn call(
        &self,
        function: impl Into<String>,
        args: Value,
        mode: Mode,
    ) -> Result<Response> {
        self.send(Request::call(function, args), mode).await
    }

    /// Evaluate an expression on an instance.
    pub async fn eval(
        &self,
        expression: impl Into<String>,
        args: Value,
        mode: Mode,
    ) -> Result<Response> {
        self.send(Request::eval(expression, args), mode).await
    }

    /// Execute an SQL statement.
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        args: Value,
        mode: Mode,
    ) -> Result<Response> {
        self.send(Request::execute(sql, args), mode).await
    }

    /// Open an interactive stream on a connection selected by `mode`. All
    /// requests bound to the stream are routed to that connection.
    pub fn stream(&self, mode: Mode) -> Result<Stream> {
        let conn = self.inner.next_conn(mode)?;
        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Stream::new(conn.addr(), id))
    }

    /// Prepare an SQL statement on a connection selected by `mode`. The
    /// returned handle executes on that connection only.
    pub async fn prepare(&self, sql: impl Into<String>, mode: Mode) -> Result<Prepared> {
        let conn = self.inner.next_conn(mode)?;
        let sql = sql.into();
        conn.submit(Request::prepare(sql.clone())).await?;
        Ok(Prepared::new(conn.addr(), sql))
    }

    /// Register a pool watcher for `key`.
    ///
    /// The callback is attached to every currently live connection matching
    /// `mode` and follows membership changes from then on. Requires the
    /// connection options to require [`ProtocolFeature::Watchers`].
    pub fn new_watcher(
        &self,
        key: &str,
        callback: WatchCallback,
        mode: Mode,
    ) -> Result<PoolWatcher<N::Conn>> {
        if !self.inner.conn_opts.requires(ProtocolFeature::Watchers) {
            return Err(Error::WatchersRequired);
        }

        let watcher = PoolWatcher::register(self.inner.watchers.clone(), key, callback, mode);

        let conns = {
            let pools = self.inner.pools.read();
            match mode {
                Mode::Rw => pools.rw.snapshot(),
                Mode::Ro => pools.ro.snapshot(),
                _ => pools.any.snapshot(),
            }
        };
        for conn in conns {
            if watcher.state().watch(conn.as_ref()).is_err() {
                // Treat a watch failure like a dead connection; the
                // controller reopens it on the next tick.
                let _ = conn.close();
            }
        }

        Ok(watcher)
    }

    /// Whether the pool currently has a connection satisfying `mode`.
    pub fn connected_now(&self, mode: Mode) -> bool {
        let pools = self.inner.pools.read();
        if self.inner.state.get() != State::Connected {
            return false;
        }
        match mode {
            Mode::Any => !pools.any.is_empty(),
            Mode::Rw => !pools.rw.is_empty(),
            Mode::Ro => !pools.ro.is_empty(),
            Mode::PreferRw | Mode::PreferRo => !pools.rw.is_empty() || !pools.ro.is_empty(),
        }
    }

    /// Request timeout configured on the next connection `mode` resolves to.
    pub fn configured_timeout(&self, mode: Mode) -> Result<Duration> {
        let conn = self.inner.next_conn(mode)?;
        Ok(conn.configured_timeout())
    }

    /// Addresses of all endpoints currently part of the pool, connected or
    /// not.
    pub fn addrs(&self) -> Vec<String> {
        self.inner.endpoints.read().keys().cloned().collect()
    }

    /// Snapshot of the registered connections: address, connected status and
    /// role. Endpoints without a registered connection are omitted.
    pub fn pool_info(&self) -> HashMap<String, ConnectionInfo> {
        let mut info = HashMap::new();
        let endpoints = self.inner.endpoints.read();
        let pools = self.inner.pools.read();
        if self.inner.state.get() != State::Connected {
            return info;
        }
        for addr in endpoints.keys() {
            if let Some((conn, role)) = pools.lookup(addr) {
                info.insert(
                    addr.clone(),
                    ConnectionInfo {
                        connected_now: conn.connected_now(),
                        role,
                    },
                );
            }
        }
        info
    }

    /// Activity counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.metrics.snapshot()
    }

    /// Close every connection immediately, aborting in-flight requests.
    ///
    /// Returns the per-endpoint close errors collected while tearing down.
    /// Safe to call concurrently with [`Pool::close_graceful`]; the
    /// immediate close wins and interrupts the graceful drain.
    pub async fn close(&self) -> Vec<Error> {
        if self.inner.state.cas(State::Connected, State::Closed)
            || self.inner.state.cas(State::Shutdown, State::Closed)
        {
            let endpoints = self.inner.endpoints.read();
            for endpoint in endpoints.values() {
                endpoint.cancel.fire();
                endpoint.close.fire();
            }
        }
        let errs = self.inner.wait_close().await;
        self.inner.endpoints.write().clear();
        errs
    }

    /// Close every connection gracefully, letting in-flight requests drain.
    /// Returns once every endpoint finished closing.
    pub async fn close_graceful(&self) -> Vec<Error> {
        if self.inner.state.cas(State::Connected, State::Shutdown) {
            let endpoints = self.inner.endpoints.read();
            for endpoint in endpoints.values() {
                endpoint.cancel.fire();
                endpoint.shutdown.fire();
            }
        }
        let errs = self.inner.wait_close().await;
        self.inner.endpoints.write().clear();
        errs
    }
}

impl<N: Connect> PoolInner<N> {
    /// Pick the next connection for `mode` per the routing table.
    fn next_conn(&self, mode: Mode) -> Result<Arc<N::Conn>> {
        let mut pools = self.pools.write();
        match mode {
            Mode::Any => pools.any.next().ok_or(Error::NoHealthyInstance),
            Mode::Rw => pools.rw.next().ok_or(Error::NoRwInstance),
            Mode::Ro => pools.ro.next().ok_or(Error::NoRoInstance),
            Mode::PreferRw => {
                if let Some(conn) = pools.rw.next() {
                    return Ok(conn);
                }
                pools.ro.next().ok_or(Error::NoHealthyInstance)
            }
            Mode::PreferRo => {
                if let Some(conn) = pools.ro.next() {
                    return Ok(conn);
                }
                pools.rw.next().ok_or(Error::NoHealthyInstance)
            }
        }
    }

    /// Register a connection in the subpools and attach matching watchers.
    /// Caller holds the pools-lock. A connection without a discovered role
    /// is never admitted.
    fn add_connection_locked(
        &self,
        pools: &mut SubPools<N::Conn>,
        addr: &str,
        conn: &Arc<N::Conn>,
        role: Role,
    ) -> Result<()> {
        if role == Role::Unknown {
            return Err(Error::IncorrectResponse);
        }
        self.watchers.attach_conn(conn.as_ref(), role)?;
        pools.any.add(addr, conn.clone());
        match role {
            Role::Master => pools.rw.add(addr, conn.clone()),
            Role::Replica => pools.ro.add(addr, conn.clone()),
            Role::Unknown => {}
        }
        Ok(())
    }

    /// Remove a connection from every subpool and detach its watchers.
    /// Caller holds the pools-lock.
    fn delete_connection_locked(
        &self,
        pools: &mut SubPools<N::Conn>,
        addr: &str,
    ) -> Option<Arc<N::Conn>> {
        let conn = pools.any.delete_by_addr(addr)?;
        if pools.rw.delete_by_addr(addr).is_none() {
            pools.ro.delete_by_addr(addr);
        }
        self.watchers.detach_conn(addr);
        Some(conn)
    }

    fn handler_discovered(&self, conn: &N::Conn, role: Role) -> bool {
        if let Some(handler) = &self.config.handler {
            if let Err(err) = handler.discovered(conn, role) {
                warn!(
                    target: "boxpool::pool",
                    addr = conn.addr(),
                    role = %role,
                    error = %err,
                    "connection admission canceled by handler"
                );
                return false;
            }
        }
        true
    }

    fn handler_deactivated(&self, conn: &N::Conn, role: Role) {
        self.metrics.deactivations.fetch_add(1, Ordering::Relaxed);
        if let Some(handler) = &self.config.handler {
            if let Err(err) = handler.deactivated(conn, role) {
                warn!(
                    target: "boxpool::pool",
                    addr = conn.addr(),
                    role = %role,
                    error = %err,
                    "connection deactivation handler failed"
                );
            }
        }
    }

    /// Dial `addr`, racing the endpoint's cancel signal and the optional
    /// deadline.
    async fn dial(
        &self,
        addr: &str,
        opts: &ConnOpts,
        cancel: &Signal,
        deadline: Option<time::Instant>,
    ) -> Result<N::Conn> {
        let connect = self.connector.connect(addr, opts);
        match deadline {
            Some(at) => {
                tokio::select! {
                    biased;
                    _ = cancel.fired() => Err(Error::Canceled),
                    _ = time::sleep_until(at) => Err(Error::Canceled),
                    result = connect => result,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.fired() => Err(Error::Canceled),
                    result = connect => result,
                }
            }
        }
    }

    /// Dial, probe and register a connection for an endpoint.
    ///
    /// The pools-lock is not held across the dial or the probe; the global
    /// state is re-checked under the lock before registration, and any
    /// departure from the connected lifecycle closes the fresh connection.
    async fn try_connect(
        &self,
        endpoint: &Arc<Endpoint<N::Conn>>,
        deadline: Option<time::Instant>,
    ) -> Result<()> {
        if matches!(self.state.get(), State::Shutdown | State::Closed) {
            return Err(Error::Closed);
        }

        endpoint.set_conn(None);
        endpoint.set_role(Role::Unknown);

        let mut opts = self.conn_opts.clone();
        opts.notify = Some(endpoint.notify_tx.clone());

        self.metrics.dials.fetch_add(1, Ordering::Relaxed);
        let conn = match self.dial(&endpoint.addr, &opts, &endpoint.cancel, deadline).await {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                self.metrics.dial_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        let role = match probe_role(conn.as_ref()).await {
            Ok(role) => role,
            Err(err) => {
                let _ = conn.close();
                warn!(
                    target: "boxpool::pool",
                    addr = %endpoint.addr,
                    error = %err,
                    "storing connection failed"
                );
                return Err(err);
            }
        };

        if !self.handler_discovered(conn.as_ref(), role) {
            let _ = conn.close();
            return Err(Error::AdmissionCanceled(endpoint.addr.clone()));
        }

        {
            let mut pools = self.pools.write();
            if matches!(self.state.get(), State::Shutdown | State::Closed) {
                drop(pools);
                let _ = conn.close();
                self.handler_deactivated(conn.as_ref(), role);
                return Err(Error::Closed);
            }
            if let Err(err) = self.add_connection_locked(&mut pools, &endpoint.addr, &conn, role) {
                drop(pools);
                let _ = conn.close();
                self.handler_deactivated(conn.as_ref(), role);
                return Err(err);
            }
        }

        endpoint.set_conn(Some(conn));
        endpoint.set_role(role);
        debug!(
            target: "boxpool::pool",
            addr = %endpoint.addr,
            role = %role,
            "connection registered"
        );
        Ok(())
    }

    /// Re-probe an open connection and relocate it between subpools if its
    /// role changed.
    async fn update_role(&self, endpoint: &Arc<Endpoint<N::Conn>>, conn: &Arc<N::Conn>) {
        if self.state.get() != State::Connected {
            return;
        }

        let role = match probe_role(conn.as_ref()).await {
            Ok(role) => role,
            Err(err) => {
                warn!(
                    target: "boxpool::pool",
                    addr = %endpoint.addr,
                    error = %err,
                    "role probe failed"
                );
                {
                    let mut pools = self.pools.write();
                    self.delete_connection_locked(&mut pools, &endpoint.addr);
                }
                let old = endpoint.role();
                let _ = conn.close();
                self.handler_deactivated(conn.as_ref(), old);
                endpoint.set_conn(None);
                endpoint.set_role(Role::Unknown);
                return;
            }
        };

        if role == endpoint.role() {
            return;
        }

        {
            let mut pools = self.pools.write();
            if self.state.get() != State::Connected {
                return;
            }
            self.delete_connection_locked(&mut pools, &endpoint.addr);
        }

        let old = endpoint.role();
        self.handler_deactivated(conn.as_ref(), old);

        if !self.handler_discovered(conn.as_ref(), role) {
            let _ = conn.close();
            endpoint.set_conn(None);
            endpoint.set_role(Role::Unknown);
            return;
        }

        {
            let mut pools = self.pools.write();
            if self.state.get() != State::Connected {
                drop(pools);
                let _ = conn.close();
                self.handler_deactivated(conn.as_ref(), role);
                endpoint.set_conn(None);
                endpoint.set_role(Role::Unknown);
                return;
            }
            if self
                .add_connection_locked(&mut pools, &endpoint.addr, conn, role)
                .is_err()
            {
                drop(pools);
                let _ = conn.close();
                self.handler_deactivated(conn.as_ref(), role);
                endpoint.set_conn(None);
                endpoint.set_role(Role::Unknown);
                return;
            }
        }

        endpoint.set_role(role);
        self.metrics.role_flips.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "boxpool::pool",
            addr = %endpoint.addr,
            from = %old,
            to = %role,
            "connection relocated after role change"
        );
    }

    /// Detach a dead connection and dial the endpoint again.
    async fn reconnect(&self, endpoint: &Arc<Endpoint<N::Conn>>, conn: &Arc<N::Conn>) {
        {
            let mut pools = self.pools.write();
            if self.state.get() != State::Connected {
                return;
            }
            self.delete_connection_locked(&mut pools, &endpoint.addr);
        }

        let old = endpoint.role();
        self.handler_deactivated(conn.as_ref(), old);
        endpoint.set_conn(None);
        endpoint.set_role(Role::Unknown);

        if let Err(err) = self.try_connect(endpoint, None).await {
            debug!(
                target: "boxpool::pool",
                addr = %endpoint.addr,
                error = %err,
                "reconnect failed"
            );
        }
    }

    /// Tear down every endpoint's connection in the given address order.
    /// Used when construction is canceled, before controllers exist.
    fn deactivate_all(&self, order: &[String]) {
        for addr in order {
            let endpoint = self.endpoints.read().get(addr).cloned();
            let Some(endpoint) = endpoint else { continue };
            let Some(conn) = endpoint.conn.lock().take() else {
                continue;
            };
            {
                let mut pools = self.pools.write();
                self.delete_connection_locked(&mut pools, addr);
            }
            let _ = conn.close();
            self.handler_deactivated(conn.as_ref(), endpoint.role());
            endpoint.set_role(Role::Unknown);
        }
    }

    /// Wait for every endpoint to finish closing and collect close errors.
    async fn wait_close(&self) -> Vec<Error> {
        let endpoints: Vec<_> = self.endpoints.read().values().cloned().collect();
        let mut errs = Vec::new();
        for endpoint in endpoints {
            endpoint.closed.fired().await;
            if let Some(err) = endpoint.close_err.lock().take() {
                errs.push(err);
            }
        }
        errs
    }
}

fn spawn_controller<N: Connect>(inner: &Arc<PoolInner<N>>, endpoint: Arc<Endpoint<N::Conn>>) {
    let inner = inner.clone();
    tokio::spawn(async move {
        controller(inner, endpoint).await;
    });
}

/// Endpoint lifecycle controller.
///
/// One cooperative task per endpoint. Signal priority is load-bearing:
/// `closed` short-circuits everything, `close` overrides `shutdown`, and
/// only when neither is pending are connection events and the periodic tick
/// serviced. This is what lets an immediate close interrupt a graceful
/// drain in progress.
async fn controller<N: Connect>(inner: Arc<PoolInner<N>>, endpoint: Arc<Endpoint<N::Conn>>) {
    let Some(mut notify_rx) = endpoint.notify_rx.lock().take() else {
        return;
    };
    let period = inner.config.check_interval;
    let mut ticker = time::interval_at(time::Instant::now() + period, period);
    let mut shutting_down = false;

    loop {
        if shutting_down {
            // A graceful drain is running in a child task. Wait for it to
            // finish or for an overriding immediate close.
            tokio::select! {
                biased;
                _ = endpoint.close.fired() => {}
                _ = endpoint.closed.fired() => {}
            }
        }

        if endpoint.closed.is_fired() {
            return;
        }

        if endpoint.close.is_fired() {
            if let Some(conn) = endpoint.conn() {
                {
                    let mut pools = inner.pools.write();
                    inner.delete_connection_locked(&mut pools, &endpoint.addr);
                }
                if !shutting_down {
                    endpoint.set_conn(None);
                    let role = endpoint.role();
                    if let Err(err) = conn.close() {
                        *endpoint.close_err.lock() = Some(err);
                    }
                    inner.handler_deactivated(conn.as_ref(), role);
                    endpoint.closed.fire();
                } else {
                    // Force the drain to finish, then wait for the child
                    // task to report completion.
                    let _ = conn.close();
                    endpoint.closed.fired().await;
                }
            } else {
                endpoint.closed.fire();
            }
            continue;
        }

        if endpoint.shutdown.is_fired() && !shutting_down {
            shutting_down = true;
            if let Some(conn) = endpoint.conn() {
                {
                    let mut pools = inner.pools.write();
                    inner.delete_connection_locked(&mut pools, &endpoint.addr);
                }
                // Drain in a child task so this controller keeps observing
                // an overriding close signal.
                let inner_child = inner.clone();
                let endpoint_child = endpoint.clone();
                tokio::spawn(async move {
                    if let Err(err) = conn.close_graceful().await {
                        *endpoint_child.close_err.lock() = Some(err);
                    }
                    let role = endpoint_child.role();
                    endpoint_child.set_conn(None);
                    inner_child.handler_deactivated(conn.as_ref(), role);
                    endpoint_child.closed.fire();
                });
            } else {
                endpoint.closed.fire();
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = endpoint.close.fired() => {
                // Handled at the top of the loop.
            }
            _ = endpoint.shutdown.fired() => {
                // Handled at the top of the loop.
            }
            event = notify_rx.recv() => {
                if event.is_some() {
                    if let Some(conn) = endpoint.conn() {
                        if conn.closed_now() {
                            let detached = {
                                let mut pools = inner.pools.write();
                                if inner.state.get() == State::Connected {
                                    inner.delete_connection_locked(&mut pools, &endpoint.addr);
                                    true
                                } else {
                                    false
                                }
                            };
                            if detached {
                                let role = endpoint.role();
                                inner.handler_deactivated(conn.as_ref(), role);
                                endpoint.set_conn(None);
                                endpoint.set_role(Role::Unknown);
                            }
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                match endpoint.conn() {
                    None => {
                        if let Err(err) = inner.try_connect(&endpoint, None).await {
                            debug!(
                                target: "boxpool::pool",
                                addr = %endpoint.addr,
                                error = %err,
                                "reopen failed"
                            );
                        }
                    }
                    Some(conn) if !conn.closed_now() => {
                        inner.update_role(&endpoint, &conn).await;
                    }
                    Some(conn) => {
                        inner.reconnect(&endpoint, &conn).await;
                    }
                }
            }
        }
    }
}

/// Probe the role of an instance through an open connection.
async fn probe_role<C: Conn>(conn: &C) -> Result<Role> {
    let response = conn
        .submit(Request::call(ROLE_PROBE_FUNCTION, Value::Array(Vec::new())))
        .await?;
    parse_instance_role(&response)
}

/// Derive a role from a status-call reply. The first positional datum must
/// be a map carrying a `status` string equal to `running` and a boolean
/// `ro` flag.
fn parse_instance_role(response: &Response) -> Result<Role> {
    let info = response
        .first()
        .and_then(Value::as_object)
        .ok_or(Error::IncorrectResponse)?;
    let status = info
        .get("status")
        .and_then(Value::as_str)
        .ok_or(Error::IncorrectResponse)?;
    if status != STATUS_RUNNING {
        return Err(Error::IncorrectStatus(status.to_string()));
    }
    match info.get("ro").and_then(Value::as_bool) {
        Some(false) => Ok(Role::Master),
        Some(true) => Ok(Role::Replica),
        None => Err(Error::IncorrectResponse),
    }
}

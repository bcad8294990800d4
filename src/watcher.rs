//! Pool-level watch subscriptions fanned out across live connections.
//!
//! A pool watcher is a `(key, callback, mode)` subscription. For every live
//! connection whose role matches the mode filter the registry keeps one
//! per-connection subscription; callback delivery stays with the
//! connections. Membership transitions in the pool drive attach/detach, so
//! a watcher follows its role across promotions and demotions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::conn::{Conn, ConnWatcher, WatchCallback};
use crate::error::Result;
use crate::role::{Mode, Role};

pub(crate) struct PoolWatcherState<C: Conn> {
    key: String,
    mode: Mode,
    callback: WatchCallback,
    subscriptions: Mutex<HashMap<String, C::Watcher>>,
    unregistered: AtomicBool,
}

impl<C: Conn> PoolWatcherState<C> {
    fn new(key: &str, callback: WatchCallback, mode: Mode) -> Self {
        Self {
            key: key.to_string(),
            mode,
            callback,
            subscriptions: Mutex::new(HashMap::new()),
            unregistered: AtomicBool::new(false),
        }
    }

    /// Attach a per-connection subscription, once per connection address.
    pub(crate) fn watch(&self, conn: &C) -> Result<()> {
        if self.unregistered.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut subs = self.subscriptions.lock();
        if subs.contains_key(conn.addr()) {
            return Ok(());
        }
        let watcher = conn.watch(&self.key, self.callback.clone())?;
        subs.insert(conn.addr().to_string(), watcher);
        Ok(())
    }

    /// Drop the per-connection subscription for `addr`, if any.
    pub(crate) fn unwatch(&self, addr: &str) {
        if let Some(watcher) = self.subscriptions.lock().remove(addr) {
            watcher.unregister();
        }
    }
}

/// Registry of live pool watchers, traversed on every subpool membership
/// transition. Guarded by its own lock, acquired after the pools-lock.
pub(crate) struct WatcherRegistry<C: Conn> {
    watchers: Mutex<Vec<Arc<PoolWatcherState<C>>>>,
}

impl<C: Conn> WatcherRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, watcher: Arc<PoolWatcherState<C>>) {
        self.watchers.lock().push(watcher);
    }

    fn remove(&self, watcher: &Arc<PoolWatcherState<C>>) -> bool {
        let mut watchers = self.watchers.lock();
        let before = watchers.len();
        watchers.retain(|w| !Arc::ptr_eq(w, watcher));
        watchers.len() != before
    }

    /// Attach every matching watcher to a connection entering a subpool.
    ///
    /// Attachment is all-or-nothing: on the first failure every
    /// subscription attached so far is unwound and the error is returned,
    /// which aborts the connection's admission.
    pub(crate) fn attach_conn(&self, conn: &C, role: Role) -> Result<()> {
        let watchers = self.watchers.lock();
        let mut attached: Vec<&Arc<PoolWatcherState<C>>> = Vec::new();
        for watcher in watchers.iter() {
            if !watcher.mode.matches_role(role) {
                continue;
            }
            if let Err(err) = watcher.watch(conn) {
                for done in attached {
                    done.unwatch(conn.addr());
                }
                warn!(
                    target: "boxpool::watcher",
                    addr = conn.addr(),
                    error = %err,
                    "failed to initialize watchers for connection"
                );
                return Err(err);
            }
            attached.push(watcher);
        }
        Ok(())
    }

    /// Detach every watcher from a connection leaving the subpools.
    pub(crate) fn detach_conn(&self, addr: &str) {
        let watchers = self.watchers.lock();
        for watcher in watchers.iter() {
            watcher.unwatch(addr);
        }
    }
}

/// Handle for a registered pool watcher.
///
/// Dropping the handle does not cancel the subscription; call
/// [`PoolWatcher::unregister`]. After `unregister` returns, no further
/// callback invocations occur from any connection in the pool. Calling
/// `unregister` from inside the watch callback deadlocks.
pub struct PoolWatcher<C: Conn> {
    state: Arc<PoolWatcherState<C>>,
    registry: Arc<WatcherRegistry<C>>,
}

impl<C: Conn> PoolWatcher<C> {
    pub(crate) fn register(
        registry: Arc<WatcherRegistry<C>>,
        key: &str,
        callback: WatchCallback,
        mode: Mode,
    ) -> Self {
        let state = Arc::new(PoolWatcherState::new(key, callback, mode));
        registry.add(state.clone());
        Self { state, registry }
    }

    pub(crate) fn state(&self) -> &Arc<PoolWatcherState<C>> {
        &self.state
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.state.key
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.state.mode
    }

    /// Cancel the subscription on every attached connection and remove the
    /// watcher from the registry.
    pub fn unregister(&self) {
        if self.state.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.remove(&self.state);
        let subs = std::mem::take(&mut *self.state.subscriptions.lock());
        for (_, watcher) in subs {
            watcher.unregister();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::request::{Request, ResponseFuture};
    use std::time::Duration;

    struct StubWatcher {
        active: Arc<AtomicBool>,
    }

    impl ConnWatcher for StubWatcher {
        fn unregister(self) {
            self.active.store(false, Ordering::SeqCst);
        }
    }

    struct StubConn {
        addr: String,
        fail_from: usize,
        watches: Mutex<Vec<(String, Arc<AtomicBool>)>>,
    }

    impl StubConn {
        fn new(addr: &str) -> Self {
            Self {
                addr: addr.to_string(),
                fail_from: usize::MAX,
                watches: Mutex::new(Vec::new()),
            }
        }

        /// Accepts `n` watch requests, fails every request after that.
        fn failing_from(addr: &str, n: usize) -> Self {
            Self {
                fail_from: n,
                ..Self::new(addr)
            }
        }

        fn active_watches(&self) -> usize {
            self.watches
                .lock()
                .iter()
                .filter(|(_, active)| active.load(Ordering::SeqCst))
                .count()
        }
    }

    impl Conn for StubConn {
        type Watcher = StubWatcher;

        fn addr(&self) -> &str {
            &self.addr
        }

        fn submit(&self, _request: Request) -> ResponseFuture {
            ResponseFuture::failed(Error::ConnectionClosed)
        }

        fn connected_now(&self) -> bool {
            true
        }

        fn closed_now(&self) -> bool {
            false
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn close_graceful(&self) -> Result<()> {
            Ok(())
        }

        fn configured_timeout(&self) -> Duration {
            Duration::ZERO
        }

        fn watch(&self, key: &str, _callback: WatchCallback) -> Result<Self::Watcher> {
            let mut watches = self.watches.lock();
            if watches.len() >= self.fail_from {
                return Err(Error::ConnectionClosed);
            }
            let active = Arc::new(AtomicBool::new(true));
            watches.push((key.to_string(), active.clone()));
            Ok(StubWatcher { active })
        }
    }

    fn noop_callback() -> WatchCallback {
        Arc::new(|_event| {})
    }

    fn registry() -> Arc<WatcherRegistry<StubConn>> {
        Arc::new(WatcherRegistry::new())
    }

    #[test]
    fn test_attach_respects_mode_filter() {
        let registry = registry();
        let _rw = PoolWatcher::register(registry.clone(), "k", noop_callback(), Mode::Rw);
        let _any = PoolWatcher::register(registry.clone(), "k", noop_callback(), Mode::Any);

        let replica = StubConn::new("replica:3301");
        registry.attach_conn(&replica, Role::Replica).unwrap();
        // Only the Any-mode watcher matches a replica.
        assert_eq!(replica.watches.lock().len(), 1);

        let master = StubConn::new("master:3301");
        registry.attach_conn(&master, Role::Master).unwrap();
        assert_eq!(master.watches.lock().len(), 2);
    }

    #[test]
    fn test_attach_is_idempotent_per_addr() {
        let registry = registry();
        let _w = PoolWatcher::register(registry.clone(), "k", noop_callback(), Mode::Any);

        let conn = StubConn::new("a:3301");
        registry.attach_conn(&conn, Role::Master).unwrap();
        registry.attach_conn(&conn, Role::Master).unwrap();
        assert_eq!(conn.watches.lock().len(), 1);
    }

    #[test]
    fn test_attach_failure_unwinds_attached_subscriptions() {
        let registry = registry();
        let good = PoolWatcher::register(registry.clone(), "k1", noop_callback(), Mode::Any);

        let conn = StubConn::new("a:3301");
        registry.attach_conn(&conn, Role::Master).unwrap();
        assert_eq!(conn.active_watches(), 1);

        // A connection that accepts the first watch and refuses the second:
        // the registry must not leave the partial subscription behind.
        let registry2 = self::registry();
        let _w1 = PoolWatcher::register(registry2.clone(), "k1", noop_callback(), Mode::Any);
        let _w2 = PoolWatcher::register(registry2.clone(), "k2", noop_callback(), Mode::Any);
        let failing = StubConn::failing_from("b:3301", 1);
        assert!(registry2.attach_conn(&failing, Role::Master).is_err());
        assert_eq!(failing.active_watches(), 0);

        good.unregister();
        assert_eq!(conn.active_watches(), 0);
    }

    #[test]
    fn test_detach_conn_unregisters_subscription() {
        let registry = registry();
        let _w = PoolWatcher::register(registry.clone(), "k", noop_callback(), Mode::Any);

        let conn = StubConn::new("a:3301");
        registry.attach_conn(&conn, Role::Master).unwrap();
        assert_eq!(conn.active_watches(), 1);

        registry.detach_conn(conn.addr());
        assert_eq!(conn.active_watches(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent_and_blocks_new_attaches() {
        let registry = registry();
        let watcher = PoolWatcher::register(registry.clone(), "k", noop_callback(), Mode::Any);

        let conn = StubConn::new("a:3301");
        registry.attach_conn(&conn, Role::Master).unwrap();

        watcher.unregister();
        watcher.unregister();
        assert_eq!(conn.active_watches(), 0);

        // A later membership transition must not resubscribe.
        let late = StubConn::new("b:3301");
        registry.attach_conn(&late, Role::Master).unwrap();
        assert_eq!(late.watches.lock().len(), 0);
    }
}

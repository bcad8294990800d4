//! The connection contract consumed by the pool.
//!
//! The pool never speaks the wire protocol itself. It is generic over a
//! [`Connect`] implementation that dials a single instance and returns a
//! [`Conn`]: a pipelined client that accepts requests synchronously,
//! delivers replies through [`ResponseFuture`]s, publishes state-change
//! events into a bounded notify channel, and exposes per-key watch
//! subscriptions.
//!
//! Production deployments plug in the real protocol client; tests plug in
//! an in-memory double. The pool's behavior is identical either way.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::request::{Request, ResponseFuture};

/// Connection state-change notification.
///
/// Published by the connection into the notify channel handed to it at dial
/// time. Publishing is non-blocking and lossy on overflow; the pool's
/// periodic check tick is the safety net for dropped events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The connection (re-)established its transport.
    Connected,
    /// The transport dropped; the connection may try to recover.
    Disconnected,
    /// The connection is closed for good.
    Closed,
}

/// Protocol capabilities negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFeature {
    /// Interactive streams and transactions over them.
    Streams,
    /// Server-pushed watch notifications.
    Watchers,
}

/// Immutable connection options template.
///
/// The pool clones the template once per endpoint and fills in the
/// endpoint's `notify` sender, so each connection reports state changes to
/// its own controller.
#[derive(Debug, Clone, Default)]
pub struct ConnOpts {
    /// User name for authentication, empty for guest access.
    pub user: String,
    /// Password for authentication.
    pub password: String,
    /// Per-request timeout the connection should apply. Zero means no
    /// bound; reported back through [`Conn::configured_timeout`].
    pub request_timeout: Duration,
    /// Features the connection must negotiate for the pool surface to be
    /// fully usable. Pool watchers require [`ProtocolFeature::Watchers`].
    pub required_features: Vec<ProtocolFeature>,
    /// State-change sink, installed by the pool. Capacity is bounded and
    /// publishing must be lossy (`try_send`), never blocking.
    pub notify: Option<mpsc::Sender<ConnEvent>>,
}

impl ConnOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_required_features(mut self, features: Vec<ProtocolFeature>) -> Self {
        self.required_features = features;
        self
    }

    /// Whether the template requires the given protocol feature.
    #[must_use]
    pub fn requires(&self, feature: ProtocolFeature) -> bool {
        self.required_features.contains(&feature)
    }
}

/// Server-pushed notification delivered to a watch callback.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The watched key.
    pub key: String,
    /// Current value broadcast for the key.
    pub value: Value,
}

/// Callback invoked by a connection for every broadcast on a watched key.
///
/// Invoked on the connection's internal task; must not block.
pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Handle for a single per-connection watch subscription.
pub trait ConnWatcher: Send + 'static {
    /// Cancel the subscription. After this returns the callback will not be
    /// invoked again through this subscription.
    fn unregister(self);
}

/// A single pipelined connection to one instance.
pub trait Conn: Send + Sync + 'static {
    type Watcher: ConnWatcher;

    /// Address this connection was dialed to.
    fn addr(&self) -> &str;

    /// Submit a request. Submission never suspends; the returned future
    /// resolves when the reply arrives. Concurrent submissions are
    /// pipelined.
    fn submit(&self, request: Request) -> ResponseFuture;

    /// Whether the transport is established at this moment.
    fn connected_now(&self) -> bool;

    /// Whether the connection is closed for good.
    fn closed_now(&self) -> bool;

    /// Force-close: abort in-flight requests and release the transport.
    fn close(&self) -> Result<()>;

    /// Graceful close: stop accepting new requests, let in-flight requests
    /// drain, then release the transport.
    fn close_graceful(&self) -> impl Future<Output = Result<()>> + Send;

    /// The per-request timeout this connection was configured with.
    fn configured_timeout(&self) -> Duration;

    /// Subscribe to broadcasts on `key`. The connection owns callback
    /// delivery for the lifetime of the returned watcher.
    fn watch(&self, key: &str, callback: WatchCallback) -> Result<Self::Watcher>;
}

/// Dialer for single instances.
pub trait Connect: Send + Sync + 'static {
    type Conn: Conn;

    /// Open a connection to `addr` with the given options. Blocks on the
    /// network; the pool bounds or cancels the call as its lifecycle
    /// requires.
    fn connect(
        &self,
        addr: &str,
        opts: &ConnOpts,
    ) -> impl Future<Output = Result<Self::Conn>> + Send;
}

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! A role-aware connection pool for replicated box-protocol database
//! clusters.
//!
//! `boxpool` keeps a persistent connection to every configured instance of
//! a replicated cluster, discovers which instances are masters and which
//! are replicas, and routes requests to a suitable connection according to
//! a caller-supplied [`Mode`]. Master discovery is automatic: every
//! endpoint is re-probed on a periodic tick and relocated between the
//! role subpools when a promotion or demotion is observed.
//!
//! # Features
//!
//! - **Round-robin routing**: requests rotate fairly over the connections
//!   of the selected role subpool.
//! - **Automatic master discovery**: the `box.info` status call classifies
//!   every instance; role flips are picked up within one check interval.
//! - **Reconnection**: endpoints that lose their connection are reopened
//!   in the background; dispatch simply skips them meanwhile.
//! - **Dynamic membership**: endpoints can be added to and removed from a
//!   running pool.
//! - **Pool watchers**: keyed server-push subscriptions that follow role
//!   changes across the cluster.
//! - **Graceful shutdown**: [`Pool::close_graceful`] lets in-flight
//!   requests drain; [`Pool::close`] aborts them, and may interrupt a
//!   graceful close in progress.
//!
//! The pool does not speak the wire protocol itself: it is generic over a
//! [`Connect`] dialer producing [`Conn`] instances, which keeps the
//! routing, lifecycle and fan-out logic independent of any particular
//! client implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use boxpool::{ConnOpts, Mode, Pool, PoolConfig, Request};
//!
//! let pool = Pool::connect_with_config(
//!     dialer,
//!     &["127.0.0.1:3301", "127.0.0.1:3302"],
//!     ConnOpts::new().with_user("app"),
//!     PoolConfig::new().with_check_interval(std::time::Duration::from_secs(1)),
//! )
//! .await?;
//!
//! // Writes go to the master, reads rotate over the replicas.
//! pool.send(Request::ping(), Mode::Rw).await?;
//! let resp = pool.send(Request::call("dashboard.stats", args), Mode::PreferRo).await?;
//!
//! pool.close_graceful().await;
//! ```

mod conn;
mod error;
mod pool;
mod request;
mod role;
mod round_robin;
mod watcher;

pub use conn::{
    Conn, ConnEvent, ConnOpts, ConnWatcher, Connect, ProtocolFeature, WatchCallback, WatchEvent,
};
pub use error::{Error, Result};
pub use pool::{ConnectionHandler, ConnectionInfo, Pool, PoolConfig, PoolStats};
pub use request::{Prepared, Request, RequestKind, Response, ResponseFuture, Stream};
pub use role::{Mode, Role};
pub use watcher::PoolWatcher;

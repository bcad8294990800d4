//! Requests, responses and the future handle returned by dispatch.
//!
//! A [`Request`] is the unit of work routed by the pool. Most requests are
//! *free*: the dispatcher picks a connection for them according to the
//! caller's routing mode. Requests produced through a [`Prepared`] statement
//! or a [`Stream`] are *connection-bound*: they carry the address of the
//! connection they originated on and are always routed back to it.
//!
//! Submission is eager and pipelined: a connection accepts a request
//! synchronously and hands back a [`ResponseFuture`] that resolves when the
//! reply arrives. A future can also be created pre-failed, which is how the
//! dispatcher reports routing errors without suspending.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The operation a request performs. The wire encoding is the connection
/// implementation's concern; the pool only routes.
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Empty liveness request.
    Ping,
    /// Call a server-side function by name.
    Call {
        function: String,
        args: Value,
    },
    /// Evaluate an expression on the server.
    Eval {
        expression: String,
        args: Value,
    },
    /// Execute an SQL statement.
    Execute {
        sql: String,
        args: Value,
    },
    /// Prepare an SQL statement on one connection.
    Prepare {
        sql: String,
    },
    /// Execute a previously prepared statement.
    ExecutePrepared {
        sql: String,
        args: Value,
    },
    /// Drop a previously prepared statement.
    Unprepare {
        sql: String,
    },
    /// Open an interactive transaction on a stream.
    Begin,
    /// Commit the transaction of a stream.
    Commit,
    /// Roll back the transaction of a stream.
    Rollback,
}

/// A routable request.
#[derive(Debug, Clone)]
pub struct Request {
    kind: RequestKind,
    bound_addr: Option<String>,
    stream_id: Option<u64>,
}

impl Request {
    fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            bound_addr: None,
            stream_id: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(RequestKind::Ping)
    }

    pub fn call(function: impl Into<String>, args: Value) -> Self {
        Self::new(RequestKind::Call {
            function: function.into(),
            args,
        })
    }

    pub fn eval(expression: impl Into<String>, args: Value) -> Self {
        Self::new(RequestKind::Eval {
            expression: expression.into(),
            args,
        })
    }

    pub fn execute(sql: impl Into<String>, args: Value) -> Self {
        Self::new(RequestKind::Execute {
            sql: sql.into(),
            args,
        })
    }

    pub fn prepare(sql: impl Into<String>) -> Self {
        Self::new(RequestKind::Prepare { sql: sql.into() })
    }

    #[must_use]
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Address of the originating connection for connection-bound requests.
    #[must_use]
    pub fn bound_addr(&self) -> Option<&str> {
        self.bound_addr.as_deref()
    }

    /// Stream this request belongs to, if any.
    #[must_use]
    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    /// Whether this request must be routed to its originating connection.
    #[must_use]
    pub fn is_connection_bound(&self) -> bool {
        self.bound_addr.is_some()
    }

    fn bound_to(mut self, addr: &str) -> Self {
        self.bound_addr = Some(addr.to_string());
        self
    }
}

/// A decoded reply. `data` holds the positional response rows.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub data: Vec<Value>,
}

impl Response {
    pub fn new(data: Vec<Value>) -> Self {
        Self { data }
    }

    /// First positional datum, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Value> {
        self.data.first()
    }
}

enum FutureState {
    Ready(Option<Result<Response>>),
    Pending(oneshot::Receiver<Result<Response>>),
}

/// Future handle for a submitted request.
///
/// The request itself was accepted (or rejected) at submission time; this
/// future only waits for the reply. If the connection drops the reply
/// channel the future resolves to [`Error::ConnectionClosed`].
pub struct ResponseFuture {
    state: FutureState,
}

impl ResponseFuture {
    /// A future that resolves immediately with the given result.
    pub fn ready(result: Result<Response>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
        }
    }

    /// A pre-failed future, used by the dispatcher to report routing and
    /// lifecycle errors.
    pub fn failed(err: Error) -> Self {
        Self::ready(Err(err))
    }

    /// A reply channel pair: the sender side is kept by the connection and
    /// completed when the reply arrives.
    pub fn channel() -> (oneshot::Sender<Result<Response>>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                state: FutureState::Pending(rx),
            },
        )
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Ready(slot) => match slot.take() {
                Some(result) => Poll::Ready(result),
                None => Poll::Pending,
            },
            FutureState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// A prepared SQL statement, bound to the connection that prepared it.
///
/// Requests built from a `Prepared` are connection-bound: the dispatcher
/// routes them to the preparing connection and fails them with
/// [`Error::UnknownRequest`] once that connection has left the pool.
#[derive(Debug, Clone)]
pub struct Prepared {
    conn_addr: String,
    sql: String,
}

impl Prepared {
    pub(crate) fn new(conn_addr: &str, sql: impl Into<String>) -> Self {
        Self {
            conn_addr: conn_addr.to_string(),
            sql: sql.into(),
        }
    }

    #[must_use]
    pub fn conn_addr(&self) -> &str {
        &self.conn_addr
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Execute the prepared statement with the given arguments.
    pub fn execute(&self, args: Value) -> Request {
        Request::new(RequestKind::ExecutePrepared {
            sql: self.sql.clone(),
            args,
        })
        .bound_to(&self.conn_addr)
    }

    /// Drop the prepared statement on its connection.
    pub fn unprepare(&self) -> Request {
        Request::new(RequestKind::Unprepare {
            sql: self.sql.clone(),
        })
        .bound_to(&self.conn_addr)
    }
}

/// An interactive stream over a single connection.
///
/// All requests bound to a stream are routed to the connection the stream
/// was opened on, regardless of the routing mode passed to dispatch.
#[derive(Debug, Clone)]
pub struct Stream {
    conn_addr: String,
    id: u64,
}

impl Stream {
    pub(crate) fn new(conn_addr: &str, id: u64) -> Self {
        Self {
            conn_addr: conn_addr.to_string(),
            id,
        }
    }

    #[must_use]
    pub fn conn_addr(&self) -> &str {
        &self.conn_addr
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bind a request to this stream.
    pub fn bind(&self, mut request: Request) -> Request {
        request.stream_id = Some(self.id);
        request.bound_to(&self.conn_addr)
    }

    pub fn begin(&self) -> Request {
        self.bind(Request::new(RequestKind::Begin))
    }

    pub fn commit(&self) -> Request {
        self.bind(Request::new(RequestKind::Commit))
    }

    pub fn rollback(&self) -> Request {
        self.bind(Request::new(RequestKind::Rollback))
    }
}

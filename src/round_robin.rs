//! Round-robin rotation over an ordered set of connections.

use std::collections::HashMap;
use std::sync::Arc;

/// An insertion-ordered set of `(addr, conn)` pairs with a rotating cursor.
///
/// Not internally synchronized: every subpool is guarded by the pool's
/// pools-lock so that rotation, membership changes and watcher fan-out all
/// observe the same snapshot.
pub(crate) struct RoundRobin<C> {
    order: Vec<String>,
    conns: HashMap<String, Arc<C>>,
    cursor: usize,
}

impl<C> RoundRobin<C> {
    pub(crate) fn new() -> Self {
        Self {
            order: Vec::new(),
            conns: HashMap::new(),
            cursor: 0,
        }
    }

    /// Add a connection under `addr`. Replacing an existing entry keeps its
    /// rotation position; a new entry is appended at the end.
    pub(crate) fn add(&mut self, addr: &str, conn: Arc<C>) {
        if self.conns.insert(addr.to_string(), conn).is_none() {
            self.order.push(addr.to_string());
        }
    }

    /// Remove and return the connection registered under `addr`.
    pub(crate) fn delete_by_addr(&mut self, addr: &str) -> Option<Arc<C>> {
        let conn = self.conns.remove(addr)?;
        if let Some(pos) = self.order.iter().position(|a| a == addr) {
            self.order.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        }
        Some(conn)
    }

    pub(crate) fn get_by_addr(&self, addr: &str) -> Option<Arc<C>> {
        self.conns.get(addr).cloned()
    }

    /// The connection at the cursor; advances the cursor by one modulo the
    /// current size. `None` iff the set is empty.
    pub(crate) fn next(&mut self) -> Option<Arc<C>> {
        if self.order.is_empty() {
            return None;
        }
        let addr = &self.order[self.cursor % self.order.len()];
        let conn = self.conns.get(addr).cloned();
        self.cursor = (self.cursor + 1) % self.order.len();
        conn
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All connections in rotation order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<C>> {
        self.order
            .iter()
            .filter_map(|addr| self.conns.get(addr).cloned())
            .collect()
    }
}

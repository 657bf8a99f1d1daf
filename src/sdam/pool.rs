use super::address::ServerAddress;
use crate::connection::{Connection, Connector};
use crate::error::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Idle connections kept per server.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Operation connections to one server, stamped with a generation.
///
/// Clearing the pool bumps the generation; connections opened under an
/// older generation are dropped instead of reused.
#[derive(Debug, Clone)]
pub struct ServerPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    address: ServerAddress,
    generation: AtomicU32,
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl ServerPool {
    pub fn new(address: ServerAddress, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                address,
                generation: AtomicU32::new(0),
                connector,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    pub fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every connection opened so far. Returns the new generation.
    pub fn clear(&self) -> u32 {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.idle().clear();
        info!(server = %self.inner.address, generation, "connection pool cleared");
        generation
    }

    /// Whether `connection` predates the last clear.
    pub fn is_stale(&self, connection: &dyn Connection) -> bool {
        connection.generation() < self.generation()
    }

    /// An idle connection of the current generation, or a new one.
    pub async fn check_out(&self) -> Result<Box<dyn Connection>> {
        let reusable = {
            let mut idle = self.idle();
            let mut found = None;
            while let Some(connection) = idle.pop() {
                if connection.is_connected() && !self.is_stale(connection.as_ref()) {
                    found = Some(connection);
                    break;
                }
            }
            found
        };
        match reusable {
            Some(connection) => Ok(connection),
            None => {
                self.inner
                    .connector
                    .connect(&self.inner.address, self.generation())
                    .await
            }
        }
    }

    /// Return a connection for reuse; stale or broken ones are dropped.
    pub fn check_in(&self, connection: Box<dyn Connection>) {
        if !connection.is_connected() || self.is_stale(connection.as_ref()) {
            return;
        }
        let mut idle = self.idle();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn Connection>>> {
        // a panic while holding the lock leaves a plain Vec behind, still usable
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

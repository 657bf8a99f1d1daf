//! The per-deployment owner of topology state.
//!
//! One [`Cluster`] holds the current [`TopologyDescription`] behind a single
//! lock, runs one monitor task per tracked server, and publishes every new
//! snapshot on a `watch` channel that server selection waits on.

use super::address::ServerAddress;
use super::description::ServerDescription;
use super::events::{diff, SdamEvent, EVENT_CHANNEL_CAPACITY};
use super::monitor::{Monitor, MonitorOptions};
use super::pool::ServerPool;
use super::selection::{select, SelectionCriteria};
use super::topology::{TopologyDescription, TopologyType};
use crate::connection::Connector;
use crate::error::{MongoError, Result};
use crate::options::ClientOptions;
use crate::wire::CompressorRegistry;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

/// A server chosen by selection, with the pool to run the operation on.
#[derive(Debug, Clone)]
pub struct SelectedServer {
    pub description: ServerDescription,
    pub pool: ServerPool,
    /// Type of the topology the server was selected from.
    pub topology_type: TopologyType,
}

impl SelectedServer {
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }
}

/// Handle to a monitored deployment. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug)]
struct ClusterInner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    compressors: Arc<CompressorRegistry>,
    state: Mutex<ClusterState>,
    topology_tx: watch::Sender<TopologyDescription>,
    events: broadcast::Sender<SdamEvent>,
    updates: mpsc::UnboundedSender<ServerDescription>,
    closed: AtomicBool,
}

#[derive(Debug)]
struct ClusterState {
    topology: TopologyDescription,
    servers: HashMap<ServerAddress, ServerHandle>,
}

#[derive(Debug)]
struct ServerHandle {
    pool: ServerPool,
    scan: mpsc::Sender<()>,
    monitor: JoinHandle<()>,
}

impl Cluster {
    /// Start monitoring the deployment described by `options`.
    ///
    /// Must be called inside a tokio runtime. Invalid options fail here,
    /// before any task is started.
    pub fn new(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let topology = TopologyDescription::new(&options)?;
        let runtime = Handle::try_current().map_err(|_| {
            MongoError::configuration("a cluster must be created inside a tokio runtime")
        })?;

        let (updates, mut update_rx) = mpsc::unbounded_channel();
        let (topology_tx, _) = watch::channel(topology.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(ClusterInner {
            options,
            connector,
            compressors: Arc::new(CompressorRegistry::default()),
            state: Mutex::new(ClusterState {
                topology: topology.clone(),
                servers: HashMap::new(),
            }),
            topology_tx,
            events,
            updates,
            closed: AtomicBool::new(false),
        });

        {
            let mut state = inner.lock();
            for address in topology.addresses() {
                inner.start_monitor(&mut state, address.clone());
            }
        }

        // Monitors only hold the sender, so the updater ends once the
        // cluster is dropped and the monitors are aborted.
        let weak = Arc::downgrade(&inner);
        runtime.spawn(async move {
            while let Some(description) = update_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.apply(description);
            }
        });

        info!(
            topology_type = ?topology.topology_type,
            seeds = topology.len(),
            "cluster started"
        );
        Ok(Self { inner })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn compressors(&self) -> &CompressorRegistry {
        &self.inner.compressors
    }

    /// The current topology snapshot.
    pub fn topology(&self) -> TopologyDescription {
        self.inner.topology_tx.borrow().clone()
    }

    /// A receiver that observes every new topology snapshot.
    pub fn watch_topology(&self) -> watch::Receiver<TopologyDescription> {
        self.inner.topology_tx.subscribe()
    }

    /// Subscribe to discovery and monitoring events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SdamEvent> {
        self.inner.events.subscribe()
    }

    /// Ask the monitor of `address` to check it as soon as allowed.
    pub fn request_immediate_scan(&self, address: &ServerAddress) {
        let state = self.inner.lock();
        if let Some(handle) = state.servers.get(address) {
            // a full channel means a scan is already pending
            let _ = handle.scan.try_send(());
        }
    }

    /// Record an operation-level failure against `address`.
    pub fn mark_server_unknown(&self, address: &ServerAddress, error: MongoError) {
        debug!(server = %address, %error, "marking server unknown");
        self.inner
            .apply(ServerDescription::from_error(address.clone(), error));
    }

    /// Wait until a server matches `criteria` or the selection timeout elapses.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        let deadline = Instant::now() + self.inner.options.server_selection_timeout();
        let mut topology_rx = self.inner.topology_tx.subscribe();

        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(MongoError::Shutdown);
            }

            let chosen = {
                let topology = topology_rx.borrow_and_update();
                let candidates = select(&topology, criteria)?;
                let first = candidates
                    .first()
                    .map(|server| ((*server).clone(), topology.topology_type));
                first
            };
            if let Some((description, topology_type)) = chosen {
                if let Some(pool) = self.inner.pool(&description.address) {
                    trace!(server = %description.address, ?criteria, "selected server");
                    return Ok(SelectedServer {
                        description,
                        pool,
                        topology_type,
                    });
                }
            }

            debug!(?criteria, "no suitable server, waiting for a topology change");
            self.inner.request_scans();
            match timeout_at(deadline, topology_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(MongoError::Shutdown),
                Err(_) => {
                    return Err(MongoError::ServerSelectionTimeout(format!(
                        "no server matching {:?} after {:?}; {}",
                        criteria,
                        self.inner.options.server_selection_timeout(),
                        summarize(&topology_rx.borrow())
                    )))
                }
            }
        }
    }

    /// Stop every monitor and wait for their connections to drop.
    ///
    /// Pending selections fail with `Shutdown`. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let servers: Vec<_> = self.inner.lock().servers.drain().collect();
        let mut monitors = Vec::with_capacity(servers.len());
        for (address, handle) in servers {
            handle.monitor.abort();
            monitors.push(handle.monitor);
            let _ = self.inner.events.send(SdamEvent::ServerClosed { address });
        }
        // wake selections so they observe the closed flag
        self.inner.topology_tx.send_modify(|_| {});
        // aborted tasks only report cancellation
        let _ = join_all(monitors).await;
        info!("cluster closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl ClusterInner {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool(&self, address: &ServerAddress) -> Option<ServerPool> {
        self.lock().servers.get(address).map(|h| h.pool.clone())
    }

    fn request_scans(&self) {
        for handle in self.lock().servers.values() {
            let _ = handle.scan.try_send(());
        }
    }

    fn start_monitor(&self, state: &mut ClusterState, address: ServerAddress) {
        let (scan, monitor) = Monitor::spawn(
            address.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.compressors),
            MonitorOptions::from(&self.options),
            self.updates.clone(),
        );
        let pool = ServerPool::new(address.clone(), Arc::clone(&self.connector));
        state.servers.insert(address, ServerHandle { pool, scan, monitor });
    }

    /// Apply one description: the only path that changes the topology.
    fn apply(&self, description: ServerDescription) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock();

        if description.error().map_or(false, MongoError::is_network_error) {
            if let Some(handle) = state.servers.get(&description.address) {
                handle.pool.clear();
            }
        }

        let next = state.topology.apply(description);
        let events = diff(&state.topology, &next);

        for address in next.addresses() {
            if !state.servers.contains_key(address) {
                self.start_monitor(&mut state, address.clone());
            }
        }
        let removed: Vec<ServerAddress> = state
            .servers
            .keys()
            .filter(|address| !next.contains(address))
            .cloned()
            .collect();
        for address in removed {
            if let Some(handle) = state.servers.remove(&address) {
                handle.monitor.abort();
            }
        }

        for event in &events {
            if let SdamEvent::ServerDescriptionChanged { address, previous, new } = event {
                if previous.server_type != new.server_type {
                    info!(
                        server = %address,
                        from = ?previous.server_type,
                        to = ?new.server_type,
                        "server type changed"
                    );
                }
            }
        }

        state.topology = next.clone();
        self.topology_tx.send_replace(next);
        drop(state);

        for event in events {
            let _ = self.events.send(event);
        }
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in state.servers.values() {
            handle.monitor.abort();
        }
    }
}

fn summarize(topology: &TopologyDescription) -> String {
    let servers: Vec<String> = topology
        .servers()
        .map(|s| match s.error() {
            Some(error) => format!("{} {:?} ({})", s.address, s.server_type, error),
            None => format!("{} {:?}", s.address, s.server_type),
        })
        .collect();
    format!(
        "topology {:?} with servers [{}]",
        topology.topology_type,
        servers.join(", ")
    )
}

use super::address::ServerAddress;
use super::description::{next_round_trip_time, ServerDescription};
use crate::connection::{exchange, Connection, Connector};
use crate::doc;
use crate::document::Document;
use crate::error::{MongoError, Result};
use crate::options::ClientOptions;
use crate::wire::{CompressorRegistry, Message, OpMsg, OpQuery};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

const DRIVER_NAME: &str = "mongo-core";

/// The settings a monitor reads from the client options.
#[derive(Debug, Clone)]
pub(crate) struct MonitorOptions {
    pub heartbeat_frequency: Duration,
    pub min_heartbeat_frequency: Duration,
    pub connect_timeout: Duration,
    pub app_name: Option<String>,
    pub compressors: Vec<String>,
    pub max_message_size: usize,
}

impl From<&ClientOptions> for MonitorOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            heartbeat_frequency: options.heartbeat_frequency(),
            min_heartbeat_frequency: options.min_heartbeat_frequency(),
            connect_timeout: options.connect_timeout(),
            app_name: options.app_name.clone(),
            compressors: options.compressors.clone(),
            max_message_size: options.max_message_size_bytes,
        }
    }
}

/// Round-trip time average of one server, shared by its monitor and sampler.
#[derive(Debug, Clone, Default)]
pub(crate) struct RoundTripTime {
    average: Arc<Mutex<Option<Duration>>>,
}

impl RoundTripTime {
    /// Fold `sample` into the average and return the new average.
    pub(crate) fn add_sample(&self, sample: Duration) -> Duration {
        let mut average = self.lock();
        let next = next_round_trip_time(*average, sample);
        *average = Some(next);
        next
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        *self.lock()
    }

    pub(crate) fn reset(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Duration>> {
        self.average
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Open a monitoring connection, bounded by the connect timeout.
async fn open_connection(
    connector: &dyn Connector,
    address: &ServerAddress,
    connect_timeout: Duration,
) -> Result<Box<dyn Connection>> {
    timeout(connect_timeout, connector.connect(address, 0))
        .await
        .map_err(|_| MongoError::network(format!("connecting to {} timed out", address)))?
}

/// Background checker for one server.
///
/// Owns a dedicated monitoring connection. Each check produces a fresh
/// [`ServerDescription`] sent to the cluster's updater; scan requests arrive
/// on a bounded channel of capacity one, so a burst of requests collapses
/// into a single early check.
pub(crate) struct Monitor {
    address: ServerAddress,
    connector: Arc<dyn Connector>,
    compressors: Arc<CompressorRegistry>,
    options: MonitorOptions,
    updates: mpsc::UnboundedSender<ServerDescription>,
    scan_requests: mpsc::Receiver<()>,
    connection: Option<Box<dyn Connection>>,
    previous: Option<ServerDescription>,
    rtt: RoundTripTime,
    rtt_sampler: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Start monitoring `address`. Returns the scan request sender and the task.
    pub(crate) fn spawn(
        address: ServerAddress,
        connector: Arc<dyn Connector>,
        compressors: Arc<CompressorRegistry>,
        options: MonitorOptions,
        updates: mpsc::UnboundedSender<ServerDescription>,
    ) -> (mpsc::Sender<()>, JoinHandle<()>) {
        let (scan_tx, scan_requests) = mpsc::channel(1);
        let monitor = Monitor {
            address,
            connector,
            compressors,
            options,
            updates,
            scan_requests,
            connection: None,
            previous: None,
            rtt: RoundTripTime::default(),
            rtt_sampler: None,
        };
        (scan_tx, tokio::spawn(monitor.run()))
    }

    async fn run(mut self) {
        debug!(server = %self.address, "monitor started");
        loop {
            let started = Instant::now();
            let description = self.check().await;
            let streaming = description.topology_version.is_some();
            self.previous = Some(description.clone());
            if self.updates.send(description).is_err() {
                break;
            }
            if !self.wait(started, streaming).await {
                break;
            }
        }
        debug!(server = %self.address, "monitor stopped");
    }

    /// Sleep until the next check is due. Returns false when the cluster is gone.
    async fn wait(&mut self, started: Instant, streaming: bool) -> bool {
        let earliest = started + self.options.min_heartbeat_frequency;
        // a server that answered an awaitable check is polled again right away
        let next = if streaming {
            earliest
        } else {
            started + self.options.heartbeat_frequency
        };

        tokio::select! {
            _ = sleep_until(next) => true,
            request = self.scan_requests.recv() => match request {
                Some(()) => {
                    trace!(server = %self.address, "immediate scan requested");
                    sleep_until(earliest).await;
                    true
                }
                None => false,
            },
            _ = self.updates.closed() => false,
        }
    }

    /// Run one check. Failures become an Unknown description carrying the error.
    async fn check(&mut self) -> ServerDescription {
        match self.check_server().await {
            Ok((reply, sample)) => {
                let rtt = match sample {
                    Some(sample) => Some(self.rtt.add_sample(sample)),
                    // awaitable replies say nothing about latency
                    None => self.rtt.average(),
                };
                let description = ServerDescription::from_reply(self.address.clone(), reply, rtt);
                if description.topology_version.is_some() {
                    self.start_rtt_sampler();
                }
                description
            }
            Err(error) => {
                warn!(server = %self.address, %error, "server check failed");
                self.connection = None;
                self.stop_rtt_sampler();
                self.rtt.reset();
                ServerDescription::from_error(self.address.clone(), error)
            }
        }
    }

    /// Streaming checks block on the server, so latency is sampled on a
    /// separate connection at the heartbeat frequency.
    fn start_rtt_sampler(&mut self) {
        if self.rtt_sampler.is_some() {
            return;
        }
        debug!(server = %self.address, "starting round trip time sampler");
        let sampler = RttSampler {
            address: self.address.clone(),
            connector: Arc::clone(&self.connector),
            compressors: Arc::clone(&self.compressors),
            options: self.options.clone(),
            rtt: self.rtt.clone(),
            connection: None,
            hello_ok: false,
        };
        self.rtt_sampler = Some(tokio::spawn(sampler.run()));
    }

    fn stop_rtt_sampler(&mut self) {
        if let Some(sampler) = self.rtt_sampler.take() {
            sampler.abort();
        }
    }

    /// Send the handshake and return the reply with a latency sample.
    async fn check_server(&mut self) -> Result<(Document, Option<Duration>)> {
        let started = Instant::now();
        let (mut connection, fresh) = match self.connection.take() {
            Some(connection) if connection.is_connected() => (connection, false),
            _ => {
                let connection = open_connection(
                    self.connector.as_ref(),
                    &self.address,
                    self.options.connect_timeout,
                )
                .await?;
                (connection, true)
            }
        };

        let awaitable = !fresh
            && self
                .previous
                .as_ref()
                .map_or(false, |d| d.topology_version.is_some());
        let message = self.handshake(fresh, awaitable);
        let limit = if awaitable {
            self.options.connect_timeout + self.options.heartbeat_frequency
        } else {
            self.options.connect_timeout
        };

        let reply = timeout(
            limit,
            exchange(
                connection.as_mut(),
                &message,
                &self.compressors,
                self.options.max_message_size,
            ),
        )
        .await
        .map_err(|_| MongoError::network(format!("check of {} timed out", self.address)))??
        .ok_or_else(|| MongoError::protocol("handshake produced no reply"))?;
        let elapsed = started.elapsed();

        let reply = reply.into_reply_document()?;
        self.connection = Some(connection);
        Ok((reply, if awaitable { None } else { Some(elapsed) }))
    }

    /// The handshake for the next check.
    ///
    /// A new connection always opens with legacy `isMaster` carrying the
    /// client metadata; later checks use OP_MSG once the server allows it.
    fn handshake(&self, fresh: bool, awaitable: bool) -> Message {
        let previous = self.previous.as_ref().filter(|d| d.error.is_none());
        let hello_ok = previous.map_or(false, |d| d.hello_ok);
        let op_msg = previous.map_or(false, |d| d.hello_ok || d.max_wire_version >= 6);

        if fresh || !op_msg {
            let mut command = doc! { "isMaster": 1, "helloOk": true };
            if fresh {
                command.insert("client", self.client_metadata());
                let compression: Vec<&str> =
                    self.options.compressors.iter().map(String::as_str).collect();
                command.insert("compression", compression);
            }
            return Message::Query(OpQuery::command("admin", command));
        }

        let mut command = if hello_ok {
            doc! { "hello": 1 }
        } else {
            doc! { "isMaster": 1 }
        };
        if let Some(version) = previous
            .and_then(|d| d.topology_version.as_ref())
            .filter(|_| awaitable)
        {
            command.insert("topologyVersion", version.to_document());
            command.insert(
                "maxAwaitTimeMS",
                self.options.heartbeat_frequency.as_millis() as i64,
            );
        }
        Message::Msg(OpMsg::command("admin", command))
    }

    fn client_metadata(&self) -> Document {
        let mut metadata = doc! {
            "driver": doc! { "name": DRIVER_NAME, "version": crate::version() },
            "os": doc! { "type": std::env::consts::OS, "architecture": std::env::consts::ARCH },
        };
        if let Some(name) = &self.options.app_name {
            metadata.insert("application", doc! { "name": name.as_str() });
        }
        metadata
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_rtt_sampler();
    }
}

/// Measures latency with plain, non-awaitable handshakes.
struct RttSampler {
    address: ServerAddress,
    connector: Arc<dyn Connector>,
    compressors: Arc<CompressorRegistry>,
    options: MonitorOptions,
    rtt: RoundTripTime,
    connection: Option<Box<dyn Connection>>,
    hello_ok: bool,
}

impl RttSampler {
    async fn run(mut self) {
        let period = self.options.heartbeat_frequency;
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            match self.sample().await {
                Ok(sample) => {
                    let average = self.rtt.add_sample(sample);
                    trace!(server = %self.address, ?sample, ?average, "round trip time sampled");
                }
                Err(error) => {
                    // the monitor's own check reports the failure
                    debug!(server = %self.address, %error, "round trip sample failed");
                    self.connection = None;
                }
            }
        }
    }

    async fn sample(&mut self) -> Result<Duration> {
        let started = Instant::now();
        let (mut connection, fresh) = match self.connection.take() {
            Some(connection) if connection.is_connected() => (connection, false),
            _ => {
                let connection = open_connection(
                    self.connector.as_ref(),
                    &self.address,
                    self.options.connect_timeout,
                )
                .await?;
                (connection, true)
            }
        };

        let message = if fresh {
            Message::Query(OpQuery::command(
                "admin",
                doc! { "isMaster": 1, "helloOk": true },
            ))
        } else if self.hello_ok {
            Message::Msg(OpMsg::command("admin", doc! { "hello": 1 }))
        } else {
            Message::Msg(OpMsg::command("admin", doc! { "isMaster": 1 }))
        };

        let reply = timeout(
            self.options.connect_timeout,
            exchange(
                connection.as_mut(),
                &message,
                &self.compressors,
                self.options.max_message_size,
            ),
        )
        .await
        .map_err(|_| MongoError::network(format!("sample of {} timed out", self.address)))??
        .ok_or_else(|| MongoError::protocol("handshake produced no reply"))?;
        let elapsed = started.elapsed();

        let reply = reply.into_reply_document()?;
        if fresh {
            self.hello_ok = reply.get_bool("helloOk").unwrap_or(false);
        }
        self.connection = Some(connection);
        Ok(elapsed)
    }
}

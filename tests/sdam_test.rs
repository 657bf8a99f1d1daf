//! Integration tests for discovery, monitoring and server selection.
//!
//! Topology transitions are driven directly with hand-built descriptions;
//! cluster and client behaviour runs against an in-memory deployment whose
//! connections answer handshakes and commands without sockets.

use async_trait::async_trait;
use mongo_core::connection::{Connection, Connector};
use mongo_core::error::{MongoError, Result};
use mongo_core::sdam::{
    select, Cluster, ReadPreference, SdamEvent, SelectionCriteria, ServerAddress,
    ServerDescription, ServerType, TopologyDescription, TopologyType,
};
use mongo_core::wire::{
    CompressorRegistry, Message, MessageHeader, OpCode, OpMsg, OpReply, DEFAULT_MAX_MESSAGE_SIZE,
};
use mongo_core::{doc, ClientOptions, Document, MongoClient, ObjectId};
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn addr(host: &str) -> ServerAddress {
    ServerAddress::new(host, 27017)
}

fn replica_set_options(hosts: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts.iter().map(|h| addr(h)))
        .replica_set("rs")
        .build()
}

fn primary_reply(me: &str, hosts: &[&str]) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "helloOk": true,
        "setName": "rs",
        "me": format!("{}:27017", me),
        "hosts": hosts.iter().map(|h| format!("{}:27017", h)).collect::<Vec<_>>(),
        "minWireVersion": 0,
        "maxWireVersion": 17,
    }
}

fn secondary_reply(me: &str, hosts: &[&str]) -> Document {
    doc! {
        "ok": 1,
        "secondary": true,
        "helloOk": true,
        "setName": "rs",
        "me": format!("{}:27017", me),
        "hosts": hosts.iter().map(|h| format!("{}:27017", h)).collect::<Vec<_>>(),
        "minWireVersion": 0,
        "maxWireVersion": 17,
    }
}

fn described(host: &str, reply: Document, rtt_ms: u64) -> ServerDescription {
    ServerDescription::from_reply(addr(host), reply, Some(Duration::from_millis(rtt_ms)))
}

fn election_id(n: u8) -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[11] = n;
    ObjectId::from_bytes(bytes)
}

/// A command a mock server received.
#[derive(Debug, Clone)]
struct Received {
    address: ServerAddress,
    command: Document,
    compressed: bool,
}

/// An in-memory deployment: per-host handshake replies and command replies.
#[derive(Debug, Default)]
struct MockDeployment {
    handshakes: Mutex<HashMap<ServerAddress, Document>>,
    command_replies: Mutex<HashMap<ServerAddress, Document>>,
    received: Mutex<Vec<Received>>,
}

impl MockDeployment {
    fn with_servers(servers: Vec<(&str, Document)>) -> Arc<Self> {
        let deployment = Arc::new(MockDeployment::default());
        for (host, reply) in servers {
            deployment.set_handshake(host, reply);
        }
        deployment
    }

    fn set_handshake(&self, host: &str, reply: Document) {
        self.handshakes.lock().unwrap().insert(addr(host), reply);
    }

    fn take_down(&self, host: &str) {
        self.handshakes.lock().unwrap().remove(&addr(host));
    }

    fn set_command_reply(&self, host: &str, reply: Document) {
        self.command_replies.lock().unwrap().insert(addr(host), reply);
    }

    fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    fn is_up(&self, address: &ServerAddress) -> bool {
        self.handshakes.lock().unwrap().contains_key(address)
    }

    /// Answer one request, or fail like a dead socket.
    fn respond(&self, address: &ServerAddress, bytes: &[u8]) -> Result<Vec<u8>> {
        let handshake = self
            .handshakes
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| MongoError::network(format!("{} went away", address)))?;

        let compressed =
            MessageHeader::parse(bytes, DEFAULT_MAX_MESSAGE_SIZE)?.op_code == OpCode::Compressed;
        let request = Message::from_bytes(
            bytes,
            DEFAULT_MAX_MESSAGE_SIZE,
            &CompressorRegistry::default(),
        )?;
        let request_id = request.request_id();
        let (command, legacy) = match request {
            Message::Query(query) => (query.query, true),
            Message::Msg(msg) => (msg.command, false),
            other => panic!("unexpected request {:?}", other),
        };

        let is_handshake = matches!(command.first_key(), Some("hello" | "isMaster" | "ismaster"));
        let reply = if is_handshake {
            handshake
        } else {
            self.received.lock().unwrap().push(Received {
                address: address.clone(),
                command: command.clone(),
                compressed,
            });
            self.command_replies
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .unwrap_or_else(|| doc! { "ok": 1.0 })
        };

        let reply = if legacy {
            Message::Reply(OpReply::new(request_id, vec![reply]))
        } else {
            Message::Msg(OpMsg::reply_to(request_id, reply))
        };
        reply.serialize()
    }
}

#[derive(Debug)]
struct MockConnection {
    address: ServerAddress,
    generation: u32,
    deployment: Arc<MockDeployment>,
    pending: VecDeque<Vec<u8>>,
    connected: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self.deployment.respond(&self.address, bytes) {
            Ok(reply) => {
                self.pending.push_back(reply);
                Ok(())
            }
            Err(error) => {
                self.connected = false;
                Err(error)
            }
        }
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.pending.pop_front().ok_or(MongoError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn generation(&self) -> u32 {
        self.generation
    }

    fn address(&self) -> &ServerAddress {
        &self.address
    }
}

#[derive(Debug)]
struct MockConnector(Arc<MockDeployment>);

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &ServerAddress, generation: u32) -> Result<Box<dyn Connection>> {
        if !self.0.is_up(address) {
            return Err(MongoError::network(format!("{} refused", address)));
        }
        Ok(Box::new(MockConnection {
            address: address.clone(),
            generation,
            deployment: Arc::clone(&self.0),
            pending: VecDeque::new(),
            connected: true,
        }))
    }
}

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait (in real time) until the cluster's topology satisfies `condition`.
async fn wait_for(
    cluster: &Cluster,
    condition: impl Fn(&TopologyDescription) -> bool,
) -> TopologyDescription {
    let mut topology_rx = cluster.watch_topology();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let topology = topology_rx.borrow_and_update();
                if condition(&*topology) {
                    return (*topology).clone();
                }
            }
            topology_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("topology never reached the expected state")
}

// ============================================================================
// Topology State Machine Tests
// ============================================================================

mod topology_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_primary_discovers_new_member() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b"])).unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

        let topology = topology.apply(described("a", primary_reply("a", &["a", "b", "c"]), 5));

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        let hosts: Vec<_> = topology.addresses().cloned().collect();
        assert_eq!(hosts, vec![addr("a"), addr("b"), addr("c")]);
        assert_eq!(topology.primary().map(|p| p.address.clone()), Some(addr("a")));
        assert_eq!(topology.server(&addr("c")).unwrap().server_type, ServerType::Unknown);
    }

    #[test]
    fn test_primary_removes_unlisted_members() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b", "x"])).unwrap();
        let topology = topology.apply(described("a", primary_reply("a", &["a", "b"]), 5));
        assert!(!topology.contains(&addr("x")));
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn test_newer_election_demotes_old_primary() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b"])).unwrap();

        let mut first = primary_reply("a", &["a", "b"]);
        first.insert("electionId", election_id(1));
        first.insert("setVersion", 1);
        let topology = topology.apply(described("a", first.clone(), 5));
        assert_eq!(topology.primary().map(|p| p.address.clone()), Some(addr("a")));

        let mut second = primary_reply("b", &["a", "b"]);
        second.insert("electionId", election_id(2));
        second.insert("setVersion", 1);
        let topology = topology.apply(described("b", second, 5));

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.primary().map(|p| p.address.clone()), Some(addr("b")));
        assert_eq!(topology.server(&addr("a")).unwrap().server_type, ServerType::Unknown);
        assert_eq!(topology.max_election_id, Some(election_id(2)));

        // the old primary reporting its stale election is ignored as a primary
        let topology = topology.apply(described("a", first, 5));
        assert_eq!(topology.primary().map(|p| p.address.clone()), Some(addr("b")));
        assert_eq!(topology.server(&addr("a")).unwrap().server_type, ServerType::Unknown);
    }

    #[test]
    fn test_set_name_mismatch_removes_member() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b"])).unwrap();
        let mut reply = secondary_reply("b", &["a", "b"]);
        reply.insert("setName", "other");
        let topology = topology.apply(described("b", reply, 5));
        assert!(!topology.contains(&addr("b")));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn test_mongos_makes_topology_sharded() {
        let options = ClientOptions::builder().hosts([addr("m1"), addr("m2")]).build();
        let topology = TopologyDescription::new(&options).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Unknown);

        let topology = topology.apply(described(
            "m1",
            doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid", "maxWireVersion": 17 },
            5,
        ));
        assert_eq!(topology.topology_type, TopologyType::Sharded);
        assert_eq!(topology.len(), 2);
    }

    #[test]
    fn test_losing_primary_falls_back() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b"])).unwrap();
        let topology = topology.apply(described("a", primary_reply("a", &["a", "b"]), 5));
        let topology = topology.apply(ServerDescription::from_error(
            addr("a"),
            MongoError::network("connection reset"),
        ));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
        assert!(topology.primary().is_none());
        assert!(!topology.has_writable_server());
    }
}

// ============================================================================
// Server Selection Tests
// ============================================================================

mod selection_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn three_member_set() -> TopologyDescription {
        let hosts = ["a", "b", "c"];
        let topology = TopologyDescription::new(&replica_set_options(&hosts)).unwrap();
        topology
            .apply(described("a", primary_reply("a", &hosts), 25))
            .apply(described("b", secondary_reply("b", &hosts), 5))
            .apply(described("c", secondary_reply("c", &hosts), 8))
    }

    #[test]
    fn test_latency_window() {
        let topology = three_member_set();
        let criteria: SelectionCriteria = ReadPreference::nearest().into();

        for _ in 0..20 {
            let selected: HashSet<_> = select(&topology, &criteria)
                .unwrap()
                .into_iter()
                .map(|s| s.address.clone())
                .collect();
            assert_eq!(selected, HashSet::from([addr("b"), addr("c")]));
        }
    }

    #[test]
    fn test_write_goes_to_primary() {
        let topology = three_member_set();
        let selected = select(&topology, &SelectionCriteria::Write).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].address, addr("a"));
    }

    #[test]
    fn test_primary_mode_without_primary_is_empty() {
        let topology = TopologyDescription::new(&replica_set_options(&["a", "b"])).unwrap();
        let topology = topology.apply(described("b", secondary_reply("b", &["a", "b"]), 5));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

        let criteria: SelectionCriteria = ReadPreference::primary().into();
        assert!(select(&topology, &criteria).unwrap().is_empty());

        let fallback: SelectionCriteria = ReadPreference::primary_preferred().into();
        let selected = select(&topology, &fallback).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].address, addr("b"));
    }

    #[test]
    fn test_incompatible_server_fails_selection() {
        let options = ClientOptions::builder().host(addr("old")).build();
        let topology = TopologyDescription::new(&options).unwrap().apply(described(
            "old",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 2 },
            5,
        ));
        assert!(matches!(
            select(&topology, &SelectionCriteria::Write),
            Err(MongoError::ServerSelection(_))
        ));
    }
}

// ============================================================================
// Cluster Tests
// ============================================================================

mod cluster_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_cluster_discovers_replica_set() {
        init_tracing();
        let deployment = MockDeployment::with_servers(vec![
            ("a", primary_reply("a", &["a", "b"])),
            ("b", secondary_reply("b", &["a", "b"])),
        ]);
        let cluster = Cluster::new(
            replica_set_options(&["a"]),
            Arc::new(MockConnector(deployment)),
        )
        .unwrap();
        let mut events = cluster.subscribe_events();

        let secondary: SelectionCriteria = ReadPreference::secondary().into();
        let selected = cluster.select_server(&secondary).await.unwrap();
        assert_eq!(selected.address(), &addr("b"));
        assert_eq!(selected.topology_type, TopologyType::ReplicaSetWithPrimary);

        let primary = cluster.select_server(&SelectionCriteria::Write).await.unwrap();
        assert_eq!(primary.address(), &addr("a"));
        assert!(primary.description.round_trip_time.is_some());

        let mut opened = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SdamEvent::ServerOpening { address } = event {
                opened.push(address);
            }
        }
        assert!(opened.contains(&addr("b")));

        cluster.close().await;
        assert!(matches!(
            cluster.select_server(&SelectionCriteria::Write).await,
            Err(MongoError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_monitor_failure_clears_pool() {
        init_tracing();
        let deployment = MockDeployment::with_servers(vec![(
            "a",
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 },
        )]);
        let options = ClientOptions::builder()
            .host(addr("a"))
            .direct_connection(true)
            .heartbeat_frequency_ms(20)
            .min_heartbeat_frequency_ms(10)
            .build();
        let cluster =
            Cluster::new(options, Arc::new(MockConnector(Arc::clone(&deployment)))).unwrap();

        let selected = cluster.select_server(&SelectionCriteria::Write).await.unwrap();
        assert_eq!(selected.topology_type, TopologyType::Single);
        assert_eq!(selected.description.server_type, ServerType::Standalone);
        assert_eq!(selected.pool.generation(), 0);

        deployment.take_down("a");
        cluster.request_immediate_scan(&addr("a"));
        let topology = wait_for(&cluster, |t| {
            t.server(&addr("a")).map_or(false, |s| s.error().is_some())
        })
        .await;

        assert_eq!(topology.topology_type, TopologyType::Single);
        assert!(topology.server(&addr("a")).unwrap().error().unwrap().is_network_error());
        assert!(selected.pool.generation() >= 1);
        cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_timeout_is_not_a_network_error() {
        init_tracing();
        let deployment = MockDeployment::with_servers(vec![]);
        let options = ClientOptions::builder()
            .host(addr("a"))
            .server_selection_timeout_ms(5_000)
            .build();
        let cluster = Cluster::new(options, Arc::new(MockConnector(deployment))).unwrap();

        let started = tokio::time::Instant::now();
        let err = cluster
            .select_server(&SelectionCriteria::Write)
            .await
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(!err.is_network_error());
        cluster.close().await;
    }
}

// ============================================================================
// Client Tests
// ============================================================================

mod client_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client_for(deployment: &Arc<MockDeployment>, options: ClientOptions) -> MongoClient {
        MongoClient::with_options(options, Arc::new(MockConnector(Arc::clone(deployment)))).unwrap()
    }

    #[tokio::test]
    async fn test_run_command_routes_by_read_preference() {
        init_tracing();
        let deployment = MockDeployment::with_servers(vec![
            ("a", primary_reply("a", &["a", "b"])),
            ("b", secondary_reply("b", &["a", "b"])),
        ]);
        deployment.set_command_reply("b", doc! { "ok": 1.0, "n": 42 });
        let client = client_for(&deployment, replica_set_options(&["a", "b"]));

        client.ping().await.unwrap();
        let reply = client
            .run_command(
                "app",
                doc! { "count": "users" },
                Some(ReadPreference::secondary().into()),
            )
            .await
            .unwrap();
        assert_eq!(reply.get_i32("n"), Some(42));

        let received = deployment.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].address, addr("a"));
        assert_eq!(received[0].command.first_key(), Some("ping"));
        assert_eq!(received[0].command.get_str("$db"), Some("admin"));
        assert_eq!(received[1].address, addr("b"));
        assert_eq!(received[1].command.get_str("$db"), Some("app"));
        // replica set members route by the chosen server, not by $readPreference
        assert!(received[1].command.get("$readPreference").is_none());

        client.close().await;
    }

    #[tokio::test]
    async fn test_not_primary_marks_server_unknown() {
        init_tracing();
        let deployment = MockDeployment::with_servers(vec![
            ("a", primary_reply("a", &["a", "b"])),
            ("b", secondary_reply("b", &["a", "b"])),
        ]);
        deployment.set_command_reply(
            "a",
            doc! { "ok": 0.0, "errmsg": "not primary", "code": 10107, "codeName": "NotWritablePrimary" },
        );
        let client = client_for(&deployment, replica_set_options(&["a", "b"]));
        client
            .select_server(&SelectionCriteria::Write)
            .await
            .unwrap();
        let mut events = client.cluster().subscribe_events();

        let err = client
            .run_command("app", doc! { "insert": "users" }, Some(SelectionCriteria::Write))
            .await
            .unwrap_err();
        assert!(err.is_not_primary());
        assert_eq!(err.code(), Some(10107));

        let mut demoted = false;
        while let Ok(event) = events.try_recv() {
            if let SdamEvent::ServerDescriptionChanged { address, new, .. } = event {
                if address == addr("a") && new.server_type == ServerType::Unknown {
                    assert!(new.error().unwrap().is_not_primary());
                    demoted = true;
                }
            }
        }
        assert!(demoted);
        client.close().await;
    }

    #[tokio::test]
    async fn test_commands_compressed_when_negotiated() {
        init_tracing();
        let mut reply = primary_reply("a", &["a"]);
        reply.insert("compression", vec!["zlib"]);
        let deployment = MockDeployment::with_servers(vec![("a", reply)]);
        let options = ClientOptions::builder()
            .host(addr("a"))
            .replica_set("rs")
            .compressors(["zlib"])
            .build();
        let client = client_for(&deployment, options);

        client
            .run_command("app", doc! { "find": "users" }, None)
            .await
            .unwrap();
        client
            .run_command("admin", doc! { "saslStart": 1 }, None)
            .await
            .unwrap();

        let received = deployment.received();
        assert!(received[0].compressed);
        assert!(!received[1].compressed);
        client.close().await;
    }

    #[tokio::test]
    async fn test_server_size_limits_enforced_before_sending() {
        init_tracing();
        let mut reply = primary_reply("a", &["a"]);
        reply.insert("maxBsonObjectSize", 1024);
        reply.insert("maxMessageSizeBytes", 4096);
        let deployment = MockDeployment::with_servers(vec![("a", reply)]);
        let client = client_for(&deployment, replica_set_options(&["a"]));

        client
            .run_command("app", doc! { "find": "users" }, None)
            .await
            .unwrap();

        // a body may exceed the document ceiling by the command overhead only
        let err = client
            .run_command("app", doc! { "find": "users", "pad": "x".repeat(20_000) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MongoError::DocumentTooLarge { .. }), "{:?}", err);

        let err = client
            .run_command("app", doc! { "find": "users", "pad": "x".repeat(5_000) }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MongoError::MessageTooLarge { max: 4096, .. }), "{:?}", err);

        assert_eq!(deployment.received().len(), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_direct_connection_to_secondary_reads_with_primary_preferred() {
        init_tracing();
        let deployment =
            MockDeployment::with_servers(vec![("b", secondary_reply("b", &["a", "b"]))]);
        let options = ClientOptions::builder()
            .host(addr("b"))
            .direct_connection(true)
            .build();
        let client = client_for(&deployment, options);

        let criteria: SelectionCriteria = ReadPreference::primary().into();
        client
            .run_command("app", doc! { "count": "users" }, Some(criteria))
            .await
            .unwrap();

        let received = deployment.received();
        let preference = received[0].command.get_document("$readPreference").unwrap();
        assert_eq!(preference.get_str("mode"), Some("primaryPreferred"));
        client.close().await;
    }
}

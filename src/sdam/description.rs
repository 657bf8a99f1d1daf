//! What a single server said about itself in its last handshake.

use super::address::ServerAddress;
use crate::document::{DateTime, Document, ObjectId, Value, DEFAULT_MAX_DOCUMENT_SIZE};
use crate::error::MongoError;
use crate::wire::DEFAULT_MAX_MESSAGE_SIZE;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Oldest wire version this crate can talk to.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;

/// Newest wire version this crate can talk to.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

/// Weight of a new sample in the round-trip time average.
pub const RTT_ALPHA: f64 = 0.2;

const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;

/// Role a server plays in its deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServerType {
    Standalone,
    Mongos,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    RsOther,
    RsGhost,
    #[default]
    Unknown,
}

impl ServerType {
    /// Holds data that operations can read.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::RsSecondary
        )
    }

    /// Answered its last check.
    pub fn is_available(self) -> bool {
        self != ServerType::Unknown
    }

    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::RsArbiter
                | ServerType::RsOther
                | ServerType::RsGhost
        )
    }
}

/// Identifies a server process and how far its state has advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

impl TopologyVersion {
    pub fn from_document(document: &Document) -> Option<Self> {
        Some(Self {
            process_id: document.get_object_id("processId")?,
            counter: document.get_integer("counter")?,
        })
    }

    pub fn to_document(&self) -> Document {
        crate::doc! { "processId": self.process_id, "counter": self.counter }
    }

    /// Order within one process; versions from different processes do not compare.
    pub fn partial_cmp_version(&self, other: &TopologyVersion) -> Option<Ordering> {
        (self.process_id == other.process_id).then(|| self.counter.cmp(&other.counter))
    }
}

/// Next round-trip time estimate: an exponential moving average of samples.
pub fn next_round_trip_time(previous: Option<Duration>, sample: Duration) -> Duration {
    match previous {
        None => sample,
        Some(previous) => sample.mul_f64(RTT_ALPHA) + previous.mul_f64(1.0 - RTT_ALPHA),
    }
}

/// An immutable view of one server.
///
/// Built from an address, the handshake reply (if the check succeeded) and
/// the averaged round-trip time.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub round_trip_time: Option<Duration>,
    /// When this description was produced.
    pub last_update_time: Instant,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    /// The name the server knows itself by.
    pub me: Option<ServerAddress>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub tags: HashMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i64>,
    pub election_id: Option<ObjectId>,
    /// The primary this member believes in.
    pub primary: Option<ServerAddress>,
    pub last_write_date: Option<DateTime>,
    pub logical_session_timeout: Option<Duration>,
    pub max_bson_object_size: usize,
    pub max_message_size_bytes: usize,
    pub max_write_batch_size: i64,
    pub topology_version: Option<TopologyVersion>,
    pub compression: Vec<String>,
    pub hello_ok: bool,
    pub hidden: bool,
    /// Why the server is unknown, if a check failed.
    pub error: Option<MongoError>,
    /// The raw handshake reply.
    pub reply: Option<Document>,
}

impl ServerDescription {
    /// A server that has not been checked yet.
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            round_trip_time: None,
            last_update_time: Instant::now(),
            min_wire_version: 0,
            max_wire_version: 0,
            me: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: HashMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            last_write_date: None,
            logical_session_timeout: None,
            max_bson_object_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            topology_version: None,
            compression: Vec::new(),
            hello_ok: false,
            hidden: false,
            error: None,
            reply: None,
        }
    }

    /// A server whose check failed.
    pub fn from_error(address: ServerAddress, error: MongoError) -> Self {
        Self {
            error: Some(error),
            ..Self::unknown(address)
        }
    }

    /// Build a description from the check outcome: `None` means no reply.
    pub fn new(
        address: ServerAddress,
        reply: Option<Document>,
        round_trip_time: Option<Duration>,
    ) -> Self {
        match reply {
            Some(reply) => Self::from_reply(address, reply, round_trip_time),
            None => Self::unknown(address),
        }
    }

    /// Classify a server from its handshake reply.
    pub fn from_reply(
        address: ServerAddress,
        reply: Document,
        round_trip_time: Option<Duration>,
    ) -> Self {
        let mut description = Self::unknown(address);

        let ok = reply.get("ok").map(Value::is_truthy).unwrap_or(false);
        if !ok {
            let code = reply
                .get_integer("code")
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(0);
            let message = reply.get_str("errmsg").unwrap_or("handshake failed");
            description.error = Some(MongoError::Command {
                code,
                code_name: reply.get_str("codeName").map(str::to_string),
                message: message.to_string(),
            });
            description.reply = Some(reply);
            return description;
        }

        let hosts = |key: &str| -> Vec<ServerAddress> {
            reply
                .get_array(key)
                .unwrap_or_default()
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|h| ServerAddress::parse(h).ok())
                .collect()
        };
        let flag = |key: &str| reply.get(key).map(Value::is_truthy).unwrap_or(false);

        description.round_trip_time = round_trip_time;
        let wire_version = |key: &str| {
            reply
                .get_integer(key)
                .and_then(|v| i32::try_from(v).ok())
                .unwrap_or(0)
        };
        description.min_wire_version = wire_version("minWireVersion");
        description.max_wire_version = wire_version("maxWireVersion");
        description.me = reply.get_str("me").and_then(|me| ServerAddress::parse(me).ok());
        description.hosts = hosts("hosts");
        description.passives = hosts("passives");
        description.arbiters = hosts("arbiters");
        description.tags = reply
            .get_document("tags")
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.to_string(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        description.set_name = reply.get_str("setName").map(str::to_string);
        description.set_version = reply.get_integer("setVersion");
        description.election_id = reply.get_object_id("electionId");
        description.primary = reply
            .get_str("primary")
            .and_then(|p| ServerAddress::parse(p).ok());
        description.last_write_date = reply
            .get_document("lastWrite")
            .and_then(|lw| lw.get_datetime("lastWriteDate"));
        description.logical_session_timeout = reply
            .get_integer("logicalSessionTimeoutMinutes")
            .and_then(|m| u64::try_from(m).ok())
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
        if let Some(size) = reply.get_integer("maxBsonObjectSize").and_then(|s| usize::try_from(s).ok()) {
            description.max_bson_object_size = size;
        }
        if let Some(size) = reply.get_integer("maxMessageSizeBytes").and_then(|s| usize::try_from(s).ok()) {
            description.max_message_size_bytes = size;
        }
        if let Some(size) = reply.get_integer("maxWriteBatchSize") {
            description.max_write_batch_size = size;
        }
        description.topology_version = reply
            .get_document("topologyVersion")
            .and_then(TopologyVersion::from_document);
        description.compression = reply
            .get_array("compression")
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        description.hello_ok = flag("helloOk");
        description.hidden = flag("hidden");

        let primary = flag("isWritablePrimary") || flag("ismaster");
        description.server_type = if reply.get_str("msg") == Some("isdbgrid") {
            ServerType::Mongos
        } else if description.set_name.is_some() {
            if description.hidden {
                ServerType::RsOther
            } else if primary {
                ServerType::RsPrimary
            } else if flag("secondary") {
                ServerType::RsSecondary
            } else if flag("arbiterOnly") {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if flag("isreplicaset") {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        };

        description.reply = Some(reply);
        description
    }

    /// Every member this server reports: hosts, passives and arbiters.
    pub fn all_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
    }

    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub fn is_data_bearing(&self) -> bool {
        self.server_type.is_data_bearing()
    }

    /// Whether `me` names some other address than the one checked.
    pub fn me_mismatch(&self) -> bool {
        self.me.as_ref().map_or(false, |me| *me != self.address)
    }

    /// Why this server cannot be used with this crate, if it cannot.
    pub fn compatibility_error(&self) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        if self.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "server at {} requires wire version {}, but this driver only supports up to {}",
                self.address, self.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
            ));
        }
        if self.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "server at {} reports wire version {}, but this driver requires at least {}",
                self.address, self.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
            ));
        }
        None
    }

    /// Whether `tag_set` is a subset of this server's tags.
    pub fn matches_tag_set(&self, tag_set: &HashMap<String, String>) -> bool {
        tag_set
            .iter()
            .all(|(k, v)| self.tags.get(k).map_or(false, |t| t == v))
    }

    pub fn error(&self) -> Option<&MongoError> {
        self.error.as_ref()
    }
}

fn same_members(a: &[ServerAddress], b: &[ServerAddress]) -> bool {
    let mut a: Vec<_> = a.iter().collect();
    let mut b: Vec<_> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Compares what the server reported, not when or how fast it answered.
impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && same_members(&self.hosts, &other.hosts)
            && same_members(&self.passives, &other.passives)
            && same_members(&self.arbiters, &other.arbiters)
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout == other.logical_session_timeout
            && self.topology_version == other.topology_version
            && self.error.as_ref().map(ToString::to_string)
                == other.error.as_ref().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn classify(reply: Document) -> ServerType {
        ServerDescription::from_reply(addr("a:27017"), reply, Some(Duration::from_millis(1)))
            .server_type
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            classify(doc! { "ok": 1, "ismaster": true, "msg": "isdbgrid" }),
            ServerType::Mongos
        );
        assert_eq!(classify(doc! { "ok": 1, "ismaster": true }), ServerType::Standalone);
        assert_eq!(
            classify(doc! { "ok": 1, "isWritablePrimary": true, "setName": "rs" }),
            ServerType::RsPrimary
        );
        assert_eq!(
            classify(doc! { "ok": 1, "secondary": true, "setName": "rs" }),
            ServerType::RsSecondary
        );
        assert_eq!(
            classify(doc! { "ok": 1, "arbiterOnly": true, "setName": "rs" }),
            ServerType::RsArbiter
        );
        assert_eq!(
            classify(doc! { "ok": 1, "secondary": true, "hidden": true, "setName": "rs" }),
            ServerType::RsOther
        );
        assert_eq!(classify(doc! { "ok": 1, "setName": "rs" }), ServerType::RsOther);
        assert_eq!(classify(doc! { "ok": 1, "isreplicaset": true }), ServerType::RsGhost);
    }

    #[test]
    fn test_failed_reply_is_unknown() {
        let description = ServerDescription::from_reply(
            addr("a"),
            doc! { "ok": 0, "errmsg": "auth failed", "code": 18 },
            None,
        );
        assert_eq!(description.server_type, ServerType::Unknown);
        assert_eq!(description.error().and_then(MongoError::code), Some(18));
    }

    #[test]
    fn test_no_reply_is_unknown() {
        let description = ServerDescription::new(addr("a"), None, None);
        assert_eq!(description.server_type, ServerType::Unknown);
        assert!(!description.is_available());
    }

    #[test]
    fn test_fields_parsed() {
        let oid = ObjectId::new();
        let reply = doc! {
            "ok": 1.0,
            "isWritablePrimary": true,
            "setName": "rs",
            "setVersion": 3,
            "electionId": oid,
            "hosts": vec!["A:1", "b:2"],
            "passives": vec!["c:3"],
            "me": "a:1",
            "tags": doc! { "dc": "east" },
            "minWireVersion": 0,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
            "lastWrite": doc! { "lastWriteDate": DateTime::from_millis(1000) },
            "compression": vec!["zlib"],
            "helloOk": true,
        };
        let description = ServerDescription::from_reply(addr("a:1"), reply, None);
        assert_eq!(description.set_version, Some(3));
        assert_eq!(description.election_id, Some(oid));
        assert_eq!(description.all_hosts().count(), 3);
        assert!(!description.me_mismatch());
        assert_eq!(description.tags.get("dc").map(String::as_str), Some("east"));
        assert_eq!(description.max_wire_version, 17);
        assert_eq!(description.logical_session_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(description.last_write_date, Some(DateTime::from_millis(1000)));
        assert_eq!(description.compression, vec!["zlib".to_string()]);
        assert!(description.hello_ok);
        assert!(description.compatibility_error().is_none());
    }

    #[test]
    fn test_out_of_range_fields_are_absent() {
        let reply = doc! {
            "ok": 1,
            "ismaster": true,
            "minWireVersion": 1i64 << 40,
            "maxWireVersion": 1i64 << 40,
            "logicalSessionTimeoutMinutes": i64::MAX,
            "maxBsonObjectSize": -1,
        };
        let description = ServerDescription::from_reply(addr("a"), reply, None);
        assert_eq!(description.min_wire_version, 0);
        assert_eq!(description.max_wire_version, 0);
        assert_eq!(description.logical_session_timeout, None);
        assert_eq!(description.max_bson_object_size, DEFAULT_MAX_DOCUMENT_SIZE);

        let failed = ServerDescription::from_reply(
            addr("a"),
            doc! { "ok": 0, "errmsg": "boom", "code": i64::MAX },
            None,
        );
        assert_eq!(failed.error().and_then(MongoError::code), Some(0));
    }

    #[test]
    fn test_size_limits_parsed() {
        let reply = doc! {
            "ok": 1,
            "ismaster": true,
            "maxBsonObjectSize": 1024,
            "maxMessageSizeBytes": 4096,
            "maxWriteBatchSize": 10,
        };
        let description = ServerDescription::from_reply(addr("a"), reply, None);
        assert_eq!(description.max_bson_object_size, 1024);
        assert_eq!(description.max_message_size_bytes, 4096);
        assert_eq!(description.max_write_batch_size, 10);
    }

    #[test]
    fn test_round_trip_time_average() {
        let first = next_round_trip_time(None, Duration::from_millis(100));
        assert_eq!(first, Duration::from_millis(100));
        let second = next_round_trip_time(Some(first), Duration::from_millis(200));
        assert!((119..=121).contains(&second.as_millis()));
    }

    #[test]
    fn test_semantic_equality_ignores_rtt() {
        let reply = doc! { "ok": 1, "ismaster": true, "maxWireVersion": 17 };
        let a = ServerDescription::from_reply(addr("a"), reply.clone(), Some(Duration::from_millis(1)));
        let b = ServerDescription::from_reply(addr("a"), reply, Some(Duration::from_millis(50)));
        assert_eq!(a, b);
        assert_ne!(a, ServerDescription::unknown(addr("a")));
    }

    #[test]
    fn test_wire_version_compatibility() {
        let old = ServerDescription::from_reply(
            addr("a"),
            doc! { "ok": 1, "ismaster": true, "maxWireVersion": 2 },
            None,
        );
        assert!(old.compatibility_error().unwrap().contains("requires at least"));
        let new = ServerDescription::from_reply(
            addr("a"),
            doc! { "ok": 1, "ismaster": true, "minWireVersion": 30, "maxWireVersion": 31 },
            None,
        );
        assert!(new.compatibility_error().is_some());
    }

    #[test]
    fn test_topology_version_ordering() {
        let pid = ObjectId::new();
        let a = TopologyVersion { process_id: pid, counter: 1 };
        let b = TopologyVersion { process_id: pid, counter: 2 };
        let other = TopologyVersion { process_id: ObjectId::new(), counter: 5 };
        assert_eq!(a.partial_cmp_version(&b), Some(Ordering::Less));
        assert_eq!(a.partial_cmp_version(&other), None);
    }
}

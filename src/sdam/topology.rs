//! The deployment model and its transition function.
//!
//! A [`TopologyDescription`] is a value: [`TopologyDescription::apply`]
//! takes the current model and one new [`ServerDescription`] and returns
//! the next model. The cluster owns the only mutable copy and publishes
//! each result as an immutable snapshot.

use super::address::ServerAddress;
use super::description::{ServerDescription, ServerType};
use super::selection::{self, ReadPreference, SelectionCriteria};
use crate::document::ObjectId;
use crate::error::{MongoError, Result};
use crate::options::ClientOptions;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Kind of deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Unknown,
    /// A direct connection to exactly one server.
    Single,
    Sharded,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
}

impl TopologyType {
    pub fn is_replica_set(self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }
}

/// The driver's current model of the deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub set_name: Option<String>,
    pub max_set_version: Option<i64>,
    pub max_election_id: Option<ObjectId>,
    pub compatibility_error: Option<String>,
    /// Smallest session timeout among data-bearing servers.
    pub logical_session_timeout: Option<Duration>,
    pub heartbeat_frequency: Duration,
    pub local_threshold: Duration,
    servers: BTreeMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    /// The initial model for `options`, with every seed unknown.
    pub fn new(options: &ClientOptions) -> Result<Self> {
        options.validate()?;
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.replica_set.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };
        Ok(Self {
            topology_type,
            set_name: options.replica_set.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            heartbeat_frequency: options.heartbeat_frequency(),
            local_threshold: options.local_threshold(),
            servers: options
                .hosts
                .iter()
                .map(|h| (h.clone(), ServerDescription::unknown(h.clone())))
                .collect(),
        })
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.server_type == ServerType::RsPrimary)
    }

    /// Whether some server could serve a read with `preference` right now.
    pub fn has_readable_server(&self, preference: &ReadPreference) -> bool {
        selection::select(self, &SelectionCriteria::ReadPreference(preference.clone()))
            .map(|servers| !servers.is_empty())
            .unwrap_or(false)
    }

    /// Whether some server could serve a write right now.
    pub fn has_writable_server(&self) -> bool {
        selection::select(self, &SelectionCriteria::Write)
            .map(|servers| !servers.is_empty())
            .unwrap_or(false)
    }

    /// Fail if any known server speaks a wire version outside the supported range.
    pub fn check_compatible(&self) -> Result<()> {
        match &self.compatibility_error {
            Some(message) => Err(MongoError::ServerSelection(message.clone())),
            None => Ok(()),
        }
    }

    /// The next model after `description` arrives.
    pub fn apply(&self, description: ServerDescription) -> TopologyDescription {
        let mut next = self.clone();
        next.update(description);
        next
    }

    /// Apply `description` in place.
    pub fn update(&mut self, description: ServerDescription) {
        let address = description.address.clone();
        let Some(current) = self.servers.get(&address) else {
            // the server was removed while its check was in flight
            return;
        };
        if is_stale_topology_version(current, &description) {
            debug!(server = %address, "ignoring description with an older topology version");
            return;
        }

        let previous_type = self.topology_type;
        self.servers.insert(address.clone(), description.clone());

        match self.topology_type {
            TopologyType::Single => self.update_single(description),
            TopologyType::Unknown => match description.server_type {
                ServerType::Standalone => self.update_unknown_with_standalone(&address),
                ServerType::Mongos => self.topology_type = TopologyType::Sharded,
                ServerType::RsPrimary => self.update_rs_from_primary(description),
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    self.topology_type = TopologyType::ReplicaSetNoPrimary;
                    self.update_rs_without_primary(description);
                }
                ServerType::Unknown | ServerType::RsGhost => {}
            },
            TopologyType::Sharded => match description.server_type {
                ServerType::Unknown | ServerType::Mongos => {}
                _ => self.remove(&address, "not a mongos"),
            },
            TopologyType::ReplicaSetNoPrimary => match description.server_type {
                ServerType::Standalone | ServerType::Mongos => {
                    self.remove(&address, "not a replica set member")
                }
                ServerType::RsPrimary => self.update_rs_from_primary(description),
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    self.update_rs_without_primary(description)
                }
                ServerType::Unknown | ServerType::RsGhost => {}
            },
            TopologyType::ReplicaSetWithPrimary => match description.server_type {
                ServerType::Standalone | ServerType::Mongos => {
                    self.remove(&address, "not a replica set member");
                    self.check_if_has_primary();
                }
                ServerType::RsPrimary => self.update_rs_from_primary(description),
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                    self.update_rs_with_primary_from_member(description)
                }
                ServerType::Unknown | ServerType::RsGhost => self.check_if_has_primary(),
            },
        }

        self.refresh_derived_fields();
        if self.topology_type != previous_type {
            info!(
                from = ?previous_type,
                to = ?self.topology_type,
                "topology type changed"
            );
        }
    }

    fn update_single(&mut self, description: ServerDescription) {
        let mismatch = match (&self.set_name, &description.set_name) {
            (Some(expected), actual) => actual.as_deref() != Some(expected.as_str()),
            (None, _) => false,
        };
        if mismatch && description.is_available() {
            let error = MongoError::configuration(format!(
                "server at {} reports replica set {:?}, expected {:?}",
                description.address, description.set_name, self.set_name
            ));
            self.servers.insert(
                description.address.clone(),
                ServerDescription::from_error(description.address, error),
            );
        }
    }

    fn update_unknown_with_standalone(&mut self, address: &ServerAddress) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            self.remove(address, "standalone in a multi-seed deployment");
        }
    }

    fn update_rs_without_primary(&mut self, description: ServerDescription) {
        if !self.accept_set_name(&description) {
            self.remove(&description.address, "wrong replica set name");
            return;
        }
        self.add_unknown_hosts(&description);
        if description.me_mismatch() {
            self.remove(&description.address, "reports a different address for itself");
        }
    }

    fn update_rs_with_primary_from_member(&mut self, description: ServerDescription) {
        if self.set_name != description.set_name {
            self.remove(&description.address, "wrong replica set name");
        } else if description.me_mismatch() {
            self.remove(&description.address, "reports a different address for itself");
        }
        self.check_if_has_primary();
    }

    fn update_rs_from_primary(&mut self, description: ServerDescription) {
        if !self.accept_set_name(&description) {
            self.remove(&description.address, "wrong replica set name");
            self.check_if_has_primary();
            return;
        }

        if self.is_stale_primary(&description) {
            info!(server = %description.address, "primary has a stale election id, marking unknown");
            let error = MongoError::protocol(format!(
                "primary at {} reported an election older than the latest seen",
                description.address
            ));
            self.servers.insert(
                description.address.clone(),
                ServerDescription::from_error(description.address, error),
            );
            self.check_if_has_primary();
            return;
        }
        self.record_election(&description);

        let demoted: Vec<ServerAddress> = self
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary && s.address != description.address)
            .map(|s| s.address.clone())
            .collect();
        for address in demoted {
            info!(server = %address, new_primary = %description.address, "demoting old primary");
            self.servers
                .insert(address.clone(), ServerDescription::unknown(address));
        }

        self.add_unknown_hosts(&description);
        let members: Vec<&ServerAddress> = description.all_hosts().collect();
        let removed: Vec<ServerAddress> = self
            .servers
            .keys()
            .filter(|a| !members.contains(a))
            .cloned()
            .collect();
        for address in removed {
            self.remove(&address, "not listed by the primary");
        }
        self.check_if_has_primary();
    }

    /// Adopt the set name of the first member seen, then hold members to it.
    fn accept_set_name(&mut self, description: &ServerDescription) -> bool {
        match &self.set_name {
            None => {
                self.set_name = description.set_name.clone();
                true
            }
            Some(name) => description.set_name.as_deref() == Some(name.as_str()),
        }
    }

    fn is_stale_primary(&self, description: &ServerDescription) -> bool {
        if description.max_wire_version >= 17 {
            let incoming = (description.election_id, description.set_version);
            let latest = (self.max_election_id, self.max_set_version);
            return compare_options(incoming.0, latest.0)
                .then_with(|| compare_options(incoming.1, latest.1))
                == Ordering::Less;
        }
        match (
            description.set_version,
            description.election_id,
            self.max_set_version,
            self.max_election_id,
        ) {
            (Some(version), Some(election), Some(max_version), Some(max_election)) => {
                max_version > version || (max_version == version && max_election > election)
            }
            _ => false,
        }
    }

    fn record_election(&mut self, description: &ServerDescription) {
        if description.max_wire_version >= 17 {
            self.max_election_id = description.election_id;
            self.max_set_version = description.set_version;
            return;
        }
        if description.set_version.is_some() && description.election_id.is_some() {
            self.max_election_id = description.election_id;
        }
        if let Some(version) = description.set_version {
            if self.max_set_version.map_or(true, |max| version > max) {
                self.max_set_version = Some(version);
            }
        }
    }

    fn add_unknown_hosts(&mut self, description: &ServerDescription) {
        for host in description.all_hosts() {
            if !self.servers.contains_key(host) {
                debug!(server = %host, reported_by = %description.address, "discovered new server");
                self.servers
                    .insert(host.clone(), ServerDescription::unknown(host.clone()));
            }
        }
    }

    fn remove(&mut self, address: &ServerAddress, reason: &str) {
        if self.servers.remove(address).is_some() {
            info!(server = %address, reason, "removing server from topology");
        }
    }

    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.primary().is_some() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn refresh_derived_fields(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(ServerDescription::compatibility_error);

        let mut timeout: Option<Duration> = None;
        for server in self.servers.values().filter(|s| s.is_data_bearing()) {
            match server.logical_session_timeout {
                None => {
                    timeout = None;
                    break;
                }
                Some(t) => timeout = Some(timeout.map_or(t, |current| current.min(t))),
            }
        }
        self.logical_session_timeout = timeout;
    }
}

/// `None` sorts before any value.
fn compare_options<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    a.cmp(&b)
}

fn is_stale_topology_version(current: &ServerDescription, incoming: &ServerDescription) -> bool {
    match (&current.topology_version, &incoming.topology_version) {
        (Some(current), Some(incoming)) => {
            incoming.partial_cmp_version(current) == Some(Ordering::Less)
        }
        _ => false,
    }
}

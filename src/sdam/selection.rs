//! Server selection: which servers may serve an operation, fastest first.

use super::description::{ServerDescription, ServerType};
use super::topology::{TopologyDescription, TopologyType};
use crate::doc;
use crate::document::{Document, Value};
use crate::error::{MongoError, Result};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Smallest `max_staleness` accepted.
pub const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// How often an idle primary writes a no-op, bounding staleness resolution.
pub const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Tags a server must carry, all of them.
pub type TagSet = HashMap<String, String>;

/// Which members a read may go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadPreferenceMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::Secondary => "secondary",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
            ReadPreferenceMode::Nearest => "nearest",
        }
    }
}

/// Where reads may be routed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    /// Tried in order; the first set matching any server wins. Empty matches all.
    pub tag_sets: Vec<TagSet>,
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    pub fn primary_preferred() -> Self {
        Self::new(ReadPreferenceMode::PrimaryPreferred)
    }

    pub fn secondary() -> Self {
        Self::new(ReadPreferenceMode::Secondary)
    }

    pub fn secondary_preferred() -> Self {
        Self::new(ReadPreferenceMode::SecondaryPreferred)
    }

    pub fn nearest() -> Self {
        Self::new(ReadPreferenceMode::Nearest)
    }

    pub fn with_tag_sets(mut self, tag_sets: Vec<TagSet>) -> Self {
        self.tag_sets = tag_sets;
        self
    }

    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Self {
        self.max_staleness = Some(max_staleness);
        self
    }

    /// Check the preference against the monitoring interval.
    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<()> {
        if self.mode == ReadPreferenceMode::Primary
            && (!self.tag_sets.is_empty() || self.max_staleness.is_some())
        {
            return Err(MongoError::invalid_argument(
                "primary read preference cannot have tag sets or max staleness",
            ));
        }
        if let Some(max_staleness) = self.max_staleness {
            let floor = SMALLEST_MAX_STALENESS.max(heartbeat_frequency + IDLE_WRITE_PERIOD);
            if max_staleness < floor {
                return Err(MongoError::invalid_argument(format!(
                    "max staleness {:?} must be at least {:?}",
                    max_staleness, floor
                )));
            }
        }
        Ok(())
    }

    /// The `$readPreference` document sent to a mongos.
    pub fn to_document(&self) -> Document {
        let mut document = doc! { "mode": self.mode.as_str() };
        if !self.tag_sets.is_empty() {
            let tags: Vec<Value> = self
                .tag_sets
                .iter()
                .map(|set| {
                    let mut sorted: Vec<_> = set.iter().collect();
                    sorted.sort();
                    Value::Document(sorted.into_iter().map(|(k, v)| (k.as_str(), v.as_str())).collect())
                })
                .collect();
            document.insert("tags", tags);
        }
        if let Some(max_staleness) = self.max_staleness {
            document.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }
        document
    }
}

/// Custom filter over server descriptions.
pub type Predicate = Arc<dyn Fn(&ServerDescription) -> bool + Send + Sync>;

/// What an operation needs from the server it runs on.
#[derive(Clone)]
pub enum SelectionCriteria {
    ReadPreference(ReadPreference),
    /// A server that accepts writes.
    Write,
    Predicate(Predicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionCriteria::ReadPreference(pref) => {
                f.debug_tuple("ReadPreference").field(pref).finish()
            }
            SelectionCriteria::Write => f.write_str("Write"),
            SelectionCriteria::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(preference: ReadPreference) -> Self {
        SelectionCriteria::ReadPreference(preference)
    }
}

/// Eligible servers for `criteria`, within the latency window, shuffled.
///
/// An empty result means no server is suitable yet; an error means none can
/// become suitable without the deployment changing.
pub fn select<'a>(
    topology: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Result<Vec<&'a ServerDescription>> {
    topology.check_compatible()?;
    if let SelectionCriteria::ReadPreference(preference) = criteria {
        preference.validate(topology.heartbeat_frequency)?;
    }

    let suitable = suitable_servers(topology, criteria);
    let mut window = if topology.topology_type == TopologyType::Single {
        suitable
    } else {
        in_latency_window(suitable, topology.local_threshold)
    };
    window.shuffle(&mut rand::thread_rng());
    Ok(window)
}

/// Servers eligible for `criteria`, before the latency window is applied.
pub fn suitable_servers<'a>(
    topology: &'a TopologyDescription,
    criteria: &SelectionCriteria,
) -> Vec<&'a ServerDescription> {
    let available = topology.servers().filter(|s| s.is_available());

    match topology.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => match criteria {
            SelectionCriteria::Predicate(predicate) => {
                available.filter(|s| predicate(*s)).collect()
            }
            _ => available.collect(),
        },
        TopologyType::Sharded => {
            let mongoses = available.filter(|s| s.server_type == ServerType::Mongos);
            match criteria {
                SelectionCriteria::Predicate(predicate) => mongoses.filter(|s| predicate(*s)).collect(),
                _ => mongoses.collect(),
            }
        }
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
            match criteria {
                SelectionCriteria::Write => primaries(topology),
                SelectionCriteria::Predicate(predicate) => {
                    available.filter(|s| predicate(*s)).collect()
                }
                SelectionCriteria::ReadPreference(preference) => {
                    replica_set_readable(topology, preference)
                }
            }
        }
    }
}

fn primaries(topology: &TopologyDescription) -> Vec<&ServerDescription> {
    topology.primary().into_iter().collect()
}

fn replica_set_readable<'a>(
    topology: &'a TopologyDescription,
    preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    match preference.mode {
        ReadPreferenceMode::Primary => primaries(topology),
        ReadPreferenceMode::PrimaryPreferred => {
            let primary = primaries(topology);
            if primary.is_empty() {
                eligible_secondaries(topology, preference)
            } else {
                primary
            }
        }
        ReadPreferenceMode::Secondary => eligible_secondaries(topology, preference),
        ReadPreferenceMode::SecondaryPreferred => {
            let secondaries = eligible_secondaries(topology, preference);
            if secondaries.is_empty() {
                primaries(topology)
            } else {
                secondaries
            }
        }
        ReadPreferenceMode::Nearest => {
            let members: Vec<_> = topology
                .servers()
                .filter(|s| {
                    s.server_type == ServerType::RsPrimary
                        || (s.server_type == ServerType::RsSecondary
                            && within_max_staleness(topology, s, preference))
                })
                .collect();
            filter_by_tag_sets(members, &preference.tag_sets)
        }
    }
}

fn eligible_secondaries<'a>(
    topology: &'a TopologyDescription,
    preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let secondaries: Vec<_> = topology
        .servers()
        .filter(|s| s.server_type == ServerType::RsSecondary)
        .filter(|s| within_max_staleness(topology, s, preference))
        .collect();
    filter_by_tag_sets(secondaries, &preference.tag_sets)
}

/// Keep the servers matching the first tag set that matches any of them.
pub fn filter_by_tag_sets<'a>(
    servers: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return servers;
    }
    tag_sets
        .iter()
        .map(|set| {
            servers
                .iter()
                .copied()
                .filter(|s| s.matches_tag_set(set))
                .collect::<Vec<_>>()
        })
        .find(|matched| !matched.is_empty())
        .unwrap_or_default()
}

/// Keep servers whose round-trip time is within `threshold` of the fastest.
pub fn in_latency_window(
    servers: Vec<&ServerDescription>,
    threshold: Duration,
) -> Vec<&ServerDescription> {
    let Some(fastest) = servers.iter().map(|s| rtt(s)).min() else {
        return servers;
    };
    servers
        .into_iter()
        .filter(|s| rtt(s) <= fastest + threshold)
        .collect()
}

fn rtt(server: &ServerDescription) -> Duration {
    server.round_trip_time.unwrap_or_default()
}

fn within_max_staleness(
    topology: &TopologyDescription,
    secondary: &ServerDescription,
    preference: &ReadPreference,
) -> bool {
    match (preference.max_staleness, staleness(topology, secondary)) {
        (Some(max), Some(staleness)) => staleness <= max,
        _ => true,
    }
}

/// How far `secondary` is estimated to lag, or `None` when it cannot be told.
pub fn staleness(topology: &TopologyDescription, secondary: &ServerDescription) -> Option<Duration> {
    let heartbeat = millis(topology.heartbeat_frequency);
    let secondary_write = secondary.last_write_date?.timestamp_millis();

    let lag_ms = match topology.primary() {
        Some(primary) => {
            let primary_write = primary.last_write_date?.timestamp_millis();
            let update_gap = signed_millis(secondary.last_update_time, primary.last_update_time);
            update_gap - (secondary_write - primary_write) + heartbeat
        }
        None => {
            let freshest = topology
                .servers()
                .filter(|s| s.server_type == ServerType::RsSecondary)
                .filter_map(|s| s.last_write_date)
                .max()?
                .timestamp_millis();
            freshest - secondary_write + heartbeat
        }
    };
    Some(Duration::from_millis(lag_ms.max(0) as u64))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// `a - b` in milliseconds, negative when `a` is earlier.
fn signed_millis(a: Instant, b: Instant) -> i64 {
    match a.checked_duration_since(b) {
        Some(d) => millis(d),
        None => -millis(b.duration_since(a)),
    }
}

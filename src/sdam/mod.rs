//! Server discovery and monitoring.
//!
//! Monitors produce [`ServerDescription`]s, the [`TopologyDescription`] state
//! machine folds them into a model of the deployment, and [`select`] picks
//! eligible servers from a snapshot of that model. A [`Cluster`] ties the
//! pieces together for one deployment.

mod address;
mod cluster;
mod description;
mod events;
mod monitor;
mod pool;
mod selection;
mod topology;

pub use address::{ServerAddress, DEFAULT_PORT};
pub use cluster::{Cluster, SelectedServer};
pub use description::{
    next_round_trip_time, ServerDescription, ServerType, TopologyVersion,
    MAX_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_WIRE_VERSION, RTT_ALPHA,
};
pub use events::{SdamEvent, EVENT_CHANNEL_CAPACITY};
pub use pool::ServerPool;
pub use selection::{
    filter_by_tag_sets, in_latency_window, select, staleness, suitable_servers, Predicate,
    ReadPreference, ReadPreferenceMode, SelectionCriteria, TagSet, IDLE_WRITE_PERIOD,
    SMALLEST_MAX_STALENESS,
};
pub use topology::{TopologyDescription, TopologyType};

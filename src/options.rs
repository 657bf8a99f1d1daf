//! Client and topology configuration.

use crate::error::{MongoError, Result};
use crate::sdam::ServerAddress;
use crate::wire::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;
use std::time::Duration;

/// Default interval between server checks.
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// Floor on the interval between two checks of the same server.
pub const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// Default width of the latency window.
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Options for connecting to a deployment.
///
/// Durations are in milliseconds, matching connection string options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Seed list.
    pub hosts: Vec<ServerAddress>,
    /// Required replica set name.
    pub replica_set: Option<String>,
    /// Talk to the one seed only, without discovering other members.
    pub direct_connection: Option<bool>,
    /// Interval between server checks.
    #[serde(rename = "heartbeatFrequencyMS")]
    pub heartbeat_frequency_ms: u64,
    /// Minimum interval between checks of the same server.
    #[serde(rename = "minHeartbeatFrequencyMS")]
    pub min_heartbeat_frequency_ms: u64,
    /// How long server selection may wait for a suitable server.
    #[serde(rename = "serverSelectionTimeoutMS")]
    pub server_selection_timeout_ms: u64,
    /// Latency window above the fastest eligible server.
    #[serde(rename = "localThresholdMS")]
    pub local_threshold_ms: u64,
    /// Connection and socket timeout for monitoring connections.
    #[serde(rename = "connectTimeoutMS")]
    pub connect_timeout_ms: u64,
    /// Application name sent in the handshake.
    pub app_name: Option<String>,
    /// Ceiling on any single incoming message.
    pub max_message_size_bytes: usize,
    /// Compressors to offer the server, in preference order.
    pub compressors: Vec<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            replica_set: None,
            direct_connection: None,
            heartbeat_frequency_ms: DEFAULT_HEARTBEAT_FREQUENCY.as_millis() as u64,
            min_heartbeat_frequency_ms: MIN_HEARTBEAT_FREQUENCY.as_millis() as u64,
            server_selection_timeout_ms: 30_000,
            local_threshold_ms: DEFAULT_LOCAL_THRESHOLD.as_millis() as u64,
            connect_timeout_ms: 10_000,
            app_name: None,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
            compressors: Vec::new(),
        }
    }
}

impl ClientOptions {
    /// Create a new ClientOptions builder with defaults.
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Parse options from a `mongodb://` connection string.
    ///
    /// Credentials and the default database are accepted and ignored.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri.strip_prefix("mongodb://").ok_or_else(|| {
            MongoError::configuration(format!("unsupported connection string scheme in {:?}", uri))
        })?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.split('/').next().unwrap_or_default();
        let hosts = match authority.rsplit_once('@') {
            Some((_, hosts)) => hosts,
            None => authority,
        };

        let mut options = ClientOptions {
            hosts: hosts
                .split(',')
                .filter(|h| !h.is_empty())
                .map(ServerAddress::parse)
                .collect::<Result<_>>()?,
            ..ClientOptions::default()
        };

        for param in query.unwrap_or_default().split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "replicaset" => options.replica_set = Some(value.to_string()),
                "directconnection" => options.direct_connection = Some(parse_bool(key, value)?),
                "heartbeatfrequencyms" => options.heartbeat_frequency_ms = parse_number(key, value)?,
                "serverselectiontimeoutms" => {
                    options.server_selection_timeout_ms = parse_number(key, value)?
                }
                "localthresholdms" => options.local_threshold_ms = parse_number(key, value)?,
                "connecttimeoutms" => options.connect_timeout_ms = parse_number(key, value)?,
                "appname" => options.app_name = Some(value.to_string()),
                "maxmessagesizebytes" => options.max_message_size_bytes = parse_number(key, value)?,
                "compressors" => {
                    options.compressors = value
                        .split(',')
                        .filter(|c| !c.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => tracing::debug!(option = key, "ignoring unsupported connection string option"),
            }
        }

        Ok(options)
    }

    /// Reject configurations that cannot describe a deployment.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(MongoError::configuration("at least one seed host is required"));
        }
        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(MongoError::configuration(format!(
                "a direct connection requires exactly one host, got {}",
                self.hosts.len()
            )));
        }
        if self.heartbeat_frequency_ms < self.min_heartbeat_frequency_ms {
            return Err(MongoError::configuration(format!(
                "heartbeatFrequencyMS must be at least {}",
                self.min_heartbeat_frequency_ms
            )));
        }
        if self.replica_set.as_deref() == Some("") {
            return Err(MongoError::configuration("replicaSet must not be empty"));
        }
        Ok(())
    }

    pub fn heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.heartbeat_frequency_ms)
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_frequency_ms)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_millis(self.server_selection_timeout_ms)
    }

    pub fn local_threshold(&self) -> Duration {
        Duration::from_millis(self.local_threshold_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MongoError::configuration(format!("invalid value {:?} for {}", value, key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(MongoError::configuration(format!(
            "invalid value {:?} for {}",
            value, key
        ))),
    }
}

/// Builder for ClientOptions.
#[derive(Debug, Clone, Default)]
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    /// Add a seed host.
    pub fn host(mut self, address: ServerAddress) -> Self {
        self.options.hosts.push(address);
        self
    }

    /// Replace the seed list.
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = ServerAddress>) -> Self {
        self.options.hosts = hosts.into_iter().collect();
        self
    }

    /// Set the required replica set name.
    pub fn replica_set(mut self, name: impl Into<String>) -> Self {
        self.options.replica_set = Some(name.into());
        self
    }

    /// Enable or disable direct connection.
    pub fn direct_connection(mut self, direct: bool) -> Self {
        self.options.direct_connection = Some(direct);
        self
    }

    /// Set the heartbeat frequency.
    pub fn heartbeat_frequency_ms(mut self, ms: u64) -> Self {
        self.options.heartbeat_frequency_ms = ms;
        self
    }

    /// Set the minimum heartbeat frequency.
    pub fn min_heartbeat_frequency_ms(mut self, ms: u64) -> Self {
        self.options.min_heartbeat_frequency_ms = ms;
        self
    }

    /// Set the server selection timeout.
    pub fn server_selection_timeout_ms(mut self, timeout: u64) -> Self {
        self.options.server_selection_timeout_ms = timeout;
        self
    }

    /// Set the latency window.
    pub fn local_threshold_ms(mut self, ms: u64) -> Self {
        self.options.local_threshold_ms = ms;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.options.connect_timeout_ms = timeout;
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.options.app_name = Some(name.into());
        self
    }

    /// Set the maximum incoming message size.
    pub fn max_message_size_bytes(mut self, size: usize) -> Self {
        self.options.max_message_size_bytes = size;
        self
    }

    /// Set the compressors to offer.
    pub fn compressors(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.compressors = names.into_iter().map(Into::into).collect();
        self
    }

    /// Build the options.
    pub fn build(self) -> ClientOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_options_default() {
        let options = ClientOptions::default();
        assert_eq!(options.heartbeat_frequency(), Duration::from_secs(10));
        assert_eq!(options.min_heartbeat_frequency(), Duration::from_millis(500));
        assert_eq!(options.server_selection_timeout(), Duration::from_secs(30));
        assert_eq!(options.local_threshold(), Duration::from_millis(15));
        assert_eq!(options.connect_timeout(), Duration::from_secs(10));
        assert_eq!(options.max_message_size_bytes, 48_000_000);
        assert!(options.hosts.is_empty());
        assert!(options.direct_connection.is_none());
    }

    #[test]
    fn test_client_options_builder() {
        let options = ClientOptions::builder()
            .host(ServerAddress::new("a", 1))
            .replica_set("rs0")
            .heartbeat_frequency_ms(1_000)
            .server_selection_timeout_ms(5_000)
            .local_threshold_ms(20)
            .app_name("test-app")
            .compressors(["zlib"])
            .build();

        assert_eq!(options.hosts, vec![ServerAddress::new("a", 1)]);
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert_eq!(options.heartbeat_frequency_ms, 1_000);
        assert_eq!(options.server_selection_timeout_ms, 5_000);
        assert_eq!(options.local_threshold_ms, 20);
        assert_eq!(options.app_name, Some("test-app".to_string()));
        assert_eq!(options.compressors, vec!["zlib".to_string()]);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_client_options_parse() {
        let uri = "mongodb://user:pw@A:27017,b:27018/mydb?replicaSet=rs0&heartbeatFrequencyMS=2000&localThresholdMS=30&appName=myapp&compressors=zlib,snappy&directConnection=false";
        let options = ClientOptions::parse(uri).unwrap();

        assert_eq!(
            options.hosts,
            vec![ServerAddress::new("a", 27017), ServerAddress::new("b", 27018)]
        );
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert_eq!(options.heartbeat_frequency_ms, 2000);
        assert_eq!(options.local_threshold_ms, 30);
        assert_eq!(options.app_name, Some("myapp".to_string()));
        assert_eq!(options.compressors, vec!["zlib", "snappy"]);
        assert_eq!(options.direct_connection, Some(false));
    }

    #[test]
    fn test_client_options_parse_no_params() {
        let options = ClientOptions::parse("mongodb://localhost").unwrap();
        assert_eq!(options.hosts, vec![ServerAddress::new("localhost", 27017)]);
        assert_eq!(options.server_selection_timeout_ms, 30_000);
    }

    #[test]
    fn test_client_options_parse_invalid() {
        assert!(ClientOptions::parse("http://localhost").is_err());
        assert!(ClientOptions::parse("mongodb://localhost/?connectTimeoutMS=soon").is_err());
        assert!(ClientOptions::parse("mongodb://localhost/?directConnection=yes").is_err());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            ClientOptions::default().validate(),
            Err(MongoError::Configuration(_))
        ));

        let direct = ClientOptions::parse("mongodb://a,b/?directConnection=true").unwrap();
        assert!(matches!(direct.validate(), Err(MongoError::Configuration(_))));

        let fast = ClientOptions::builder()
            .host(ServerAddress::new("a", 1))
            .heartbeat_frequency_ms(100)
            .build();
        assert!(fast.validate().is_err());
    }

    #[test]
    fn test_deserialize() {
        let json = r#"{
            "hosts": ["h1:27017", "h2"],
            "replicaSet": "rs",
            "heartbeatFrequencyMS": 5000,
            "serverSelectionTimeoutMS": 1000
        }"#;
        let options: ClientOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.hosts.len(), 2);
        assert_eq!(options.replica_set.as_deref(), Some("rs"));
        assert_eq!(options.heartbeat_frequency_ms, 5000);
        assert_eq!(options.server_selection_timeout_ms, 1000);
        assert_eq!(options.local_threshold_ms, 15);
    }
}

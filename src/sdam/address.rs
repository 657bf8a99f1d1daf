use crate::error::{MongoError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port servers listen on when none is given.
pub const DEFAULT_PORT: u16 = 27017;

/// A server's `host:port`. Hosts compare case-insensitively, so they are
/// stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().to_ascii_lowercase(),
            port,
        }
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(MongoError::invalid_argument("empty server address"));
        }

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| {
                MongoError::invalid_argument(format!("unterminated IPv6 address {:?}", address))
            })?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                    MongoError::invalid_argument(format!("invalid server address {:?}", address))
                })?),
            };
            (host, port)
        } else {
            match address.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(MongoError::invalid_argument(format!(
                        "IPv6 address {:?} must be bracketed",
                        address
                    )))
                }
                Some((host, port)) => (host, Some(port)),
                None => (address, None),
            }
        };

        if host.is_empty() {
            return Err(MongoError::invalid_argument(format!(
                "missing host in {:?}",
                address
            )));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    MongoError::invalid_argument(format!("invalid port in {:?}", address))
                })?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = MongoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = MongoError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ServerAddress> for String {
    fn from(address: ServerAddress) -> Self {
        address.to_string()
    }
}

//! MongoClient: server selection plus command execution over the wire protocol.

use crate::connection::{exchange, Connector, TcpConnector};
use crate::doc;
use crate::document::{Document, Value};
use crate::error::{MongoError, Result};
use crate::options::ClientOptions;
use crate::sdam::{
    Cluster, ReadPreference, ReadPreferenceMode, SelectedServer, SelectionCriteria, ServerType,
    TopologyDescription, TopologyType,
};
use crate::wire::{is_compressible, Message, OpCompressed, OpMsg};
use std::sync::Arc;
use tracing::debug;

/// A client for one deployment.
///
/// Owns a [`Cluster`] that monitors the deployment in the background.
/// Commands select a server, then run over a pooled connection to it.
///
/// # Example
///
/// ```ignore
/// use mongo_core::{doc, MongoClient};
///
/// #[tokio::main]
/// async fn main() -> mongo_core::Result<()> {
///     let client = MongoClient::new("mongodb://localhost:27017/?replicaSet=rs0")?;
///     client.ping().await?;
///
///     let reply = client
///         .run_command("admin", doc! { "buildInfo": 1 }, None)
///         .await?;
///     println!("{:?}", reply.get_str("version"));
///
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MongoClient {
    cluster: Cluster,
}

/// Alias kept for code written against the shorter name.
pub type Client = MongoClient;

impl MongoClient {
    /// Create a client from a `mongodb://` connection string, using TCP.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = MongoClient::new("mongodb://a:27017,b:27017/?replicaSet=rs0")?;
    /// ```
    pub fn new(uri: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri)?;
        let connector = TcpConnector::new(options.connect_timeout(), options.max_message_size_bytes);
        Self::with_options(options, Arc::new(connector))
    }

    /// Create a client with custom options and connection factory.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let options = ClientOptions::builder()
    ///     .host(ServerAddress::parse("localhost:27017")?)
    ///     .app_name("my-app")
    ///     .build();
    /// let connector = TcpConnector::new(options.connect_timeout(), options.max_message_size_bytes);
    /// let client = MongoClient::with_options(options, Arc::new(connector))?;
    /// ```
    pub fn with_options(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        Ok(Self {
            cluster: Cluster::new(options, connector)?,
        })
    }

    /// Get the client options.
    pub fn options(&self) -> &ClientOptions {
        self.cluster.options()
    }

    /// The underlying cluster, for topology inspection and events.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// The current topology snapshot.
    pub fn topology(&self) -> TopologyDescription {
        self.cluster.topology()
    }

    /// Select a server, waiting up to the server selection timeout.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Result<SelectedServer> {
        self.cluster.select_server(criteria).await
    }

    /// Run a command against `db`.
    ///
    /// Without criteria the command goes to the primary. A reply with
    /// `ok: 0` becomes [`MongoError::Command`].
    ///
    /// # Example
    ///
    /// ```ignore
    /// let stats = client
    ///     .run_command("mydb", doc! { "dbStats": 1 }, Some(ReadPreference::nearest().into()))
    ///     .await?;
    /// ```
    pub async fn run_command(
        &self,
        db: &str,
        mut command: Document,
        criteria: Option<SelectionCriteria>,
    ) -> Result<Document> {
        let criteria = criteria.unwrap_or_else(|| ReadPreference::primary().into());
        let server = self.cluster.select_server(&criteria).await?;

        if let Some(preference) = read_preference_for(&server, &criteria) {
            command.insert("$readPreference", preference.to_document());
        }
        let message = self.command_message(db, command, &server)?;

        let mut connection = match server.pool.check_out().await {
            Ok(connection) => connection,
            Err(error) => return Err(self.handle_error(&server, error)),
        };
        let max_message_size = self
            .options()
            .max_message_size_bytes
            .min(server.description.max_message_size_bytes);
        let reply = match exchange(
            connection.as_mut(),
            &message,
            self.cluster.compressors(),
            max_message_size,
        )
        .await
        {
            Ok(Some(reply)) => {
                server.pool.check_in(connection);
                reply
            }
            Ok(None) => return Err(MongoError::protocol("command produced no reply")),
            Err(error) => return Err(self.handle_error(&server, error)),
        };

        match check_reply(reply.into_reply_document()?) {
            Ok(reply) => Ok(reply),
            Err(error) => Err(self.handle_error(&server, error)),
        }
    }

    /// Ping the deployment's primary.
    ///
    /// # Example
    ///
    /// ```ignore
    /// if client.ping().await.is_ok() {
    ///     println!("Connected to MongoDB");
    /// }
    /// ```
    pub async fn ping(&self) -> Result<()> {
        self.run_command("admin", doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    /// Stop monitoring. Later operations fail with [`MongoError::Shutdown`].
    pub async fn close(&self) {
        self.cluster.close().await;
    }

    fn command_message(
        &self,
        db: &str,
        command: Document,
        server: &SelectedServer,
    ) -> Result<Message> {
        let compressible = is_compressible(&command);
        let message = Message::Msg(
            OpMsg::command(db, command)
                .with_max_document_size(server.description.max_bson_object_size),
        );
        if !compressible {
            return Ok(message);
        }
        match self
            .cluster
            .compressors()
            .negotiate(&self.options().compressors, &server.description.compression)
        {
            Some(compressor) => Ok(Message::Compressed(OpCompressed::compress(
                &message,
                compressor.as_ref(),
            )?)),
            None => Ok(message),
        }
    }

    /// Feed an operation failure back into the topology.
    fn handle_error(&self, server: &SelectedServer, error: MongoError) -> MongoError {
        let address = server.address();
        if error.is_network_error() {
            self.cluster.mark_server_unknown(address, error.clone());
        } else if error.is_not_primary() {
            debug!(server = %address, %error, "server is no longer primary");
            self.cluster.mark_server_unknown(address, error.clone());
            self.cluster.request_immediate_scan(address);
        }
        error
    }
}

/// The `$readPreference` to send along with a command, if any.
///
/// Mongos routes by it; a directly connected replica set member needs
/// `primaryPreferred` to accept reads when it is not primary.
fn read_preference_for(
    server: &SelectedServer,
    criteria: &SelectionCriteria,
) -> Option<ReadPreference> {
    let SelectionCriteria::ReadPreference(preference) = criteria else {
        return None;
    };
    match (server.topology_type, server.description.server_type) {
        (_, ServerType::Mongos) if preference.mode != ReadPreferenceMode::Primary => {
            Some(preference.clone())
        }
        (TopologyType::Single, ServerType::Mongos) => None,
        (TopologyType::Single, _) => Some(ReadPreference::primary_preferred()),
        _ => None,
    }
}

/// Map `ok: 0` replies to command errors.
fn check_reply(reply: Document) -> Result<Document> {
    if reply.get("ok").map(Value::is_truthy).unwrap_or(false) {
        return Ok(reply);
    }
    Err(MongoError::Command {
        code: reply
            .get_integer("code")
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(0),
        code_name: reply.get_str("codeName").map(str::to_string),
        message: reply.get_str("errmsg").unwrap_or("command failed").to_string(),
    })
}

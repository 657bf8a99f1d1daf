//! The connection collaborator: what the core needs from a socket.
//!
//! A [`Connection`] moves whole messages: `send` writes serialized bytes and
//! `receive` returns the bytes of exactly one reply. Each connection carries
//! the pool generation it was opened under, so a pool clear can discard it.

use crate::error::{MongoError, Result};
use crate::sdam::ServerAddress;
use crate::wire::{read_message_bytes, CompressorRegistry, Message};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// A connection to one server.
#[async_trait]
pub trait Connection: Send + fmt::Debug {
    /// Write one serialized message.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read the bytes of one complete message.
    async fn receive(&mut self) -> Result<Vec<u8>>;

    fn is_connected(&self) -> bool;

    /// Pool generation this connection was opened under.
    fn generation(&self) -> u32;

    fn address(&self) -> &ServerAddress;
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self, address: &ServerAddress, generation: u32)
        -> Result<Box<dyn Connection>>;
}

/// Send `message` and, if it expects one, wait for its reply.
///
/// `max_message_size` bounds both the outgoing message and the reply.
pub async fn exchange(
    connection: &mut dyn Connection,
    message: &Message,
    compressors: &CompressorRegistry,
    max_message_size: usize,
) -> Result<Option<Message>> {
    let bytes = message.serialize()?;
    if bytes.len() > max_message_size {
        return Err(MongoError::MessageTooLarge {
            size: bytes.len(),
            max: max_message_size,
        });
    }
    trace!(
        server = %connection.address(),
        op_code = ?message.op_code(),
        request_id = message.request_id(),
        "sending message"
    );
    connection.send(&bytes).await?;
    if !message.is_replyable() {
        return Ok(None);
    }

    let reply = connection.receive().await?;
    let reply = Message::from_bytes(&reply, max_message_size, compressors)?;
    if reply.response_to() != message.request_id() {
        return Err(MongoError::protocol(format!(
            "reply answers request {}, expected {}",
            reply.response_to(),
            message.request_id()
        )));
    }
    Ok(Some(reply))
}

/// Opens plain TCP connections.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    max_message_size: usize,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, max_message_size: usize) -> Self {
        Self {
            connect_timeout,
            max_message_size,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        address: &ServerAddress,
        generation: u32,
    ) -> Result<Box<dyn Connection>> {
        let target = (address.host(), address.port());
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| MongoError::network(format!("connecting to {} timed out", address)))?
            .map_err(|e| MongoError::network(format!("connecting to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        debug!(server = %address, generation, "opened connection");
        Ok(Box::new(TcpConnection {
            stream,
            address: address.clone(),
            generation,
            connected: true,
            max_message_size: self.max_message_size,
        }))
    }
}

/// A tokio `TcpStream` framed by message headers.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    address: ServerAddress,
    generation: u32,
    connected: bool,
    max_message_size: usize,
}

impl TcpConnection {
    fn fail(&mut self, error: MongoError) -> MongoError {
        self.connected = false;
        error
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(MongoError::ConnectionClosed);
        }
        if let Err(e) = self.stream.write_all(bytes).await {
            return Err(self.fail(e.into()));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(self.fail(e.into()));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        if !self.connected {
            return Err(MongoError::ConnectionClosed);
        }
        let max = self.max_message_size;
        match read_message_bytes(&mut self.stream, max).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(self.fail(e)),
        }
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

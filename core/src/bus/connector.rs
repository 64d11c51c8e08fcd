/// Transport abstraction so the connection manager can be driven by TCP or in-memory pipes
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A bidirectional byte stream carrying STOMP frames
pub trait BusStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BusStream for T {}

/// Opens raw streams to the message bus.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the bus; the STOMP handshake happens on top of the returned stream
    async fn connect(&self) -> Result<Box<dyn BusStream>>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Plain TCP connector (STOMP over TCP)
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn BusStream>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ChatError::Timeout(format!("connect to {}", self.addr)))??;
        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", self.addr);
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use crate::config::Protocol;
use crate::discovery::Endpoint;
use crate::error::{AgentError, Result};

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_507;

/// An open channel to the collector that carries encoded batches
#[async_trait]
pub trait BatchChannel: Send + 'static {
    /// Write one encoded batch
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Peer description for logs
    fn peer(&self) -> &str;
}

/// Opens channels to a resolved endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BatchChannel>>;
}

/// Opens real TCP or UDP sockets according to the endpoint protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketConnector;

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn BatchChannel>> {
        let address = endpoint.address();
        match endpoint.protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(address.as_str()).await?;
                stream.set_nodelay(true)?;
                debug!("Opened TCP channel to {}", address);
                Ok(Box::new(TcpChannel {
                    stream,
                    peer: address,
                }))
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(address.as_str()).await?;
                debug!("Opened UDP channel to {}", address);
                Ok(Box::new(UdpChannel {
                    socket,
                    peer: address,
                }))
            }
        }
    }
}

/// Frames each batch as a big-endian u32 length followed by the payload
pub struct TcpChannel {
    stream: TcpStream,
    peer: String,
}

#[async_trait]
impl BatchChannel for TcpChannel {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            AgentError::Connection(format!("batch of {} bytes too large", payload.len()))
        })?;
        self.stream.write_u32(len).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// One datagram per batch
pub struct UdpChannel {
    socket: UdpSocket,
    peer: String,
}

#[async_trait]
impl BatchChannel for UdpChannel {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM {
            return Err(AgentError::Connection(format!(
                "batch of {} bytes exceeds a UDP datagram",
                payload.len()
            )));
        }
        let sent = self.socket.send(payload).await?;
        if sent != payload.len() {
            return Err(AgentError::Connection(format!(
                "short datagram write: {} of {} bytes",
                sent,
                payload.len()
            )));
        }
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

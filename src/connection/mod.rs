//! Channels to the collector and their observable state

mod channel;
mod status;

pub use channel::{BatchChannel, Connector, MAX_DATAGRAM, SocketConnector, TcpChannel, UdpChannel};
pub use status::{ConnectionState, ConnectionStatus, FAILURE_THRESHOLD};

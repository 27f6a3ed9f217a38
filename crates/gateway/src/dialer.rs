use {async_trait::async_trait, tokio::net::TcpStream};

use crate::address::NetAddress;

/// Opens outbound TCP connections.
///
/// The gateway bounds every dial with its own timeout and cancels it on
/// shutdown, so implementations only need to connect.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &NetAddress) -> std::io::Result<TcpStream>;
}

/// Dials with `TcpStream::connect`, resolving host names.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &NetAddress) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(addr.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

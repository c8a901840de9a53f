//! Random-port TCP listener.
//!
//! [`bind_random`] asks the OS for an ephemeral port and returns a
//! [`RawListener`]. The same listener value feeds both the plaintext and
//! the TLS serving paths; which one runs is decided by the caller, not by
//! the listener type.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::ResponderError;

/// A bound TCP listener with its resolved local address.
#[derive(Debug)]
pub struct RawListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl RawListener {
    /// Accept the next raw TCP connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

/// Bind `ip:0` and return the listener together with the assigned port.
pub async fn bind_random(ip: IpAddr) -> Result<(RawListener, u16), ResponderError> {
    let addr = SocketAddr::new(ip, 0);
    let inner = TcpListener::bind(addr)
        .await
        .map_err(|source| ResponderError::Bind { addr, source })?;
    let local_addr = inner
        .local_addr()
        .map_err(|source| ResponderError::Bind { addr, source })?;

    debug!(addr = %local_addr, "bound ephemeral listener");

    let port = local_addr.port();
    Ok((RawListener { inner, local_addr }, port))
}

//! Raw transport seam — opaque bidirectional byte pipes.
//!
//! The session layer treats every transport as a reliable-within-lifetime
//! byte stream. TCP is the stock implementation used by the connector;
//! `tokio::io::duplex` pairs stand in for it in tests. Relay and Tor
//! transports live outside this crate and plug in through the same trait.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use burrow_core::mailbox::{Hint, HintKind};

/// An opaque reliable byte pipe carrying one L2's frames.
pub trait Pipe: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Pipe for T {}

pub type BoxPipe = Box<dyn Pipe>;

/// A bound TCP listener together with the hints it is reachable at.
pub struct HintListener {
    listener: TcpListener,
    hints: Vec<Hint>,
}

impl HintListener {
    /// Bind an OS-assigned port and build one direct hint per advertised
    /// hostname.
    pub async fn bind(advertise_hosts: &[String]) -> io::Result<HintListener> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        let hints = advertise_hosts
            .iter()
            .map(|hostname| Hint {
                hostname: hostname.clone(),
                port,
                priority: 0.0,
                kind: HintKind::Direct,
            })
            .collect();
        Ok(HintListener { listener, hints })
    }

    pub fn hints(&self) -> &[Hint] {
        &self.hints
    }

    pub async fn accept(&self) -> io::Result<(BoxPipe, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        Ok((Box::new(stream), addr))
    }
}

/// Dial one direct hint. Relay hints are not dialable here: speaking to a
/// relay requires the external relay protocol.
pub async fn dial_hint(hint: &Hint) -> io::Result<BoxPipe> {
    debug_assert_eq!(hint.kind, HintKind::Direct);
    let stream = TcpStream::connect((hint.hostname.as_str(), hint.port)).await?;
    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}

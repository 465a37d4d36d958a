//! Listening socket helpers
//!
//! Event loops own the sockets; these helpers only set them up the way the
//! engine expects (non-blocking, address reuse, no Nagle delay) and wrap an
//! accepted connection into a stream driven by `H2Connection`.

use crate::hio::{ByteStream, ConnInfo, HandlerFactory, HioProtocol, HioStream, TcpTransport};
use crate::http::h2::{H2Config, H2Connection};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::{debug, info};

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Bind a non-blocking listener on `addr`
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    let listener: TcpListener = socket.into();
    info!(addr = %listener.local_addr()?, backlog, "listening");
    Ok(listener)
}

/// Accept one pending connection and bind an HTTP/2 engine to it
///
/// Returns `Ok(None)` when no connection is waiting. The caller delivers
/// `on_init` to the returned stream once it is registered with its event
/// loop.
pub fn accept_h2(
    listener: &TcpListener,
    config: Arc<H2Config>,
    factory: Arc<dyn HandlerFactory>,
) -> io::Result<Option<ByteStream<TcpTransport>>> {
    let (socket, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
        Err(e) => return Err(e),
    };
    let local = socket.local_addr()?;
    SockRef::from(&socket).set_keepalive(true)?;

    let info = Arc::new(ConnInfo::new(peer, local));
    let mut stream =
        ByteStream::new(TcpTransport::new(socket)?, info).with_protocol(HioProtocol::Http2);
    stream.attach(Box::new(H2Connection::new(config, factory)));
    debug!(%peer, %local, "accepted HTTP/2 connection");
    Ok(Some(stream))
}

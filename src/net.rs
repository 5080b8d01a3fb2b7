//! UDP socket construction with explicit kernel buffer sizing.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::Result;

/// Bind a nonblocking UDP socket, size its kernel buffers, optionally
/// connect it, and hand it to tokio.
pub fn bind_udp(
    local: SocketAddr,
    remote: Option<SocketAddr>,
    send_buffer: Option<usize>,
    recv_buffer: Option<usize>,
) -> Result<UdpSocket> {
    let domain = if local.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = send_buffer {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("SO_SNDBUF of {size} bytes refused: {e}");
        }
    }
    if let Some(size) = recv_buffer {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("SO_RCVBUF of {size} bytes refused: {e}");
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;
    if let Some(remote) = remote {
        socket.connect(&remote.into())?;
    }
    Ok(UdpSocket::from_std(socket.into())?)
}

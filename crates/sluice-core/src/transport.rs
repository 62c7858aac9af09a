//! Transport abstraction for pluggable I/O.

use std::{io::Result, net::SocketAddr};

/// Low-level datagram socket owned by a peer's network thread.
///
/// The network loop drains `receive_packet` until it reports `WouldBlock`, so
/// implementations should be non-blocking or block only briefly.
pub trait Socket: Send + 'static {
    /// Sends one datagram to `addr`.
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> Result<usize>;

    /// Receives one datagram into `buffer`.
    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> Result<(&'a [u8], SocketAddr)>;

    /// Returns the address the socket is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Returns whether `receive_packet` blocks (with a timeout) instead of returning `WouldBlock`.
    fn is_blocking_mode(&self) -> bool;
}

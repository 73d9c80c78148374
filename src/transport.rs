//! UDP transport owned by the agent.
//!
//! Sockets are registered under [`SocketId`] handles; candidates reference
//! handles, never sockets. Sends retry transient `EPERM`-class failures a
//! bounded number of times (kernel rate limiting can surface these), then
//! give up so the caller can fail the pair.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::candidate::SocketId;
use crate::error::{IceError, IceResult};

/// Transient send failures are retried at most this many times.
const SEND_RETRY_BUDGET: usize = 3;

/// Registry of the agent's UDP sockets.
#[derive(Debug, Default)]
pub struct SocketMap {
    sockets: HashMap<SocketId, Arc<UdpSocket>>,
    next_id: usize,
}

impl SocketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket and hand back its id.
    pub fn register(&mut self, socket: Arc<UdpSocket>) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        self.sockets.insert(id, socket);
        id
    }

    pub fn get(&self, id: SocketId) -> Option<&Arc<UdpSocket>> {
        self.sockets.get(&id)
    }

    pub fn local_addr(&self, id: SocketId) -> Option<SocketAddr> {
        self.sockets.get(&id).and_then(|s| s.local_addr().ok())
    }

    /// Send a datagram on the socket behind `id`, retrying transient
    /// permission errors within the budget.
    pub async fn send_to(&self, id: SocketId, dst: SocketAddr, payload: &[u8]) -> IceResult<()> {
        let socket = self
            .sockets
            .get(&id)
            .ok_or_else(|| IceError::Configuration(format!("no socket for {:?}", id)))?;

        let mut attempt = 0;
        loop {
            match socket.send_to(payload, dst).await {
                Ok(_) => return Ok(()),
                Err(e) if is_transient(&e) && attempt < SEND_RETRY_BUDGET => {
                    attempt += 1;
                    debug!("transient send error to {} (attempt {}): {}", dst, attempt, e);
                }
                Err(e) => {
                    warn!("send to {} failed: {}", dst, e);
                    return Err(IceError::Network(e));
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_send() {
        let mut map = SocketMap::new();
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let id = map.register(a);
        assert!(map.get(id).is_some());
        assert!(map.local_addr(id).is_some());

        map.send_to(id, b_addr, b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_send_unknown_socket() {
        let map = SocketMap::new();
        let dst: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(map.send_to(SocketId(7), dst, b"x").await.is_err());
    }
}

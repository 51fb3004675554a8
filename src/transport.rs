use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

/// Upper bound for a single datagram. Messages of this engine are small by design
///  (blockwise transfer is an adjacent layer's concern), so this is generous.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// The raw datagram boundary: best-effort, connectionless, unordered. Everything this
///  crate adds (retransmission, deduplication, correlation) is layered on top of this
///  trait, so tests can substitute a recording or mock implementation.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

/// Decouples receiving datagrams from handling them: the transport owns the socket and
///  the loop, the handler owns the decode / dispatch logic. Passed as `Arc<dyn ...>` to
///  keep [Transport] implementations free of engine dependencies.
#[async_trait::async_trait]
pub trait MessageHandler: Sync + Send {
    async fn handle_message(&self, buf: &[u8], sender: SocketAddr);
}


pub struct UdpTransport {
    self_addr: SocketAddr,
    cancel_sender: broadcast::Sender<()>,
    ipv4_send_socket: UdpSocket,
    ipv6_send_socket: UdpSocket,
}

impl UdpTransport {
    pub async fn new(self_addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);

        let ipv4_send_socket = UdpSocket::bind(SocketAddr::from_str("0.0.0.0:0")?).await?;
        let ipv6_send_socket = UdpSocket::bind(SocketAddr::from_str("[::]:0")?).await?;

        Ok(UdpTransport {
            self_addr,
            cancel_sender,
            ipv4_send_socket,
            ipv6_send_socket,
        })
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let socket = if to.is_ipv4() { &self.ipv4_send_socket } else { &self.ipv6_send_socket };
        socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(self.self_addr).await?;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            handler.handle_message(&buf[..len], from).await;
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

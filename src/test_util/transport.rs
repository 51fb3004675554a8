use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

use crate::transport::{MessageHandler, Transport};

/// A [Transport] that records all sent datagrams instead of putting them on a network.
///  Inbound traffic is injected by calling the handler directly, so the receive loop
///  only waits for cancellation.
pub struct RecordingTransport {
    sent: RwLock<Vec<(SocketAddr, Vec<u8>)>>,
    cancel_sender: broadcast::Sender<()>,
}

impl RecordingTransport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> RecordingTransport {
        let (cancel_sender, _) = broadcast::channel(1);
        RecordingTransport {
            sent: Default::default(),
            cancel_sender,
        }
    }

    /// snapshot of all datagrams sent so far, in send order
    pub async fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.sent.read().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!("recording datagram to {:?}: {:?}", to, buf);
        self.sent.write().await.push((to, buf.to_vec()));
        Ok(())
    }

    async fn recv_loop(&self, _handler: Arc<dyn MessageHandler>) -> anyhow::Result<()> {
        let mut cancel_receiver = self.cancel_sender.subscribe();
        let _ = cancel_receiver.recv().await;
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        let _ = self.cancel_sender.send(());
    }
}

use std::collections::BTreeSet;
use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::trace;

use crate::exchange::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::message::Token;

/// Issues exchange-correlation tokens, scoped per remote peer. The central invariant is
///  that no two concurrently open exchanges to the same peer ever share a token; it is
///  upheld by doing every allocation as one atomic read-compute-insert under the table
///  lock.
///
/// Allocation picks the successor of the numerically largest token currently in use for
///  the peer (big-endian, growing in length on overflow), which keeps the search O(1)
///  amortized regardless of how fragmented the in-use set is.
pub struct TokenAllocator {
    max_token_len: usize,
    peers: RwLock<FxHashMap<SocketAddr, BTreeSet<Token>>>,
}

impl TokenAllocator {
    pub fn new(config: &ExchangeConfig) -> TokenAllocator {
        TokenAllocator {
            max_token_len: config.max_token_len,
            peers: Default::default(),
        }
    }

    pub async fn allocate(&self, peer: SocketAddr) -> Result<Token, ExchangeError> {
        let mut peers = self.peers.write().await;
        let in_use = peers.entry(peer).or_default();

        let candidate = match in_use.last() {
            Some(highest) => highest.successor(self.max_token_len),
            None => Token::EMPTY.successor(self.max_token_len),
        };

        match candidate {
            Some(token) => {
                let was_new = in_use.insert(token);
                debug_assert!(was_new, "successor of the highest in-use token was already allocated");
                trace!(?peer, ?token, "allocated token");
                Ok(token)
            }
            None => Err(ExchangeError::TokensExhausted { peer }),
        }
    }

    /// Releasing an unallocated token is an error the caller may log, but it must never
    ///  disturb other allocations for the peer.
    pub async fn release(&self, peer: SocketAddr, token: Token) -> Result<(), ExchangeError> {
        let mut peers = self.peers.write().await;

        let Some(in_use) = peers.get_mut(&peer) else {
            return Err(ExchangeError::UnknownToken { peer, token });
        };
        if !in_use.remove(&token) {
            return Err(ExchangeError::UnknownToken { peer, token });
        }
        if in_use.is_empty() {
            peers.remove(&peer);
        }
        trace!(?peer, ?token, "released token");
        Ok(())
    }

    pub async fn num_allocated(&self, peer: SocketAddr) -> usize {
        self.peers.read().await
            .get(&peer)
            .map(|in_use| in_use.len())
            .unwrap_or(0)
    }
}

use std::net::SocketAddr;

use crate::message::Token;

/// The named failure conditions the application must be able to tell apart. Timeouts and
///  resets are *not* in here: they are regular termination events, delivered through the
///  corresponding [crate::exchange::client::ResponseHandler] hooks.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// the token space for this peer is exhausted - recoverable by reducing the number
    ///  of concurrently open exchanges
    #[error("no free token for peer {peer}")]
    TokensExhausted { peer: SocketAddr },

    /// all 16-bit message ids for this peer are in their reuse-protection window
    #[error("no free message id for peer {peer}")]
    MessageIdsExhausted { peer: SocketAddr },

    /// releasing a token that is not allocated - reported, not fatal
    #[error("token {token:?} is not allocated for peer {peer}")]
    UnknownToken { peer: SocketAddr, token: Token },

    /// a second ping would clash with the still-open empty-token exchange of the first
    #[error("a ping to peer {peer} is already outstanding")]
    PingOutstanding { peer: SocketAddr },

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

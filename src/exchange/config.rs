use std::time::Duration;

use crate::message::Token;

/// All timing and sizing knobs of the exchange layer in one place. The defaults follow
///  the usual constrained-device transmission parameters (2s base timeout, four
///  retransmissions, 50% jitter, two-minute exchange lifetime).
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// base delay before the first retransmission of a confirmable message
    pub ack_timeout: Duration,
    /// upper jitter bound as a factor on [Self::ack_timeout]: each exchange draws its
    ///  initial delay uniformly from `ack_timeout .. ack_timeout * ack_random_factor`
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
    /// extra wait after the last retransmission window before giving up on an exchange
    pub timeout_grace_period: Duration,

    /// how long an inbound confirmable request may stay unanswered before a bare
    ///  (separate) acknowledgement is sent
    pub separate_ack_delay: Duration,

    /// window during which a message id stays reserved and duplicates are recognized;
    ///  deliberately much longer than the retransmission lifetime of a single exchange
    pub exchange_lifetime: Duration,
    /// random probes for a free message id before falling back to a linear scan
    pub mid_probe_limit: u32,

    pub max_token_len: usize,

    /// every n-th notification of a subscription is sent confirmable so dead observers
    ///  are eventually detected; the others are non-confirmable
    pub con_notification_interval: u32,
}

impl ExchangeConfig {
    pub fn new() -> ExchangeConfig {
        ExchangeConfig {
            ack_timeout: Duration::from_millis(2000),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            timeout_grace_period: Duration::from_secs(2),
            separate_ack_delay: Duration::from_millis(2000),
            exchange_lifetime: Duration::from_secs(120),
            mid_probe_limit: 16,
            max_token_len: Token::MAX_LEN,
            con_notification_interval: 5,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig::new()
    }
}

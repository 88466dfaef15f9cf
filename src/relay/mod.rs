//! Realtime relay
//!
//! Pass-through WebSocket proxy between a browser client and a hosted duplex
//! speech provider, plus a local client for the same protocol.

mod client;
pub mod protocol;
mod proxy;

use std::time::Duration;

use secrecy::SecretString;

pub use client::{RealtimeClient, pcm16_to_f32};
pub use protocol::{ClientMessage, ServerEvent, ServerMessage};
pub use proxy::{ConversationObserver, RelayState, router};

/// Default upstream endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "wss://realtime.eva.local/v1/stream";

/// Relay configuration
#[derive(Debug)]
pub struct RelayConfig {
    /// Provider WebSocket endpoint
    pub upstream_url: String,
    /// Credential presented to the provider, never to the browser
    pub provider_api_key: Option<SecretString>,
    /// Token clients must present; `None` allows everyone
    pub relay_token: Option<SecretString>,
    /// Frames buffered per direction before backpressure applies
    pub max_in_flight: usize,
    /// Partial assistant text is recorded after this much silence
    pub idle_flush: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            provider_api_key: None,
            relay_token: None,
            max_in_flight: 8,
            idle_flush: crate::voice::transcript::DEFAULT_IDLE_FLUSH,
        }
    }
}

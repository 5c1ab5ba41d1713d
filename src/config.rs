// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::Deserialize;

use crate::protocol::{DsiOption, DSI_DEFAULT_MAX_BODY};

pub const DSI_DEFAULT_PORT: u16 = 548;

/// Tunables for a single DSI session.  Every field has a default, so a
/// partial document deserializes cleanly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    /// Zero waits for a response indefinitely.
    pub request_timeout_ms: u64,
    /// How long `close` waits to hand the server a CloseSession before
    /// tearing the connection down without one.
    pub close_timeout_ms: u64,
    pub max_body_len: usize,
    /// Capped below the 16-bit request id space when applied.
    pub max_pending: usize,
    pub attention_quantum: Option<u32>,
    /// Fixed starting request id; a random seed is used when unset.
    pub request_id_seed: Option<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            close_timeout_ms: 1_000,
            max_body_len: DSI_DEFAULT_MAX_BODY,
            max_pending: 1024,
            attention_quantum: Some(1024),
            request_id_seed: None,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending.max(1).min(usize::from(u16::max_value()))
    }

    /// Options sent in the body of the OpenSession request.
    pub fn open_options(&self) -> Vec<DsiOption> {
        self.attention_quantum
            .map(DsiOption::attention_quantum)
            .into_iter()
            .collect()
    }
}

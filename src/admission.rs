//! Purchase admission: at most one admitted purchase per client per window.
//!
//! The window check and the insert run inside a single [`Ledger::transaction`],
//! so two requests for the same client can never both observe an empty window.
//! A record exactly `window` old no longer blocks: the window is
//! `(now - window, now]`.

use crate::errors::PurchaseError;
use crate::ledger::{Ledger, RecordId};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// How the retry hint on a denial is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryAfterPolicy {
    /// Seconds until the blocking purchase leaves the window, rounded up.
    #[default]
    Remaining,
    /// Always the full window length.
    Fixed,
}

impl RetryAfterPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remaining" | "precise" => Some(Self::Remaining),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        record_id: RecordId,
        timestamp_millis: u64,
    },
    Denied {
        retry_after_seconds: u64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    /// Maps a denial onto [`PurchaseError::RateLimited`] for callers that
    /// treat rejection as an error path.
    pub fn into_result(self) -> Result<(RecordId, u64), PurchaseError> {
        match self {
            Admission::Admitted {
                record_id,
                timestamp_millis,
            } => Ok((record_id, timestamp_millis)),
            Admission::Denied {
                retry_after_seconds,
            } => Err(PurchaseError::RateLimited {
                retry_after_seconds,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    ledger: Ledger,
    window: Duration,
    retry_after: RetryAfterPolicy,
}

impl AdmissionGate {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            window: DEFAULT_WINDOW,
            retry_after: RetryAfterPolicy::default(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_retry_after_policy(mut self, policy: RetryAfterPolicy) -> Self {
        self.retry_after = policy;
        self
    }

    pub fn try_purchase(
        &self,
        client_id: &str,
        now_millis: u64,
    ) -> Result<Admission, PurchaseError> {
        validate_client_id(client_id)?;
        let window_millis = self.window.as_millis() as u64;
        let cutoff = now_millis.saturating_sub(window_millis);

        let admission = self.ledger.transaction(|tx| {
            if tx.count_since(client_id, cutoff)? == 0 {
                let record_id = tx.insert(client_id, now_millis)?;
                return Ok(Admission::Admitted {
                    record_id,
                    timestamp_millis: now_millis,
                });
            }
            let retry_after_seconds = match self.retry_after {
                RetryAfterPolicy::Fixed => ceil_seconds(window_millis),
                RetryAfterPolicy::Remaining => match tx.latest_since(client_id, cutoff)? {
                    Some(blocking) => {
                        remaining_seconds(blocking.timestamp_millis, window_millis, now_millis)
                    }
                    None => ceil_seconds(window_millis),
                },
            };
            Ok(Admission::Denied {
                retry_after_seconds,
            })
        })?;

        debug!(
            client_id,
            admitted = admission.is_admitted(),
            now_millis,
            "admission decided"
        );
        Ok(admission)
    }

    pub fn purchase_history(&self, client_id: &str) -> Result<u64, PurchaseError> {
        validate_client_id(client_id)?;
        self.ledger.total_count(client_id)
    }
}

fn validate_client_id(client_id: &str) -> Result<(), PurchaseError> {
    if client_id.is_empty() {
        return Err(PurchaseError::InvalidRequest);
    }
    Ok(())
}

fn remaining_seconds(blocking_millis: u64, window_millis: u64, now_millis: u64) -> u64 {
    let expires_at = blocking_millis.saturating_add(window_millis);
    let remaining = expires_at.saturating_sub(now_millis).min(window_millis);
    ceil_seconds(remaining)
}

fn ceil_seconds(millis: u64) -> u64 {
    millis.div_ceil(1000)
}

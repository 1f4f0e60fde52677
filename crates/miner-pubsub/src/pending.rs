//! Correlation table for commands awaiting a `RESPONSE`.
//!
//! Each outstanding command is keyed by its nonce and owns a oneshot sender.
//! Entries leave the table exactly once: on a matching reply, on timeout
//! eviction, on connection loss, or when the waiting caller goes away.

use std::collections::HashMap;
use std::time::Duration;

use miner_core::Nonce;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::ResponseFrame;
use crate::errors::RequestError;

/// Result delivered to the caller awaiting a reply.
pub type RequestOutcome = Result<ResponseFrame, RequestError>;

/// Handle the caller waits on.
pub type ReplyReceiver = oneshot::Receiver<RequestOutcome>;

struct PendingEntry {
    issued_at: Instant,
    label: String,
    tx: oneshot::Sender<RequestOutcome>,
}

/// Outstanding requests indexed by nonce.
pub struct PendingRequests {
    entries: HashMap<Nonce, PendingEntry>,
    timeout: Duration,
}

impl PendingRequests {
    /// Create an empty table whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Track `nonce`; `label` describes the command for logs.
    pub fn register(
        &mut self,
        nonce: Nonce,
        label: impl Into<String>,
    ) -> Result<ReplyReceiver, RequestError> {
        if self.entries.contains_key(&nonce) {
            return Err(RequestError::DuplicateNonce(nonce.into_inner()));
        }
        let (tx, rx) = oneshot::channel();
        let _ = self.entries.insert(
            nonce,
            PendingEntry {
                issued_at: Instant::now(),
                label: label.into(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Complete the entry for `nonce`. Returns `false` if none matched.
    pub fn resolve(&mut self, nonce: &str, outcome: RequestOutcome) -> bool {
        let Some(entry) = self.entries.remove(nonce) else {
            return false;
        };
        if let Err(err) = &outcome {
            debug!(nonce, label = %entry.label, error = %err, "request failed");
        }
        // the waiter may already have given up
        let _ = entry.tx.send(outcome);
        true
    }

    /// Complete the entry matching a `RESPONSE` frame.
    ///
    /// The bad-credentials signal becomes [`RequestError::AuthFailed`], any
    /// other non-empty error [`RequestError::Rejected`]. Returns `false`
    /// when the frame carries no nonce or the nonce is not outstanding.
    pub fn resolve_response(&mut self, response: &ResponseFrame) -> bool {
        let Some(nonce) = &response.nonce else {
            return false;
        };
        let outcome = if response.is_success() {
            Ok(response.clone())
        } else if response.is_auth_failure() {
            Err(RequestError::AuthFailed {
                nonce: nonce.to_string(),
                reason: response.error.clone(),
            })
        } else {
            Err(RequestError::Rejected {
                nonce: nonce.to_string(),
                reason: response.error.clone(),
            })
        };
        self.resolve(nonce, outcome)
    }

    /// Fail every entry older than the timeout. Returns how many expired.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let expired: Vec<Nonce> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.issued_at) >= timeout)
            .map(|(n, _)| n.clone())
            .collect();
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        for nonce in &expired {
            let err = RequestError::Timeout {
                nonce: nonce.to_string(),
                timeout_ms,
            };
            let _ = self.resolve(nonce, Err(err));
        }
        expired.len()
    }

    /// Fail every entry with `err`. Returns how many were failed.
    pub fn fail_all(&mut self, err: &RequestError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(err.clone()));
        }
        count
    }

    /// Forget `nonce` without notifying anyone (the waiter is gone).
    pub fn cancel(&mut self, nonce: &str) -> bool {
        self.entries.remove(nonce).is_some()
    }

    /// Whether `nonce` is outstanding.
    pub fn contains(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

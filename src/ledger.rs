//! Outstanding requests.
//!
//! Two ids thread through every request: the command's UUID settles it, and the
//! one-byte transport message id pushes its deadline back whenever a frame of
//! the reply arrives.

use crate::error::{BridgeError, Result};
use crate::lock;
use bridge_protocol::Command;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

struct PendingRequest {
    command: Command,
    message_id: u8,
    sent_at: Instant,
    timeout: Duration,
    deadline: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
pub struct RequestLedger {
    pending: HashMap<Uuid, PendingRequest>,
    by_message: HashMap<u8, Uuid>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request; the receiver settles exactly once
    pub fn register(
        &mut self,
        command: Command,
        message_id: u8,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let id = command.id;

        self.by_message.insert(message_id, id);
        self.pending.insert(
            id,
            PendingRequest {
                command,
                message_id,
                sent_at: now,
                timeout,
                deadline: now + timeout,
                tx,
            },
        );

        rx
    }

    fn take(&mut self, id: &Uuid) -> Option<PendingRequest> {
        let request = self.pending.remove(id)?;
        if self.by_message.get(&request.message_id) == Some(id) {
            self.by_message.remove(&request.message_id);
        }
        Some(request)
    }

    /// Settle with data; returns the round-trip latency
    pub fn resolve(&mut self, id: &Uuid, data: Value) -> Option<Duration> {
        let request = self.take(id)?;
        let latency = request.sent_at.elapsed();
        let _ = request.tx.send(Ok(data));
        Some(latency)
    }

    /// Settle with the error message the peer sent
    pub fn reject(&mut self, id: &Uuid, message: String) -> bool {
        match self.take(id) {
            Some(request) => {
                let _ = request.tx.send(Err(BridgeError::Command {
                    command: request.command.to_string(),
                    message,
                }));
                true
            }
            None => false,
        }
    }

    /// Settle with a local failure (e.g. the datagram could not be sent)
    pub fn fail(&mut self, id: &Uuid, error: BridgeError) -> bool {
        match self.take(id) {
            Some(request) => {
                let _ = request.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// A frame for `message_id` arrived; restart that request's timeout
    pub fn reset_timeout(&mut self, message_id: u8) -> bool {
        let Some(id) = self.by_message.get(&message_id) else {
            return false;
        };
        match self.pending.get_mut(id) {
            Some(request) => {
                request.deadline = Instant::now() + request.timeout;
                true
            }
            None => false,
        }
    }

    pub fn deadline(&self, id: &Uuid) -> Option<Instant> {
        self.pending.get(id).map(|request| request.deadline)
    }

    /// Time the request out if its deadline has passed
    pub fn expire(&mut self, id: &Uuid, now: Instant) -> bool {
        match self.pending.get(id) {
            Some(request) if request.deadline <= now => {}
            _ => return false,
        }

        match self.take(id) {
            Some(request) => {
                let _ = request.tx.send(Err(BridgeError::Timeout {
                    command: request.command.to_string(),
                    timeout: request.timeout,
                }));
                true
            }
            None => false,
        }
    }

    /// Fail every request with `Disconnected`; returns how many were pending
    pub fn purge(&mut self) -> usize {
        self.by_message.clear();
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.tx.send(Err(BridgeError::Disconnected {
                command: request.command.to_string(),
            }));
        }
        count
    }

    /// Forget one request; its caller is no longer waiting
    pub fn cancel(&mut self, id: &Uuid) -> bool {
        self.take(id).is_some()
    }

    /// Forget every request without settling it (local shutdown)
    pub fn clear(&mut self) {
        self.by_message.clear();
        self.pending.clear();
    }

    #[cfg(test)]
    pub fn contains(&self, id: &Uuid) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Cancels a registered request when dropped, so a caller that gives up on
/// the future does not leave its entry behind.
pub struct PendingGuard<'a> {
    ledger: &'a Mutex<RequestLedger>,
    id: Uuid,
}

impl<'a> PendingGuard<'a> {
    pub fn new(ledger: &'a Mutex<RequestLedger>, id: Uuid) -> Self {
        Self { ledger, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if lock(self.ledger).cancel(&self.id) {
            log::debug!("Request {} abandoned by its caller", self.id);
        }
    }
}

/// Wait for a registered request to settle, honouring deadline resets.
///
/// Requests forgotten by [`RequestLedger::clear`] settle with `Closed`.
pub async fn wait_for(
    ledger: &Mutex<RequestLedger>,
    id: Uuid,
    mut rx: oneshot::Receiver<Result<Value>>,
) -> Result<Value> {
    loop {
        let deadline = lock(ledger).deadline(&id);
        let Some(deadline) = deadline else {
            return rx.await.unwrap_or(Err(BridgeError::Closed));
        };

        tokio::select! {
            result = &mut rx => return result.unwrap_or(Err(BridgeError::Closed)),
            _ = tokio::time::sleep_until(deadline.into()) => {
                // Deadline may have moved while we slept; expire() checks again
                lock(ledger).expire(&id, Instant::now());
            }
        }
    }
}

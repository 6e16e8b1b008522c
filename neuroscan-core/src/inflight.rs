//! Single-slot in-flight guard per (client, operation kind).
//!
//! A second `analyze` from the same client while the first is still running
//! is refused with [`GuardError::Busy`]. An outstanding operation can be
//! cancelled from another request; the work future is dropped at its next
//! await point and the caller sees [`GuardError::Cancelled`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Client id used when a request carries no `X-Client-Id`.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Analyze,
    Chat,
    Viewer,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Analyze => "analyze",
            OperationKind::Chat => "chat",
            OperationKind::Viewer => "viewer",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(OperationKind::Analyze),
            "chat" => Ok(OperationKind::Chat),
            "viewer" => Ok(OperationKind::Viewer),
            other => Err(format!("unknown operation kind '{}'", other)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("A {kind} request is already in progress for this client")]
    Busy { client: String, kind: OperationKind },

    #[error("The {kind} request was cancelled")]
    Cancelled { kind: OperationKind },
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuardError::Busy { .. } => ErrorKind::Busy,
            GuardError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }
}

type SlotKey = (String, OperationKind);

struct Slot {
    id: Uuid,
    token: CancellationToken,
}

#[derive(Clone, Default)]
pub struct InFlightGuard {
    slots: Arc<Mutex<HashMap<SlotKey, Slot>>>,
}

fn lock(slots: &Mutex<HashMap<SlotKey, Slot>>) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot for `(client, kind)` or fail with `Busy`.
    pub fn begin(&self, client: &str, kind: OperationKind) -> Result<InFlightTicket, GuardError> {
        let key = (client.to_string(), kind);
        let mut slots = lock(&self.slots);
        if slots.contains_key(&key) {
            return Err(GuardError::Busy {
                client: client.to_string(),
                kind,
            });
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        slots.insert(
            key.clone(),
            Slot {
                id,
                token: token.clone(),
            },
        );
        tracing::debug!(client = %client, kind = %kind, ticket = %id, "In-flight slot taken");

        Ok(InFlightTicket {
            key,
            id,
            token,
            slots: self.slots.clone(),
        })
    }

    /// Cancel the outstanding operation, if any. Returns whether one existed.
    pub fn cancel(&self, client: &str, kind: OperationKind) -> bool {
        let slots = lock(&self.slots);
        match slots.get(&(client.to_string(), kind)) {
            Some(slot) => {
                slot.token.cancel();
                tracing::info!(client = %client, kind = %kind, ticket = %slot.id, "In-flight request cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_busy(&self, client: &str, kind: OperationKind) -> bool {
        lock(&self.slots).contains_key(&(client.to_string(), kind))
    }
}

/// Holds a guard slot; dropping it frees the slot.
pub struct InFlightTicket {
    key: SlotKey,
    id: Uuid,
    token: CancellationToken,
    slots: Arc<Mutex<HashMap<SlotKey, Slot>>>,
}

impl InFlightTicket {
    pub fn kind(&self) -> OperationKind {
        self.key.1
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drive `work` to completion unless the ticket is cancelled first.
    pub async fn run<F, T>(&self, work: F) -> Result<T, GuardError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(GuardError::Cancelled { kind: self.kind() }),
            out = work => Ok(out),
        }
    }
}

impl Drop for InFlightTicket {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if slots.get(&self.key).is_some_and(|slot| slot.id == self.id) {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_begin_is_busy_until_release() {
        let guard = InFlightGuard::new();
        let first = guard.begin("alice", OperationKind::Analyze).unwrap();

        let err = guard.begin("alice", OperationKind::Analyze).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Busy);

        // other kinds and other clients are independent
        let _chat = guard.begin("alice", OperationKind::Chat).unwrap();
        let _other = guard.begin("bob", OperationKind::Analyze).unwrap();

        drop(first);
        assert!(!guard.is_busy("alice", OperationKind::Analyze));
        assert!(guard.begin("alice", OperationKind::Analyze).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_work() {
        let guard = InFlightGuard::new();
        let ticket = guard.begin(ANONYMOUS_CLIENT, OperationKind::Chat).unwrap();

        let canceller = guard.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(canceller.cancel(ANONYMOUS_CLIENT, OperationKind::Chat));
        });

        let result = ticket
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "finished"
            })
            .await;
        assert_eq!(result, Err(GuardError::Cancelled { kind: OperationKind::Chat }));
        assert!(ticket.is_cancelled());

        drop(ticket);
        assert!(!guard.is_busy(ANONYMOUS_CLIENT, OperationKind::Chat));
    }

    #[tokio::test]
    async fn test_run_returns_output_when_not_cancelled() {
        let guard = InFlightGuard::new();
        let ticket = guard.begin("c", OperationKind::Viewer).unwrap();
        assert_eq!(ticket.run(async { 42 }).await, Ok(42));
    }

    #[test]
    fn test_cancel_without_outstanding_request() {
        let guard = InFlightGuard::new();
        assert!(!guard.cancel("nobody", OperationKind::Analyze));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("viewer".parse::<OperationKind>(), Ok(OperationKind::Viewer));
        assert!("upload".parse::<OperationKind>().is_err());
    }
}

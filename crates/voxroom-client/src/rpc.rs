//! Client half of the SFU request/response channel
//!
//! Each call registers a one-shot slot under a fresh correlation id before
//! the request is queued. The slot is resolved exactly once: by the matching
//! response, by the call's timeout, or by [`RpcClient::cancel_all`] when the
//! socket goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use voxroom_protocol::{RpcRequest, RpcResponse, SfuClientMessage, SfuRequest, SfuResponse};

use crate::error::RpcError;

type Slot = oneshot::Sender<Result<SfuResponse, RpcError>>;

pub struct RpcClient {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Slot>>,
    outbound: mpsc::UnboundedSender<SfuClientMessage>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(outbound: mpsc::UnboundedSender<SfuClientMessage>, timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound,
            timeout,
        }
    }

    pub async fn call(&self, request: SfuRequest) -> Result<SfuResponse, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = request.name();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        tracing::debug!("Request #{} {}", id, operation);
        if self
            .outbound
            .send(SfuClientMessage::Request(RpcRequest { id, request }))
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Disconnected);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!("Request #{} ({}) timed out", id, operation);
                Err(RpcError::Timeout { id, operation })
            }
        }
    }

    /// Hand a response to the call waiting on its id
    pub async fn resolve(&self, response: RpcResponse) {
        let id = response.id;
        let Some(slot) = self.pending.lock().await.remove(&id) else {
            tracing::warn!("Dropping response #{} with no pending request", id);
            return;
        };

        if slot.send(response.into_result().map_err(RpcError::from)).is_err() {
            tracing::debug!("Caller for request #{} is gone", id);
        }
    }

    pub async fn cancel_all(&self) {
        let pending: Vec<(u64, Slot)> = self.pending.lock().await.drain().collect();
        if !pending.is_empty() {
            tracing::debug!("Cancelling {} pending request(s)", pending.len());
        }
        for (_, slot) in pending {
            let _ = slot.send(Err(RpcError::Cancelled));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

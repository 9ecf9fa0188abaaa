use tokio::sync::mpsc;
use voxroom_protocol::{RpcErrorCode, RpcResponse, SfuResponse, SfuServerMessage};

use crate::error::SfuError;

/// Acknowledges exactly one RPC request.
///
/// `ack` consumes the responder, and a responder dropped without an ack
/// (for example when its dispatch panics) answers with a cancellation
/// error instead.
pub struct Responder {
    id: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

impl Responder {
    pub fn new(id: u64, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            outbound: Some(outbound),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ack(mut self, result: Result<SfuResponse, SfuError>) {
        let response = match result {
            Ok(data) => RpcResponse::ok(self.id, data),
            Err(e) => {
                tracing::debug!("Request #{} failed: {}", self.id, e);
                RpcResponse::err(self.id, e.code(), e.to_string())
            }
        };
        self.deliver(response);
    }

    pub fn reject(mut self, code: RpcErrorCode, message: impl Into<String>) {
        let response = RpcResponse::err(self.id, code, message);
        self.deliver(response);
    }

    fn deliver(&mut self, response: RpcResponse) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };

        match serde_json::to_string(&SfuServerMessage::Response(response)) {
            Ok(json) => {
                if outbound.send(json).is_err() {
                    tracing::debug!("Connection closed before request #{} was answered", self.id);
                }
            }
            Err(e) => tracing::error!("Failed to serialize response #{}: {}", self.id, e),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.outbound.is_some() {
            self.deliver(RpcResponse::err(
                self.id,
                RpcErrorCode::Cancelled,
                "Request was cancelled",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<RpcResponse> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            match serde_json::from_str(&json).unwrap() {
                SfuServerMessage::Response(response) => out.push(response),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        out
    }

    #[test]
    fn ack_sends_a_single_response() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Responder::new(3, tx);
        assert_eq!(responder.id(), 3);
        responder.ack(Ok(SfuResponse::TransportConnected));

        assert_eq!(
            responses(&mut rx),
            vec![RpcResponse::ok(3, SfuResponse::TransportConnected)]
        );
    }

    #[test]
    fn error_carries_its_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        Responder::new(4, tx).ack(Err(SfuError::NotInRoom));

        let got = responses(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].code, Some(RpcErrorCode::NotInRoom));
    }

    #[test]
    fn dropped_responder_reports_cancellation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(Responder::new(9, tx));

        let got = responses(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, 9);
        assert_eq!(got[0].code, Some(RpcErrorCode::Cancelled));
    }

    #[tokio::test]
    async fn aborted_task_still_answers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let _responder = Responder::new(11, tx);
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        let got = responses(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].code, Some(RpcErrorCode::Cancelled));
    }
}

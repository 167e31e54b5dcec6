use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{error::BridgeError, store::read_json};

use super::Bridge;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InboundMessage {
    pub(crate) id: String,
    pub(crate) sender_id: String,
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFile {
    current_message: Option<InboundMessage>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Idle,
    Processed { id: String, injected: bool },
}

/// Watches the inbound message file and injects each new message once.
pub(crate) struct Monitor {
    bridge: Arc<Bridge>,
    idle_interval: Duration,
}

impl Monitor {
    pub(crate) fn new(bridge: Arc<Bridge>, idle_interval: Duration) -> Self {
        Self {
            bridge,
            idle_interval,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub(crate) async fn run(&self) {
        info!(
            path = %self.bridge.files().inbound.display(),
            "watching for whatsapp messages"
        );

        while self.bridge.is_running() {
            match self.poll_once().await {
                Ok(PollOutcome::Processed { id, injected }) => {
                    debug!(message_id = %id, injected, "inbound message processed");
                }
                Ok(PollOutcome::Idle) => tokio::time::sleep(self.idle_interval).await,
                Err(error) => {
                    warn!(%error, "failed to process whatsapp message");
                    tokio::time::sleep(self.idle_interval).await;
                }
            }
        }

        info!("message monitor stopped");
    }

    pub(crate) async fn poll_once(&self) -> Result<PollOutcome, BridgeError> {
        let Some(file) = read_json::<InboundFile>(&self.bridge.files().inbound)? else {
            return Ok(PollOutcome::Idle);
        };

        let Some(message) = file.current_message else {
            return Ok(PollOutcome::Idle);
        };

        if self.bridge.is_last_processed(&message.id).await {
            return Ok(PollOutcome::Idle);
        }

        info!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            text = %message.message,
            timestamp = %message.timestamp,
            "new whatsapp message detected"
        );

        let pending = self.bridge.track_reply(&message.id);
        let injected = self
            .bridge
            .inject(&message.sender_id, &message.message, &message.id)
            .await;

        if injected {
            let bridge = Arc::clone(&self.bridge);
            let message_id = message.id.clone();
            tokio::spawn(async move {
                let _pending = pending;
                match bridge.wait_for_reply(&message_id).await {
                    Some(_) => debug!(message_id = %message_id, "background wait got a reply"),
                    None => debug!(message_id = %message_id, "background wait ended without reply"),
                }
            });
        }

        // Advance even on failure so a broken message is not retried forever.
        self.bridge.mark_processed(&message.id).await;

        Ok(PollOutcome::Processed {
            id: message.id,
            injected,
        })
    }
}

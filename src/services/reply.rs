use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    error::BridgeError,
    store::{read_json, remove_if_present},
};

/// Consecutive unusable polls after which a reply file is treated as stale.
const STALE_REPLY_POLLS: u32 = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplyEnvelope {
    reply: Option<String>,
    message_id: Option<String>,
}

#[derive(Debug)]
enum ReplyPoll {
    Absent,
    Ready(String),
    /// Addressed to another pending message.
    Foreign,
    Unusable,
}

/// Message ids that still have someone waiting for their reply.
#[derive(Clone, Debug, Default)]
struct PendingReplies {
    ids: Arc<Mutex<HashMap<String, usize>>>,
}

impl PendingReplies {
    fn ids(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, message_id: &str) -> PendingReply {
        *self.ids().entry(message_id.to_string()).or_insert(0) += 1;
        PendingReply {
            pending: self.clone(),
            message_id: message_id.to_string(),
        }
    }

    fn contains(&self, message_id: &str) -> bool {
        self.ids().contains_key(message_id)
    }
}

/// Keeps a message id pending until dropped.
#[derive(Debug)]
pub(crate) struct PendingReply {
    pending: PendingReplies,
    message_id: String,
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut ids = self.pending.ids();
        if let Some(count) = ids.get_mut(&self.message_id) {
            *count -= 1;
            if *count == 0 {
                ids.remove(&self.message_id);
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ReplyWaiter {
    reply_path: PathBuf,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    pending: PendingReplies,
}

impl ReplyWaiter {
    pub(crate) fn new(
        reply_path: PathBuf,
        poll_interval: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            reply_path,
            poll_interval,
            running,
            pending: PendingReplies::default(),
        }
    }

    /// Marks `message_id` as awaited. Replies addressed to ids that are not
    /// tracked are discarded by any waiter that sees them.
    pub(crate) fn track(&self, message_id: &str) -> PendingReply {
        self.pending.track(message_id)
    }

    /// Polls the reply file up to `max_attempts` times. Returns `None` on
    /// timeout or when the bridge stops running.
    pub(crate) async fn wait(&self, message_id: &str, max_attempts: u32) -> Option<String> {
        let _pending = self.track(message_id);
        let mut attempts = 0;
        let mut unusable_streak = 0;

        while attempts < max_attempts && self.running.load(Ordering::SeqCst) {
            match self.poll(message_id) {
                Ok(ReplyPoll::Ready(reply)) => {
                    info!(message_id, reply = %reply, "claude replied");
                    return Some(reply);
                }
                Ok(ReplyPoll::Unusable) => {
                    unusable_streak += 1;
                    if unusable_streak >= STALE_REPLY_POLLS {
                        self.discard_stale();
                        unusable_streak = 0;
                    }
                }
                Ok(ReplyPoll::Absent | ReplyPoll::Foreign) => {
                    unusable_streak = 0;
                }
                Err(error) => {
                    warn!(message_id, %error, "failed to check reply file");
                }
            }

            attempts += 1;
            tokio::time::sleep(self.poll_interval).await;
        }

        if self.running.load(Ordering::SeqCst) {
            info!(message_id, max_attempts, "timed out waiting for claude reply");
        } else {
            debug!(message_id, "reply wait cancelled, bridge stopping");
        }
        None
    }

    fn poll(&self, message_id: &str) -> Result<ReplyPoll, BridgeError> {
        let envelope = match read_json::<ReplyEnvelope>(&self.reply_path) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(ReplyPoll::Absent),
            Err(BridgeError::Parse { path, source }) => {
                debug!(path = %path.display(), %source, "reply file not parseable yet");
                return Ok(ReplyPoll::Unusable);
            }
            Err(error) => return Err(error),
        };

        if let Some(owner) = envelope.message_id.as_deref() {
            if owner != message_id {
                if self.pending.contains(owner) {
                    debug!(message_id, owner, "reply belongs to another message");
                    return Ok(ReplyPoll::Foreign);
                }
                if remove_if_present(&self.reply_path)? {
                    warn!(owner, "removed reply for a message nobody is waiting on");
                }
                return Ok(ReplyPoll::Absent);
            }
        }

        let Some(reply) = envelope.reply.filter(|reply| !reply.is_empty()) else {
            return Ok(ReplyPoll::Unusable);
        };

        // Whoever removes the file owns the reply.
        if remove_if_present(&self.reply_path)? {
            Ok(ReplyPoll::Ready(reply))
        } else {
            Ok(ReplyPoll::Absent)
        }
    }

    fn discard_stale(&self) {
        match remove_if_present(&self.reply_path) {
            Ok(true) => warn!(
                path = %self.reply_path.display(),
                "removed reply file that never became a valid reply"
            ),
            Ok(false) => {}
            Err(error) => warn!(%error, "failed to remove stale reply file"),
        }
    }
}

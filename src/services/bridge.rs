use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{config::BridgeConfig, store::SharedFiles};

use super::{
    limiter::RateLimited, reply::PendingReply, BridgeStats, HistoryInjector, RateLimiter,
    ReplyWaiter, StatsSnapshot,
};

pub(crate) const FALLBACK_REPLY: &str =
    "Desculpe, não consegui processar sua mensagem no momento. Tente novamente.";
pub(crate) const INJECTION_FAILED_REPLY: &str = "Erro interno do servidor. Tente novamente.";
pub(crate) const INTERNAL_ERROR_REPLY: &str = "Erro interno do servidor.";

#[derive(Debug)]
pub(crate) enum ChatOutcome {
    Replied(String),
    TimedOut,
    InjectionFailed,
    RateLimited(RateLimited),
}

impl ChatOutcome {
    pub(crate) fn into_reply(self) -> String {
        match self {
            Self::Replied(reply) => reply,
            Self::TimedOut => FALLBACK_REPLY.to_string(),
            Self::InjectionFailed => INJECTION_FAILED_REPLY.to_string(),
            Self::RateLimited(limited) => limited.message,
        }
    }
}

/// Process-wide bridge state shared by the monitor and the HTTP handlers.
pub(crate) struct Bridge {
    files: SharedFiles,
    running: Arc<AtomicBool>,
    last_processed_id: RwLock<Option<String>>,
    injector: HistoryInjector,
    waiter: ReplyWaiter,
    limiter: RateLimiter,
    stats: BridgeStats,
    reply_max_attempts: u32,
}

impl Bridge {
    pub(crate) fn new(config: &BridgeConfig) -> Self {
        let files = SharedFiles {
            inbound: config.inbound_path.clone(),
            reply: config.reply_path.clone(),
            claude_config: config.claude_config_path.clone(),
        };
        let running = Arc::new(AtomicBool::new(true));

        Self {
            injector: HistoryInjector::new(
                files.clone(),
                config.project_key.clone(),
                config.history_limit,
            ),
            waiter: ReplyWaiter::new(
                files.reply.clone(),
                config.reply_poll_interval,
                running.clone(),
            ),
            limiter: RateLimiter::new(config.rate_limit.clone()),
            stats: BridgeStats::default(),
            last_processed_id: RwLock::new(None),
            reply_max_attempts: config.reply_max_attempts,
            files,
            running,
        }
    }

    pub(crate) fn files(&self) -> &SharedFiles {
        &self.files
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clears the running flag; the monitor and pending waits exit on their
    /// next iteration.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn last_processed_id(&self) -> Option<String> {
        self.last_processed_id.read().await.clone()
    }

    pub(crate) async fn is_last_processed(&self, message_id: &str) -> bool {
        self.last_processed_id.read().await.as_deref() == Some(message_id)
    }

    pub(crate) async fn mark_processed(&self, message_id: &str) {
        *self.last_processed_id.write().await = Some(message_id.to_string());
    }

    pub(crate) fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Injects on a blocking thread. Failures are logged and reported as
    /// `false`; callers fall back rather than propagate.
    pub(crate) async fn inject(&self, sender_id: &str, message: &str, message_id: &str) -> bool {
        let injector = self.injector.clone();
        let (sender, text, id) = (
            sender_id.to_string(),
            message.to_string(),
            message_id.to_string(),
        );

        let result =
            tokio::task::spawn_blocking(move || injector.inject(&sender, &text, &id)).await;

        let ok = match result {
            Ok(Ok(())) => true,
            Ok(Err(error)) if error.is_not_found() => {
                error!(message_id, %error, "claude config missing; has Claude Code been run here?");
                false
            }
            Ok(Err(error)) => {
                error!(message_id, %error, "failed to inject message into claude config");
                false
            }
            Err(error) => {
                error!(message_id, %error, "injection task failed");
                false
            }
        };
        self.stats.record_injection(ok);
        ok
    }

    /// Keeps `message_id` awaited while the handle lives. Take it before
    /// injecting so an early reply is never treated as an orphan.
    pub(crate) fn track_reply(&self, message_id: &str) -> PendingReply {
        self.waiter.track(message_id)
    }

    pub(crate) async fn wait_for_reply(&self, message_id: &str) -> Option<String> {
        let started_at = Instant::now();
        let reply = self.waiter.wait(message_id, self.reply_max_attempts).await;

        match &reply {
            Some(_) => self.stats.record_reply(started_at.elapsed()),
            None => self.stats.record_timeout(),
        }
        reply
    }

    /// Synchronous request path: inject, then block until Claude answers or
    /// the wait runs out.
    pub(crate) async fn handle_chat(&self, sender_id: &str, message: &str) -> ChatOutcome {
        self.stats.record_received();
        info!(sender_id, text = message, "whatsapp message received via api");

        if let Err(limited) = self.limiter.check(sender_id).await {
            self.stats.record_rate_limited();
            warn!(sender_id, reason = ?limited.reason, "message rejected by rate limiter");
            return ChatOutcome::RateLimited(limited);
        }

        let message_id = Utc::now().timestamp_millis().to_string();
        let _pending = self.track_reply(&message_id);

        if !self.inject(sender_id, message, &message_id).await {
            return ChatOutcome::InjectionFailed;
        }

        info!(message_id = %message_id, "message injected, waiting for claude");
        match self.wait_for_reply(&message_id).await {
            Some(reply) => ChatOutcome::Replied(reply),
            None => ChatOutcome::TimedOut,
        }
    }
}

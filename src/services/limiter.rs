use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RateLimitReason {
    Blocked { remaining: Duration },
    Cooldown,
    MinuteLimit,
    HourLimit,
}

#[derive(Debug, Clone)]
pub(crate) struct RateLimited {
    pub(crate) reason: RateLimitReason,
    pub(crate) message: String,
}

#[derive(Debug)]
struct SenderWindow {
    minute_started: Instant,
    minute_count: u32,
    hour_started: Instant,
    hour_count: u32,
    last_accepted: Option<Instant>,
    blocked_until: Option<Instant>,
}

impl SenderWindow {
    fn new(now: Instant) -> Self {
        Self {
            minute_started: now,
            minute_count: 0,
            hour_started: now,
            hour_count: 0,
            last_accepted: None,
            blocked_until: None,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.minute_started) >= MINUTE {
            self.minute_started = now;
            self.minute_count = 0;
        }
        if now.duration_since(self.hour_started) >= HOUR {
            self.hour_started = now;
            self.hour_count = 0;
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        let block_over = self.blocked_until.map_or(true, |until| now >= until);
        block_over && now.duration_since(self.hour_started) >= HOUR
    }
}

/// Per-sender throttle for the chat endpoint: cooldown between messages,
/// per-minute and per-hour quotas, and a one hour block once the hourly quota
/// is exceeded.
pub(crate) struct RateLimiter {
    config: RateLimitConfig,
    senders: Mutex<HashMap<String, SenderWindow>>,
}

impl RateLimiter {
    pub(crate) fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn check(&self, sender_id: &str) -> Result<(), RateLimited> {
        self.check_at(sender_id, Instant::now()).await
    }

    pub(crate) async fn check_at(&self, sender_id: &str, now: Instant) -> Result<(), RateLimited> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut senders = self.senders.lock().await;
        if senders.len() > PRUNE_THRESHOLD {
            senders.retain(|_, window| !window.is_idle(now));
        }

        let window = senders
            .entry(sender_id.to_string())
            .or_insert_with(|| SenderWindow::new(now));

        if let Some(until) = window.blocked_until {
            if now < until {
                return Err(self.deny(
                    sender_id,
                    RateLimitReason::Blocked {
                        remaining: until - now,
                    },
                ));
            }
            window.blocked_until = None;
        }

        if let Some(last) = window.last_accepted {
            if now.duration_since(last) < self.config.cooldown {
                return Err(self.deny(sender_id, RateLimitReason::Cooldown));
            }
        }

        window.roll(now);

        if self.config.max_per_minute > 0 && window.minute_count >= self.config.max_per_minute {
            return Err(self.deny(sender_id, RateLimitReason::MinuteLimit));
        }

        if self.config.max_per_hour > 0 && window.hour_count >= self.config.max_per_hour {
            window.blocked_until = Some(now + HOUR);
            warn!(sender_id, "sender blocked for exceeding the hourly limit");
            return Err(self.deny(sender_id, RateLimitReason::HourLimit));
        }

        window.minute_count += 1;
        window.hour_count += 1;
        window.last_accepted = Some(now);
        debug!(
            sender_id,
            minute_count = window.minute_count,
            hour_count = window.hour_count,
            "rate limit ok"
        );
        Ok(())
    }

    fn deny(&self, sender_id: &str, reason: RateLimitReason) -> RateLimited {
        let message = match &reason {
            RateLimitReason::Blocked { remaining } => format!(
                "Você está temporariamente bloqueado. Tente novamente em {} segundos.",
                remaining.as_secs_f64().ceil() as u64
            ),
            RateLimitReason::Cooldown => {
                "Aguarde alguns segundos antes de enviar outra mensagem.".to_string()
            }
            RateLimitReason::MinuteLimit => format!(
                "Muitas mensagens por minuto. Limite: {}/min",
                self.config.max_per_minute
            ),
            RateLimitReason::HourLimit => format!(
                "Limite horário excedido. Limite: {}/hora",
                self.config.max_per_hour
            ),
        };
        debug!(sender_id, ?reason, "rate limit hit");
        RateLimited { reason, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_per_minute: u32, max_per_hour: u32, cooldown_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            max_per_minute,
            max_per_hour,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[tokio::test]
    async fn enforces_cooldown_between_messages() {
        let limiter = limiter(10, 100, 5_000);
        let start = Instant::now();

        assert!(limiter.check_at("a", start).await.is_ok());
        let denied = limiter
            .check_at("a", start + Duration::from_secs(1))
            .await
            .expect_err("cooldown");
        assert_eq!(denied.reason, RateLimitReason::Cooldown);
        assert!(limiter.check_at("a", start + Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn senders_are_tracked_independently() {
        let limiter = limiter(10, 100, 5_000);
        let now = Instant::now();

        assert!(limiter.check_at("a", now).await.is_ok());
        assert!(limiter.check_at("b", now).await.is_ok());
    }

    #[tokio::test]
    async fn enforces_minute_limit_and_resets_next_minute() {
        let limiter = limiter(2, 100, 0);
        let start = Instant::now();

        assert!(limiter.check_at("a", start).await.is_ok());
        assert!(limiter.check_at("a", start + Duration::from_secs(1)).await.is_ok());
        let denied = limiter
            .check_at("a", start + Duration::from_secs(2))
            .await
            .expect_err("minute limit");
        assert_eq!(denied.reason, RateLimitReason::MinuteLimit);
        assert!(denied.message.contains("2/min"));

        assert!(limiter.check_at("a", start + Duration::from_secs(61)).await.is_ok());
    }

    #[tokio::test]
    async fn blocks_sender_for_an_hour_after_hourly_limit() {
        let limiter = limiter(0, 2, 0);
        let start = Instant::now();

        assert!(limiter.check_at("a", start).await.is_ok());
        assert!(limiter.check_at("a", start + Duration::from_secs(1)).await.is_ok());
        let denied = limiter
            .check_at("a", start + Duration::from_secs(2))
            .await
            .expect_err("hour limit");
        assert_eq!(denied.reason, RateLimitReason::HourLimit);

        let blocked = limiter
            .check_at("a", start + Duration::from_secs(30 * 60))
            .await
            .expect_err("still blocked");
        assert!(matches!(blocked.reason, RateLimitReason::Blocked { .. }));
        assert!(blocked.message.contains("bloqueado"));

        assert!(limiter
            .check_at("a", start + Duration::from_secs(2) + HOUR)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_per_minute: 1,
            max_per_hour: 1,
            cooldown: Duration::from_secs(60),
        });
        let now = Instant::now();

        for _ in 0..5 {
            assert!(limiter.check_at("a", now).await.is_ok());
        }
    }
}

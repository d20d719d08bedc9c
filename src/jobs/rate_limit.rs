//! Upstream request throttle: a sliding-window token bucket combined with a
//! concurrency gate and adaptive backoff.
//!
//! `acquire` blocks until the 60-second grant window has room, fewer than
//! `max_concurrent` tokens are outstanding, and the adaptive pacing delay has
//! elapsed. Releasing with an upstream rate-limit verdict grows the delay by
//! `backoff_multiplier` (capped at `max_delay_ms`); clean releases decay it
//! back toward `min_delay_ms`. Configuration updates apply to the next
//! acquire.

use super::CancelSignal;
use crate::core::RateLimitConfig;
use log::debug;
use std::collections::VecDeque;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);
/// Floor for multiplicative backoff growth when the configured minimum delay
/// is zero.
const BACKOFF_SEED_MS: u64 = 1;

/// Proof of admission; must be handed back through [`RateLimiter::release`].
#[derive(Debug)]
pub struct RateLimitToken {
    acquired_at: Instant,
}

impl RateLimitToken {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

#[derive(Debug)]
pub enum Acquired {
    Token(RateLimitToken),
    /// The cancellation signal fired while waiting; no window capacity was
    /// consumed.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Ok,
    RateLimitedByUpstream,
}

struct LimiterState {
    grants: VecDeque<Instant>,
    outstanding: u32,
    current_delay: Duration,
    next_allowed: Instant,
}

pub struct RateLimiter {
    config: RwLock<RateLimitConfig>,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let current_delay = Duration::from_millis(config.min_delay_ms);
        Self {
            config: RwLock::new(config),
            state: Mutex::new(LimiterState {
                grants: VecDeque::new(),
                outstanding: 0,
                current_delay,
                next_allowed: Instant::now(),
            }),
            released: Notify::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        *self.config.read().unwrap()
    }

    /// Swap the configuration; in effect from the next `acquire`.
    pub fn update_config(&self, config: RateLimitConfig) {
        *self.config.write().unwrap() = config;
    }

    pub async fn current_delay_ms(&self) -> u64 {
        self.state.lock().await.current_delay.as_millis() as u64
    }

    pub async fn acquire(&self, cancel: &CancelSignal) -> Acquired {
        loop {
            if cancel.is_cancelled() {
                return Acquired::Cancelled;
            }
            let config = self.config();
            let min_delay = Duration::from_millis(config.min_delay_ms);
            let max_delay = Duration::from_millis(config.max_delay_ms);

            // Either grab a token now, or compute what to wait for.
            let wait_until = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                while let Some(&front) = state.grants.front() {
                    if now.duration_since(front) >= WINDOW {
                        state.grants.pop_front();
                    } else {
                        break;
                    }
                }
                state.current_delay = state.current_delay.clamp(min_delay, max_delay);

                if state.outstanding >= config.max_concurrent {
                    None
                } else if state.grants.len() >= config.max_requests_per_minute as usize {
                    Some(*state.grants.front().unwrap() + WINDOW)
                } else if now < state.next_allowed {
                    Some(state.next_allowed)
                } else {
                    state.grants.push_back(now);
                    state.outstanding += 1;
                    state.next_allowed = now + state.current_delay;
                    return Acquired::Token(RateLimitToken { acquired_at: now });
                }
            };

            match wait_until {
                Some(deadline) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Acquired::Cancelled,
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Acquired::Cancelled,
                        _ = self.released.notified() => {}
                    }
                }
            }
        }
    }

    pub async fn release(&self, token: RateLimitToken, outcome: ReleaseOutcome) {
        let config = self.config();
        let min_delay = Duration::from_millis(config.min_delay_ms);
        let max_delay = Duration::from_millis(config.max_delay_ms);

        let mut state = self.state.lock().await;
        state.outstanding = state.outstanding.saturating_sub(1);
        match outcome {
            ReleaseOutcome::Ok => {
                let decayed = Duration::from_secs_f64(
                    state.current_delay.as_secs_f64() / config.backoff_multiplier,
                );
                state.current_delay = decayed.max(min_delay);
            }
            ReleaseOutcome::RateLimitedByUpstream => {
                // A zero delay cannot grow multiplicatively; seed the backoff.
                let base = state.current_delay.max(Duration::from_millis(BACKOFF_SEED_MS));
                let grown = Duration::from_secs_f64(base.as_secs_f64() * config.backoff_multiplier);
                state.current_delay = grown.min(max_delay);
                state.next_allowed = Instant::now() + state.current_delay;
                debug!(
                    "upstream rate limit hit after {:?}; delay now {:?}",
                    token.acquired_at.elapsed(),
                    state.current_delay
                );
            }
        }
        drop(state);
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cancellation_pair;
    use std::sync::Arc;

    fn config(max_per_minute: u32, max_concurrent: u32) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_minute: max_per_minute,
            max_concurrent,
            min_delay_ms: 0,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    async fn must_acquire(limiter: &RateLimiter) -> RateLimitToken {
        match limiter.acquire(&CancelSignal::never()).await {
            Acquired::Token(token) => token,
            Acquired::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_caps_grants_per_minute() {
        let limiter = RateLimiter::new(config(3, 10));
        for _ in 0..3 {
            let token = must_acquire(&limiter).await;
            limiter.release(token, ReleaseOutcome::Ok).await;
        }

        // Fourth grant must wait for the window to slide.
        let before = Instant::now();
        let token = must_acquire(&limiter).await;
        assert!(before.elapsed() >= Duration::from_secs(59));
        limiter.release(token, ReleaseOutcome::Ok).await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_gate_blocks_until_release() {
        let limiter = Arc::new(RateLimiter::new(config(100, 1)));
        let held = must_acquire(&limiter).await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let token = must_acquire(&limiter).await;
                limiter.release(token, ReleaseOutcome::Ok).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        limiter.release(held, ReleaseOutcome::Ok).await;
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_decays() {
        let mut cfg = config(100, 10);
        cfg.min_delay_ms = 100;
        let limiter = RateLimiter::new(cfg);

        let token = must_acquire(&limiter).await;
        limiter
            .release(token, ReleaseOutcome::RateLimitedByUpstream)
            .await;
        assert_eq!(limiter.current_delay_ms().await, 200);

        let token = must_acquire(&limiter).await;
        limiter
            .release(token, ReleaseOutcome::RateLimitedByUpstream)
            .await;
        assert_eq!(limiter.current_delay_ms().await, 400);

        let token = must_acquire(&limiter).await;
        limiter.release(token, ReleaseOutcome::Ok).await;
        assert_eq!(limiter.current_delay_ms().await, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_respects_max_delay() {
        let mut cfg = config(100, 10);
        cfg.min_delay_ms = 100;
        cfg.max_delay_ms = 300;
        let limiter = RateLimiter::new(cfg);

        for _ in 0..4 {
            let token = must_acquire(&limiter).await;
            limiter
                .release(token, ReleaseOutcome::RateLimitedByUpstream)
                .await;
        }
        assert_eq!(limiter.current_delay_ms().await, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquire_leaks_nothing() {
        let limiter = Arc::new(RateLimiter::new(config(100, 1)));
        let held = must_acquire(&limiter).await;

        let (handle, signal) = cancellation_pair();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&signal).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert!(matches!(waiter.await.unwrap(), Acquired::Cancelled));

        // The slot freed by the real holder is still the only one in use.
        limiter.release(held, ReleaseOutcome::Ok).await;
        let token = must_acquire(&limiter).await;
        limiter.release(token, ReleaseOutcome::Ok).await;
    }

    #[tokio::test(start_paused = true)]
    async fn config_update_applies_to_next_acquire() {
        let limiter = RateLimiter::new(config(1, 10));
        let token = must_acquire(&limiter).await;
        limiter.release(token, ReleaseOutcome::Ok).await;

        // Window is exhausted under the old config; raising the ceiling
        // unblocks the next acquire without waiting a minute.
        limiter.update_config(config(10, 10));
        let before = Instant::now();
        let token = must_acquire(&limiter).await;
        assert!(before.elapsed() < Duration::from_secs(1));
        limiter.release(token, ReleaseOutcome::Ok).await;
    }
}

//! Hook Bus
//!
//! Sequential fan-out of lifecycle events to named subscribers. Each
//! delivery is retried with exponential backoff; a failure that survives
//! every retry is recorded as a dead letter and counts once against the
//! subscriber. Enough consecutive failures disable the subscriber until a
//! cooldown has passed, which is checked lazily when the next event arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Events the bus can carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    #[serde(rename_all = "camelCase")]
    SessionEnded { session_id: String },
    #[serde(rename_all = "camelCase")]
    ObservationSaved {
        observation_id: String,
        session_id: String,
    },
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::SessionEnded { .. } => "session_ended",
            HookEvent::ObservationSaved { .. } => "observation_saved",
        }
    }
}

/// Boxed future returned by a handler
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Type-erased subscriber callback
pub type HookHandler = Arc<dyn Fn(HookEvent) -> HookFuture + Send + Sync>;

/// Retry and circuit-breaker policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookBusConfig {
    /// Extra attempts after the first failure
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_base * 2^n`
    pub backoff_base: Duration,
    /// Consecutive exhausted failures that disable a subscriber
    pub failure_threshold: u32,
    /// How long a disabled subscriber stays disabled
    pub cooldown: chrono::Duration,
    /// Dead letters kept; the oldest are dropped first
    pub dead_letter_cap: usize,
}

impl Default for HookBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            failure_threshold: 3,
            cooldown: chrono::Duration::minutes(5),
            dead_letter_cap: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubscriberState {
    Active,
    Disabled { since: DateTime<Utc> },
}

/// True once `cooldown` has passed since `since`
pub fn cooldown_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, cooldown: chrono::Duration) -> bool {
    now - since >= cooldown
}

/// Delay before retry `attempt` (0-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// A delivery that failed after every retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub subscriber: String,
    pub event: HookEvent,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStatus {
    pub name: String,
    pub state: SubscriberState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub dead_letters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookBusStatus {
    pub subscribers: Vec<SubscriberStatus>,
    pub dead_letter_count: usize,
}

/// What one `emit` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitReport {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    /// Disabled subscribers still cooling down
    pub skipped: Vec<String>,
}

struct Subscriber {
    name: String,
    handler: HookHandler,
    state: SubscriberState,
    consecutive_failures: u32,
    last_error: Option<String>,
}

/// Event bus with per-subscriber retry, dead letters and circuit breaking
pub struct HookBus {
    config: HookBusConfig,
    subscribers: Vec<Subscriber>,
    dead_letters: VecDeque<DeadLetter>,
}

impl HookBus {
    pub fn new(config: HookBusConfig) -> Self {
        Self {
            config,
            subscribers: Vec::new(),
            dead_letters: VecDeque::new(),
        }
    }

    /// Add a subscriber. Registering an existing name replaces its handler
    /// and clears its failure state.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = name.into();
        let handler: HookHandler =
            Arc::new(move |event: HookEvent| -> HookFuture { Box::pin(handler(event)) });

        if let Some(existing) = self.subscribers.iter_mut().find(|s| s.name == name) {
            existing.handler = handler;
            existing.state = SubscriberState::Active;
            existing.consecutive_failures = 0;
            existing.last_error = None;
            tracing::debug!("Re-registered hook subscriber {}", name);
            return;
        }

        tracing::debug!("Registered hook subscriber {}", name);
        self.subscribers.push(Subscriber {
            name,
            handler,
            state: SubscriberState::Active,
            consecutive_failures: 0,
            last_error: None,
        });
    }

    /// Remove a subscriber; false if no such name
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.name != name);
        self.subscribers.len() != before
    }

    /// Deliver `event` to every subscriber that is not cooling down.
    pub async fn emit(&mut self, event: HookEvent) -> EmitReport {
        self.emit_at(event, Utc::now()).await
    }

    /// [`emit`](Self::emit) with an explicit clock for cooldown checks and
    /// failure timestamps.
    pub async fn emit_at(&mut self, event: HookEvent, now: DateTime<Utc>) -> EmitReport {
        let mut report = EmitReport::default();

        for idx in 0..self.subscribers.len() {
            if let SubscriberState::Disabled { since } = self.subscribers[idx].state {
                if !cooldown_elapsed(since, now, self.config.cooldown) {
                    report.skipped.push(self.subscribers[idx].name.clone());
                    continue;
                }
                let subscriber = &mut self.subscribers[idx];
                subscriber.state = SubscriberState::Active;
                subscriber.consecutive_failures = 0;
                tracing::info!("Hook subscriber {} re-enabled after cooldown", subscriber.name);
            }

            let handler = Arc::clone(&self.subscribers[idx].handler);
            let outcome = self.deliver(&handler, &event, &self.subscribers[idx].name).await;

            let subscriber = &mut self.subscribers[idx];
            match outcome {
                Ok(()) => {
                    subscriber.consecutive_failures = 0;
                    report.delivered.push(subscriber.name.clone());
                }
                Err(error) => {
                    subscriber.consecutive_failures += 1;
                    subscriber.last_error = Some(error.clone());
                    report.failed.push(subscriber.name.clone());

                    if subscriber.consecutive_failures >= self.config.failure_threshold {
                        subscriber.state = SubscriberState::Disabled { since: now };
                        tracing::error!(
                            "Hook subscriber {} disabled after {} consecutive failures",
                            subscriber.name,
                            subscriber.consecutive_failures
                        );
                    }

                    let letter = DeadLetter {
                        subscriber: subscriber.name.clone(),
                        event: event.clone(),
                        error,
                        attempts: self.config.max_retries + 1,
                        failed_at: now,
                    };
                    self.push_dead_letter(letter);
                }
            }
        }

        report
    }

    async fn deliver(&self, handler: &HookHandler, event: &HookEvent, name: &str) -> Result<(), String> {
        let mut attempt = 0;
        loop {
            match handler(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.backoff_base, attempt);
                    tracing::warn!(
                        "Hook {} failed for {} (attempt {}): {}; retrying in {:?}",
                        event.name(),
                        name,
                        attempt + 1,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        "Hook {} failed for {} after {} attempts: {}",
                        event.name(),
                        name,
                        attempt + 1,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }

    fn push_dead_letter(&mut self, letter: DeadLetter) {
        if self.config.dead_letter_cap == 0 {
            return;
        }
        while self.dead_letters.len() >= self.config.dead_letter_cap {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back(letter);
    }

    /// Oldest first
    pub fn dead_letters(&self) -> impl Iterator<Item = &DeadLetter> {
        self.dead_letters.iter()
    }

    pub fn status(&self) -> HookBusStatus {
        HookBusStatus {
            subscribers: self
                .subscribers
                .iter()
                .map(|s| SubscriberStatus {
                    name: s.name.clone(),
                    state: s.state,
                    consecutive_failures: s.consecutive_failures,
                    last_error: s.last_error.clone(),
                    dead_letters: self
                        .dead_letters
                        .iter()
                        .filter(|d| d.subscriber == s.name)
                        .count(),
                })
                .collect(),
            dead_letter_count: self.dead_letters.len(),
        }
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(HookBusConfig::default())
    }
}

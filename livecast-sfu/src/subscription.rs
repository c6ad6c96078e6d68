//! Viewer-side re-subscription
//!
//! When the broadcaster switches source, viewers receive `newProducer` and must
//! swap their consumer for one on the new producer. [`Resubscriber`] tracks one
//! media kind for one viewer and tells its driver what to do next. It keeps at
//! most one consume in flight, folds notifications that arrive meanwhile into
//! a single follow-up, and gives up after the retry budget instead of looping.

use std::time::Duration;

use crate::error::SfuError;
use crate::types::ConsumerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not subscribed
    Idle,
    Consuming(ConsumerId),
    /// The consumed producer was replaced; a reconsume is due
    Stale,
    /// A consume request is in flight (attempt number, starting at 1)
    Reconsuming(u32),
    /// No producer of this kind; waiting for `newProducer`
    Waiting,
    /// Retries exhausted; only a new producer restarts the subscription
    Failed,
}

/// What the driver should do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Issue a `consume` now
    Consume,
    /// Issue a `consume` after the delay
    RetryAfter(Duration),
    /// A consume is already in flight; the notification was folded into it
    Coalesced,
    Nothing,
}

/// Bounded retries with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug)]
pub struct Resubscriber {
    state: SubscriptionState,
    policy: RetryPolicy,
    /// A producer change arrived while a consume was in flight
    pending: bool,
}

impl Resubscriber {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            state: SubscriptionState::Idle,
            policy,
            pending: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &SubscriptionState {
        &self.state
    }

    fn begin(&mut self) -> Action {
        self.pending = false;
        self.state = SubscriptionState::Reconsuming(1);
        Action::Consume
    }

    /// The viewer wants this kind
    pub fn start(&mut self) -> Action {
        match self.state {
            SubscriptionState::Idle | SubscriptionState::Waiting | SubscriptionState::Failed => {
                self.begin()
            }
            SubscriptionState::Reconsuming(_) => {
                self.pending = true;
                Action::Coalesced
            }
            SubscriptionState::Consuming(_) | SubscriptionState::Stale => Action::Nothing,
        }
    }

    /// `newProducer` for this kind arrived
    pub fn on_producer_changed(&mut self) -> Action {
        match self.state {
            SubscriptionState::Idle => Action::Nothing,
            SubscriptionState::Consuming(_) => {
                self.state = SubscriptionState::Stale;
                self.begin()
            }
            SubscriptionState::Reconsuming(_) => {
                self.pending = true;
                Action::Coalesced
            }
            SubscriptionState::Stale | SubscriptionState::Waiting | SubscriptionState::Failed => {
                self.begin()
            }
        }
    }

    /// `producerClosed` for this kind arrived
    pub fn on_producer_closed(&mut self) -> Action {
        match self.state {
            SubscriptionState::Idle | SubscriptionState::Failed => {}
            // The in-flight request settles the state
            SubscriptionState::Reconsuming(_) => self.pending = false,
            _ => self.state = SubscriptionState::Waiting,
        }
        Action::Nothing
    }

    /// The in-flight consume succeeded
    pub fn on_consumed(&mut self, consumer: ConsumerId) -> Action {
        if !matches!(self.state, SubscriptionState::Reconsuming(_)) {
            return Action::Nothing;
        }
        if self.pending {
            // A newer producer took over while this consume was in flight
            return self.begin();
        }
        self.state = SubscriptionState::Consuming(consumer);
        Action::Nothing
    }

    /// The in-flight consume failed
    pub fn on_consume_failed(&mut self, error: &SfuError) -> Action {
        let SubscriptionState::Reconsuming(attempt) = self.state else {
            return Action::Nothing;
        };

        if matches!(error, SfuError::NoProducer(_)) {
            if self.pending {
                return self.begin();
            }
            self.state = SubscriptionState::Waiting;
            return Action::Nothing;
        }
        if matches!(error, SfuError::IncompatibleCapabilities) || attempt >= self.policy.max_attempts {
            self.pending = false;
            self.state = SubscriptionState::Failed;
            return Action::Nothing;
        }

        // The retry consumes whatever producer is current, which covers a pending change
        self.pending = false;
        self.state = SubscriptionState::Reconsuming(attempt + 1);
        Action::RetryAfter(self.policy.delay(attempt - 1))
    }

    /// The viewer no longer wants this kind
    pub fn stop(&mut self) {
        self.pending = false;
        self.state = SubscriptionState::Idle;
    }
}

impl Default for Resubscriber {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

//! Declarative error policies.
//!
//! A policy decides what happens to a failing envelope or sequence: retry
//! it, skip it, move it to another endpoint, or stop the consumer. Policies
//! are configured per endpoint and *declared* here; the engine that applies
//! them lives in the runtime crate.
//!
//! A policy is a chain of steps. When an envelope fails, the chain is walked
//! in order; the first step whose predicates accept the error, and whose
//! attempt budget is not exhausted, is applied. When no step can handle the
//! failure, the consumer stops.
//!
//! # Example
//!
//! ```
//! use silverback_core::policy::ErrorPolicy;
//! use std::time::Duration;
//!
//! // Retry three times with backoff, then route to a dead-letter endpoint.
//! let policy = ErrorPolicy::retry(3)
//!     .with_initial_delay(Duration::from_millis(100))
//!     .then_move_to("orders-dlq");
//!
//! // The common retry-then-give-up shape.
//! let policy = ErrorPolicy::retry(5).then_skip();
//! ```

use crate::error::{ConsumeError, ConsumeErrorKind};
use crate::headers::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Custom predicate over the failing envelope's headers and the error.
pub type ErrorPredicate = Arc<dyn Fn(&HeaderMap, &ConsumeError) -> bool + Send + Sync>;

/// Header/payload rewrite applied by a move step before producing to the
/// target endpoint.
pub type MoveTransform = Arc<dyn Fn(&mut HeaderMap, &mut Option<Vec<u8>>) + Send + Sync>;

/// What a policy step does when it handles a failure.
#[derive(Clone)]
pub enum PolicyAction {
    /// Re-run the pipeline for the same envelope or sequence, with
    /// exponential backoff between attempts.
    Retry {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Cap for the exponential backoff.
        max_delay: Duration,
        /// Backoff multiplier (2.0 doubles the delay each attempt).
        multiplier: f64,
    },
    /// Drop the envelope or sequence and commit its offsets.
    Skip,
    /// Produce the envelope to another endpoint (typically a dead-letter
    /// topic), then commit the source offsets.
    Move {
        /// Endpoint or friendly name of the target producer.
        target: String,
        /// Optional header/payload rewrite before producing.
        transform: Option<MoveTransform>,
    },
    /// Abort the consumer and leave offsets uncommitted.
    Stop,
}

impl fmt::Debug for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry {
                initial_delay,
                max_delay,
                multiplier,
            } => f
                .debug_struct("Retry")
                .field("initial_delay", initial_delay)
                .field("max_delay", max_delay)
                .field("multiplier", multiplier)
                .finish(),
            Self::Skip => f.write_str("Skip"),
            Self::Move { target, .. } => f.debug_struct("Move").field("target", target).finish(),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

/// One step in a policy chain: an action plus the conditions under which it
/// handles a failure.
#[derive(Clone)]
pub struct PolicyStep {
    action: PolicyAction,
    /// Attempts this step still handles; `None` means unbounded. For a
    /// retry step, `Some(n)` allows `n` re-runs after the first failure.
    max_failed_attempts: Option<u32>,
    include: Vec<ConsumeErrorKind>,
    exclude: Vec<ConsumeErrorKind>,
    predicate: Option<ErrorPredicate>,
}

impl fmt::Debug for PolicyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStep")
            .field("action", &self.action)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl PolicyStep {
    fn new(action: PolicyAction, max_failed_attempts: Option<u32>) -> Self {
        Self {
            action,
            max_failed_attempts,
            include: Vec::new(),
            exclude: Vec::new(),
            predicate: None,
        }
    }

    /// The action this step performs.
    #[must_use]
    pub const fn action(&self) -> &PolicyAction {
        &self.action
    }

    /// Whether this step handles the given failure.
    ///
    /// `failed_attempts` is the number of failures so far for the envelope,
    /// including the current one (so the first failure arrives as `1`).
    #[must_use]
    pub fn can_handle(
        &self,
        headers: &HeaderMap,
        error: &ConsumeError,
        failed_attempts: u32,
    ) -> bool {
        if let Some(max) = self.max_failed_attempts {
            if failed_attempts > max {
                return false;
            }
        }
        if !self.include.is_empty() && !self.include.contains(&error.kind()) {
            return false;
        }
        if self.exclude.contains(&error.kind()) {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(headers, error) {
                return false;
            }
        }
        true
    }

    /// Backoff delay before re-running attempt number `failed_attempts`.
    ///
    /// Returns zero for non-retry actions.
    #[must_use]
    pub fn backoff_for_attempt(&self, failed_attempts: u32) -> Duration {
        let PolicyAction::Retry {
            initial_delay,
            max_delay,
            multiplier,
        } = &self.action
        else {
            return Duration::ZERO;
        };
        let exponent = failed_attempts.saturating_sub(1).min(32);
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_possible_wrap
        )]
        let delay_ms = (initial_delay.as_millis() as f64 * multiplier.powi(exponent as i32)) as u64;
        Duration::from_millis(delay_ms).min(*max_delay)
    }
}

/// A per-endpoint error policy: an ordered chain of [`PolicyStep`]s.
///
/// The default policy has no steps, so every failure stops the consumer.
#[derive(Clone, Debug, Default)]
pub struct ErrorPolicy {
    steps: Vec<PolicyStep>,
}

impl ErrorPolicy {
    /// The stop-on-first-failure policy.
    #[must_use]
    pub const fn stop() -> Self {
        Self { steps: Vec::new() }
    }

    /// Skip every failing envelope, committing its offsets.
    #[must_use]
    pub fn skip() -> Self {
        Self {
            steps: vec![PolicyStep::new(PolicyAction::Skip, None)],
        }
    }

    /// Retry up to `max_retries` times with default backoff (100 ms initial,
    /// doubling, capped at 30 s).
    #[must_use]
    pub fn retry(max_retries: u32) -> Self {
        Self {
            steps: vec![PolicyStep::new(
                PolicyAction::Retry {
                    initial_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(30),
                    multiplier: 2.0,
                },
                Some(max_retries),
            )],
        }
    }

    /// Move every failing envelope to `target`.
    #[must_use]
    pub fn move_to(target: impl Into<String>) -> Self {
        Self {
            steps: vec![PolicyStep::new(
                PolicyAction::Move {
                    target: target.into(),
                    transform: None,
                },
                None,
            )],
        }
    }

    /// Chain several policies; their steps are applied in order.
    #[must_use]
    pub fn chain(policies: impl IntoIterator<Item = Self>) -> Self {
        Self {
            steps: policies.into_iter().flat_map(|p| p.steps).collect(),
        }
    }

    /// Append a skip step: once earlier steps stop handling, skip.
    #[must_use]
    pub fn then_skip(mut self) -> Self {
        self.steps.push(PolicyStep::new(PolicyAction::Skip, None));
        self
    }

    /// Append a move step: once earlier steps stop handling, move to
    /// `target`.
    #[must_use]
    pub fn then_move_to(mut self, target: impl Into<String>) -> Self {
        self.steps.push(PolicyStep::new(
            PolicyAction::Move {
                target: target.into(),
                transform: None,
            },
            None,
        ));
        self
    }

    /// Set the initial backoff delay on the last retry step.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        if let Some(PolicyStep {
            action: PolicyAction::Retry { initial_delay, .. },
            ..
        }) = self.steps.last_mut()
        {
            *initial_delay = delay;
        }
        self
    }

    /// Set the backoff cap on the last retry step.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        if let Some(PolicyStep {
            action: PolicyAction::Retry { max_delay, .. },
            ..
        }) = self.steps.last_mut()
        {
            *max_delay = delay;
        }
        self
    }

    /// Set the transform on the last move step.
    #[must_use]
    pub fn with_transform(mut self, transform: MoveTransform) -> Self {
        if let Some(PolicyStep {
            action: PolicyAction::Move { transform: slot, .. },
            ..
        }) = self.steps.last_mut()
        {
            *slot = Some(transform);
        }
        self
    }

    /// Restrict the last step to the given error kinds.
    #[must_use]
    pub fn apply_to(mut self, kinds: impl IntoIterator<Item = ConsumeErrorKind>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.include.extend(kinds);
        }
        self
    }

    /// Exempt the given error kinds from the last step.
    #[must_use]
    pub fn exclude(mut self, kinds: impl IntoIterator<Item = ConsumeErrorKind>) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.exclude.extend(kinds);
        }
        self
    }

    /// Attach a custom predicate to the last step.
    #[must_use]
    pub fn when(mut self, predicate: ErrorPredicate) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.predicate = Some(predicate);
        }
        self
    }

    /// Select the first step that handles the given failure.
    #[must_use]
    pub fn select(
        &self,
        headers: &HeaderMap,
        error: &ConsumeError,
        failed_attempts: u32,
    ) -> Option<&PolicyStep> {
        self.steps
            .iter()
            .find(|step| step.can_handle(headers, error, failed_attempts))
    }

    /// The configured steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[PolicyStep] {
        &self.steps
    }
}

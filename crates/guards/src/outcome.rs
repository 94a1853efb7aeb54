//! Uniform success/failure value passed between the caller and the guards
//!
//! Every guard in the chain consumes and/or produces an [`Outcome`]: a tagged
//! value holding either the success payload of the protected call or the
//! failure cause that ended it. Guards never inspect the payload; they only
//! classify the cause, which keeps the guard core decoupled from any specific
//! error-type hierarchy.
//!
//! Classification is expressed with [`CauseMatcher`]: an ordered list of
//! predicates over the failure cause, evaluated in insertion order with the
//! first match winning. Policies configure matchers for their `skip_on` /
//! `fail_on` / `retry_on` / `abort_on` / `apply_on` sets.

use std::fmt;
use std::sync::Arc;

/// Shared failure cause carried by a failed [`Outcome`].
///
/// The cause is reference-counted so that a single failure can be observed by
/// every guard in the chain (circuit breaker classification, retry
/// classification, fallback eligibility) without cloning the underlying error.
pub type FailureCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result of one attempt of a protected call.
///
/// Immutable once constructed: a new `Outcome` is created per call attempt and
/// consumed by each guard in the chain.
pub enum Outcome<T> {
    /// The protected call completed and produced a value.
    Success(T),
    /// The protected call failed with the given cause.
    Failure(FailureCause),
}

impl<T> Outcome<T> {
    /// Wrap a success payload.
    pub fn success(value: T) -> Self {
        Outcome::Success(value)
    }

    /// Wrap a failure cause.
    pub fn failure<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Outcome::Failure(Arc::new(cause))
    }

    /// Wrap an already-shared failure cause.
    ///
    /// Used when a cause observed by one guard is re-reported through another
    /// (e.g. a fallback handler failing with the original cause).
    pub fn failure_from(cause: FailureCause) -> Self {
        Outcome::Failure(cause)
    }

    /// Whether this outcome is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The success payload, valid iff this outcome is a success.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// Consume the outcome and return the success payload, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    /// The failure cause, valid iff this outcome is a failure.
    pub fn cause(&self) -> Option<&FailureCause> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(cause) => Some(cause),
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::failure(error),
        }
    }
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(value) => Outcome::Success(value.clone()),
            Outcome::Failure(cause) => Outcome::Failure(Arc::clone(cause)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(value) => f.debug_tuple("Success").field(value).finish(),
            Outcome::Failure(cause) => f.debug_tuple("Failure").field(cause).finish(),
        }
    }
}

/// Predicate over a failure cause.
pub type CausePredicate = Arc<dyn Fn(&FailureCause) -> bool + Send + Sync>;

/// Ordered set of cause-matching predicates.
///
/// Rules are evaluated in insertion order and the first matching rule wins.
/// Precedence *between* matchers (e.g. retry's `abort_on` beating `retry_on`)
/// is the concern of the guard that owns them.
#[derive(Clone, Default)]
pub struct CauseMatcher {
    rules: Vec<CausePredicate>,
}

impl CauseMatcher {
    /// A matcher that matches no cause.
    pub fn none() -> Self {
        Self { rules: Vec::new() }
    }

    /// A matcher that matches every cause.
    pub fn any() -> Self {
        Self::none().when(|_| true)
    }

    /// Append a predicate rule.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureCause) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Arc::new(predicate));
        self
    }

    /// Append a rule matching causes that downcast to `E`.
    ///
    /// This is the portable replacement for matching on a configured list of
    /// exception classes: the cause is an abstract error value and the rule
    /// matches its concrete type.
    pub fn on_type<E>(self) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.when(|cause| cause.downcast_ref::<E>().is_some())
    }

    /// Whether any rule matches the cause, checking rules in order.
    pub fn matches(&self, cause: &FailureCause) -> bool {
        self.rules.iter().any(|rule| rule(cause))
    }

    /// Whether this matcher has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Debug for CauseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CauseMatcher").field("rules", &self.rules.len()).finish()
    }
}

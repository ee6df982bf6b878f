// Matcher factories are usually passed straight to a watch registration.
#![allow(clippy::must_use_candidate)]

//! Argument matchers for watches.
//!
//! A watch registered with a matcher only sees calls whose arguments match:
//!
//! - [`Matcher`] trait for custom matchers
//! - Built-in matchers: [`eq`], [`anything`], [`satisfies`]
//! - Combinators: [`all_of`], [`any_of`], [`not`]
//!
//! # Example
//!
//! ```rust
//! use testkit_coro::mock::matcher::{eq, not, satisfies, Matcher};
//!
//! let m = eq(42);
//! assert!(m.matches(&42));
//!
//! let m = not(satisfies(|x: &i32| *x < 0, "is negative"));
//! assert!(m.matches(&1));
//! ```

use std::fmt::Debug;
use std::marker::PhantomData;

/// A predicate over call arguments.
///
/// Matchers are shared between the driving thread and procedure threads, so
/// they must be `Send + Sync`.
///
/// # Implementing Custom Matchers
///
/// ```rust
/// use testkit_coro::mock::matcher::Matcher;
///
/// struct IsEven;
///
/// impl Matcher<i32> for IsEven {
///     fn matches(&self, value: &i32) -> bool {
///         value % 2 == 0
///     }
///
///     fn describe(&self) -> String {
///         "is even".to_string()
///     }
/// }
///
/// assert!(IsEven.matches(&4));
/// assert!(!IsEven.matches(&3));
/// ```
pub trait Matcher<T: ?Sized>: Send + Sync {
    /// Check if the value matches.
    fn matches(&self, value: &T) -> bool;

    /// Describe what this matcher expects.
    fn describe(&self) -> String;
}

impl<T: ?Sized> Matcher<T> for Box<dyn Matcher<T>> {
    fn matches(&self, value: &T) -> bool {
        (**self).matches(value)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Create an equality matcher.
pub fn eq<T: PartialEq + Debug + Send + Sync>(expected: T) -> EqMatcher<T> {
    EqMatcher { expected }
}

/// Matcher for equality.
pub struct EqMatcher<T> {
    expected: T,
}

impl<T: PartialEq + Debug + Send + Sync> Matcher<T> for EqMatcher<T> {
    fn matches(&self, value: &T) -> bool {
        value == &self.expected
    }

    fn describe(&self) -> String {
        format!("equals {:?}", self.expected)
    }
}

/// Create a matcher that always matches.
pub fn anything<T>() -> AnythingMatcher<T> {
    AnythingMatcher {
        _phantom: PhantomData,
    }
}

/// Matcher that matches anything.
pub struct AnythingMatcher<T> {
    _phantom: PhantomData<fn(&T)>,
}

impl<T> Matcher<T> for AnythingMatcher<T> {
    fn matches(&self, _value: &T) -> bool {
        true
    }

    fn describe(&self) -> String {
        "anything".to_string()
    }
}

/// Create a predicate-based matcher.
///
/// ```rust
/// use testkit_coro::mock::matcher::{satisfies, Matcher};
///
/// let m = satisfies(|x: &i32| *x % 2 == 0, "is even");
/// assert!(m.matches(&4));
/// assert!(!m.matches(&3));
/// ```
pub fn satisfies<T, F>(predicate: F, description: &str) -> PredicateMatcher<T, F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    PredicateMatcher {
        predicate,
        description: description.to_string(),
        _phantom: PhantomData,
    }
}

/// Matcher based on a predicate function.
pub struct PredicateMatcher<T, F> {
    predicate: F,
    description: String,
    _phantom: PhantomData<fn(&T)>,
}

impl<T, F: Fn(&T) -> bool + Send + Sync> Matcher<T> for PredicateMatcher<T, F> {
    fn matches(&self, value: &T) -> bool {
        (self.predicate)(value)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Create a matcher that matches when every matcher matches.
pub fn all_of<T: 'static>(matchers: Vec<Box<dyn Matcher<T>>>) -> AllOfMatcher<T> {
    AllOfMatcher { matchers }
}

/// Matcher that requires every inner matcher to match.
pub struct AllOfMatcher<T: ?Sized> {
    matchers: Vec<Box<dyn Matcher<T>>>,
}

impl<T> Matcher<T> for AllOfMatcher<T> {
    fn matches(&self, value: &T) -> bool {
        self.matchers.iter().all(|m| m.matches(value))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.matchers.iter().map(|m| m.describe()).collect();
        format!("all of [{}]", parts.join(", "))
    }
}

/// Create a matcher that matches when any matcher matches.
pub fn any_of<T: 'static>(matchers: Vec<Box<dyn Matcher<T>>>) -> AnyOfMatcher<T> {
    AnyOfMatcher { matchers }
}

/// Matcher that requires at least one inner matcher to match.
pub struct AnyOfMatcher<T: ?Sized> {
    matchers: Vec<Box<dyn Matcher<T>>>,
}

impl<T> Matcher<T> for AnyOfMatcher<T> {
    fn matches(&self, value: &T) -> bool {
        self.matchers.iter().any(|m| m.matches(value))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.matchers.iter().map(|m| m.describe()).collect();
        format!("any of [{}]", parts.join(", "))
    }
}

/// Create a matcher that negates another.
pub fn not<T, M: Matcher<T> + 'static>(matcher: M) -> NotMatcher<T> {
    NotMatcher {
        inner: Box::new(matcher),
    }
}

/// Matcher that inverts its inner matcher.
pub struct NotMatcher<T: ?Sized> {
    inner: Box<dyn Matcher<T>>,
}

impl<T> Matcher<T> for NotMatcher<T> {
    fn matches(&self, value: &T) -> bool {
        !self.inner.matches(value)
    }

    fn describe(&self) -> String {
        format!("not ({})", self.inner.describe())
    }
}

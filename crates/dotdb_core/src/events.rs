//! Subscriptions and middleware hooks.
//!
//! Subscribers receive `(path, new_value, old_value)` after the WAL
//! append for a mutation has returned, in LSN order. Patterns use
//! literal dot-separated segments plus `*` (exactly one segment) and
//! `**` (any number of segments); wildcards are legal here and only
//! here.
//!
//! Before-hooks may rewrite the incoming value and run inside the write
//! lock; after-hooks are observational. Hooks and subscribers MUST NOT
//! call back into engine writes: the write lock is not reentrant and a
//! re-entrant write deadlocks.

use dotdb_codec::Value;
use parking_lot::RwLock;

/// Engine method a middleware hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// `set` and the set-shaped ops (`pull` lands here).
    Set,
    /// `delete`.
    Delete,
    /// `push`.
    Push,
    /// `add` / `subtract`.
    Add,
}

/// Callback invoked on matching mutations.
pub type SubscriberFn = Box<dyn Fn(&str, Option<&Value>, Option<&Value>) + Send + Sync>;

/// Before-hook: receives the incoming value and returns the (possibly
/// rewritten) value to apply.
pub type BeforeFn = Box<dyn Fn(&str, Value) -> Value + Send + Sync>;

/// After-hook: observes the applied value.
pub type AfterFn = Box<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// A compiled notification pattern.
#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<String>,
}

impl Pattern {
    fn compile(raw: &str) -> Self {
        let segments = if raw.is_empty() {
            Vec::new()
        } else {
            raw.split('.').map(str::to_owned).collect()
        };
        Self { segments }
    }

    fn matches(&self, path: &str) -> bool {
        let path_segments: Vec<&str> = if path.is_empty() {
            Vec::new()
        } else {
            path.split('.').collect()
        };
        matches_segments(&self.segments, &path_segments)
    }
}

fn matches_segments(pattern: &[String], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(first) if first == "**" => {
            (0..=path.len()).any(|skip| matches_segments(&pattern[1..], &path[skip..]))
        }
        Some(first) => {
            !path.is_empty()
                && (first == "*" || first == path[0])
                && matches_segments(&pattern[1..], &path[1..])
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: Pattern,
    callback: SubscriberFn,
}

struct BeforeHook {
    method: Method,
    pattern: Pattern,
    callback: BeforeFn,
}

struct AfterHook {
    method: Method,
    pattern: Pattern,
    callback: AfterFn,
}

/// Registry of subscriptions and middleware hooks.
#[derive(Default)]
pub struct Hooks {
    subscriptions: RwLock<Vec<Subscription>>,
    before: RwLock<Vec<BeforeHook>>,
    after: RwLock<Vec<AfterHook>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Hooks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for paths matching `pattern`.
    pub fn subscribe(&self, pattern: &str, callback: SubscriberFn) -> SubscriptionId {
        let id = SubscriptionId(
            self.next_id
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        );
        self.subscriptions.write().push(Subscription {
            id,
            pattern: Pattern::compile(pattern),
            callback,
        });
        id
    }

    /// Removes a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.write().retain(|sub| sub.id != id);
    }

    /// Registers a before-hook for `method` on `pattern`.
    pub fn before(&self, method: Method, pattern: &str, callback: BeforeFn) {
        self.before.write().push(BeforeHook {
            method,
            pattern: Pattern::compile(pattern),
            callback,
        });
    }

    /// Registers an after-hook for `method` on `pattern`.
    pub fn after(&self, method: Method, pattern: &str, callback: AfterFn) {
        self.after.write().push(AfterHook {
            method,
            pattern: Pattern::compile(pattern),
            callback,
        });
    }

    /// Runs the before-hooks for a mutation, threading the value
    /// through each matching hook in registration order.
    #[must_use]
    pub fn run_before(&self, method: Method, path: &str, mut value: Value) -> Value {
        for hook in self.before.read().iter() {
            if hook.method == method && hook.pattern.matches(path) {
                value = (hook.callback)(path, value);
            }
        }
        value
    }

    /// Runs the after-hooks for a mutation.
    pub fn run_after(&self, method: Method, path: &str, new_value: Option<&Value>) {
        for hook in self.after.read().iter() {
            if hook.method == method && hook.pattern.matches(path) {
                (hook.callback)(path, new_value);
            }
        }
    }

    /// Notifies matching subscribers of a mutation.
    pub fn notify(&self, path: &str, new_value: Option<&Value>, old_value: Option<&Value>) {
        for sub in self.subscriptions.read().iter() {
            if sub.pattern.matches(path) {
                (sub.callback)(path, new_value, old_value);
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("subscriptions", &self.subscriptions.read().len())
            .field("before", &self.before.read().len())
            .field("after", &self.after.read().len())
            .finish()
    }
}

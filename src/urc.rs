//! URC dispatcher (C3): routes unsolicited result code lines to zero or more
//! subscribers by substring match.
//!
//! Subscriptions are stored behind a `Mutex<Vec<_>>`. `deliver` clones the
//! current subscriber list before invoking any handler (copy-on-iterate), so
//! a handler that unsubscribes itself — or anything else — mid-dispatch never
//! affects the line currently being delivered, and never sees a later line.
//! Handlers run synchronously on the caller's thread (the transport reader
//! thread, in practice) and must not block on engine progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque handle returned by [`UrcDispatcher::subscribe`]; pass back to
/// [`UrcDispatcher::unsubscribe`] to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

type Handler = Box<dyn Fn(&str) + Send + Sync>;

struct Subscription {
    token: Token,
    prefix: String,
    handler: Handler,
}

/// The closed set of URC prefixes recognized on this link.
pub const URC_PREFIXES: &[&str] = &[
    "+CEREG:",
    "+CSCON:",
    "%CESQ:",
    "%SOCKETEV:",
    "%SOCKETCMD:",
    "%BOOTEV:",
    "%IGNSSEVU:",
    "%NOTIFYEV:",
    "%MEAS:",
    "%PINGCMD:",
];

/// True if `line` starts with one of the fixed URC prefixes.
#[must_use]
pub fn is_urc(line: &str) -> bool {
    URC_PREFIXES.iter().any(|p| line.starts_with(p))
}

#[derive(Default)]
pub struct UrcDispatcher {
    subs: Mutex<Vec<Arc<Subscription>>>,
    next_token: AtomicU64,
}

impl UrcDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler invoked for every URC line containing `prefix` as
    /// a substring (not a strict prefix — matches the existing "contains"
    /// semantics used e.g. to detect `+CSCON: 1` inside a longer form).
    pub fn subscribe(
        &self,
        prefix: impl Into<String>,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> Token {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            token,
            prefix: prefix.into(),
            handler: Box::new(handler),
        });
        self.subs.lock().unwrap().push(sub);
        token
    }

    /// Remove a subscription. Safe to call from within the subscription's
    /// own handler during `deliver`.
    pub fn unsubscribe(&self, token: Token) {
        self.subs.lock().unwrap().retain(|s| s.token != token);
    }

    /// Deliver a URC line to every subscription whose prefix is a substring
    /// of it. Invoked by the engine as lines are classified.
    pub fn deliver(&self, line: &str) {
        // Copy-on-iterate: snapshot the list so concurrent subscribe/unsubscribe
        // from within a handler never mutates the list we're iterating.
        let snapshot: Vec<Arc<Subscription>> = self.subs.lock().unwrap().clone();
        for sub in snapshot {
            if line.contains(sub.prefix.as_str()) {
                (sub.handler)(line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_is_urc_known_prefixes() {
        assert!(is_urc("+CEREG: 1"));
        assert!(is_urc("%SOCKETEV:1,1"));
        assert!(!is_urc("OK"));
        assert!(!is_urc("some payload"));
    }

    #[test]
    fn test_substring_match_not_strict_prefix() {
        let d = UrcDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        d.subscribe("+CSCON: 1", move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        d.deliver("+CSCON: 1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_multiple_subscribers_all_invoked() {
        let d = UrcDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            d.subscribe("+CEREG:", move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        d.deliver("+CEREG: 5");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unsubscribe_prevents_future_delivery() {
        let d = UrcDispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let token = d.subscribe("+CEREG:", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        d.deliver("+CEREG: 1");
        d.unsubscribe(token);
        d.deliver("+CEREG: 1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_unsubscribe_during_dispatch_is_safe() {
        // A handler that unsubscribes itself must not be invoked again for a
        // later URC, even one delivered immediately after.
        let d = Arc::new(UrcDispatcher::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let d2 = d.clone();
        let h2 = hits.clone();
        let token_cell: Arc<Mutex<Option<Token>>> = Arc::new(Mutex::new(None));
        let token_cell2 = token_cell.clone();
        let token = d.subscribe("+CEREG:", move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
            if let Some(t) = *token_cell2.lock().unwrap() {
                d2.unsubscribe(t);
            }
        });
        *token_cell.lock().unwrap() = Some(token);

        d.deliver("+CEREG: 1");
        d.deliver("+CEREG: 1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

//! Debounce around the "is this browser already signed in?" check that runs
//! when the login page loads. Without it the login page and the dashboard
//! can bounce a browser between each other forever.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// The in-progress flag clears itself after this long even if the check
/// never reports back.
pub const IN_FLIGHT_TIMEOUT_MS: i64 = 5_000;
/// A redirect younger than this suppresses the check.
pub const RECENT_REDIRECT_MS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    InFlight,
    RecentRedirect,
}

#[derive(Debug, Default, Clone)]
pub struct AuthGuard {
    in_flight_since: Option<i64>,
}

impl AuthGuard {
    pub fn new() -> Self {
        AuthGuard::default()
    }

    pub fn in_flight(&self, now_ms: i64) -> bool {
        self.in_flight_since
            .is_some_and(|since| now_ms - since < IN_FLIGHT_TIMEOUT_MS)
    }

    /// Decides whether the real check may run at `now_ms`. `last_redirect_ms`
    /// is the persisted timestamp of the last auth redirect, if any.
    pub fn try_begin(&mut self, now_ms: i64, last_redirect_ms: Option<i64>) -> GuardDecision {
        if self.in_flight(now_ms) {
            debug!("auth check already in progress, skipping");
            return GuardDecision::InFlight;
        }
        self.in_flight_since = Some(now_ms);

        if let Some(last) = last_redirect_ms {
            if now_ms - last < RECENT_REDIRECT_MS {
                debug!(elapsed_ms = now_ms - last, "recent redirect detected, skipping auth check");
                self.in_flight_since = None;
                return GuardDecision::RecentRedirect;
            }
        }
        GuardDecision::Proceed
    }

    /// Runs `check` if the guard allows it.
    pub fn run<T>(
        &mut self,
        now_ms: i64,
        last_redirect_ms: Option<i64>,
        check: impl FnOnce() -> T,
    ) -> Option<T> {
        match self.try_begin(now_ms, last_redirect_ms) {
            GuardDecision::Proceed => Some(check()),
            GuardDecision::InFlight | GuardDecision::RecentRedirect => None,
        }
    }
}

/// One guard per browser, keyed by the client id cookie.
#[derive(Debug, Default)]
pub struct GuardRegistry {
    guards: Mutex<HashMap<String, AuthGuard>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        GuardRegistry::default()
    }

    pub fn try_begin(&self, client: &str, now_ms: i64, last_redirect_ms: Option<i64>) -> GuardDecision {
        let mut guards = match self.guards.lock() {
            Ok(guards) => guards,
            Err(poisoned) => poisoned.into_inner(),
        };
        guards.retain(|_, guard| guard.in_flight(now_ms));
        guards
            .entry(client.to_string())
            .or_default()
            .try_begin(now_ms, last_redirect_ms)
    }
}

//! Per-account rolling-window rate limit for distribution queries.
//!
//! The authority blocks an identity that exceeds its hourly query ceiling, so
//! every query is admitted here first.
//!
//! # Invariants
//! - An account never has more than `limit` admitted queries inside any
//!   trailing `window`.
//! - A suspended account admits nothing until its cool-down deadline passes,
//!   regardless of how empty its window is.
//! - Each account's window sits behind its own lock: two workers touching the
//!   same account are serialized; different accounts never contend.

mod clock;

pub use clock::{Clock, SystemClock};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dfe_schemas::{AccountId, QuotaWindowSnapshot};

/// Upper bound for any configured span; keeps chrono arithmetic in range.
const MAX_SPAN_SECS: u64 = 365 * 24 * 3600;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Window shape. Defaults match the authority's observed enforcement:
/// 20 queries per 3600 s, with a 3900 s cool-down after a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    limit: usize,
    window: chrono::Duration,
    cooldown: chrono::Duration,
}

impl QuotaPolicy {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const DEFAULT_WINDOW_SECS: u64 = 3600;
    pub const DEFAULT_COOLDOWN_SECS: u64 = 3900;

    pub fn new(limit: u32, window: Duration, cooldown: Duration) -> Self {
        Self {
            limit: limit.max(1) as usize,
            window: span(window),
            cooldown: span(cooldown),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    pub fn cooldown(&self) -> chrono::Duration {
        self.cooldown
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_LIMIT,
            Duration::from_secs(Self::DEFAULT_WINDOW_SECS),
            Duration::from_secs(Self::DEFAULT_COOLDOWN_SECS),
        )
    }
}

fn span(d: Duration) -> chrono::Duration {
    let secs = d.as_secs().min(MAX_SPAN_SECS) as i64;
    chrono::Duration::seconds(secs) + chrono::Duration::nanoseconds(i64::from(d.subsec_nanos()))
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Denial
// ---------------------------------------------------------------------------

/// Why a query was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenied {
    /// Serving a cool-down imposed after a quota violation.
    Suspended { until: DateTime<Utc> },
    /// `limit` queries already inside the trailing window.
    WindowFull { retry_after: Duration },
}

impl QuotaDenied {
    /// How long to wait, measured from `now`, before asking again.
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            QuotaDenied::Suspended { until } => to_std(*until - now),
            QuotaDenied::WindowFull { retry_after } => *retry_after,
        }
    }
}

impl fmt::Display for QuotaDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDenied::Suspended { until } => {
                write!(f, "account suspended until {}", until.to_rfc3339())
            }
            QuotaDenied::WindowFull { retry_after } => {
                write!(f, "query window full, retry in {}s", retry_after.as_secs())
            }
        }
    }
}

impl std::error::Error for QuotaDenied {}

// ---------------------------------------------------------------------------
// Per-account window
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AccountWindow {
    /// Admitted query instants, oldest first.
    requests: VecDeque<DateTime<Utc>>,
    suspended_until: Option<DateTime<Utc>>,
}

impl AccountWindow {
    /// Drop entries that have aged out and an elapsed suspension.
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(front) = self.requests.front() {
            if now - *front >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        if matches!(self.suspended_until, Some(until) if until <= now) {
            self.suspended_until = None;
        }
    }

    fn check(&self, now: DateTime<Utc>, policy: &QuotaPolicy) -> Result<(), QuotaDenied> {
        if let Some(until) = self.suspended_until {
            return Err(QuotaDenied::Suspended { until });
        }
        if self.requests.len() >= policy.limit {
            // Capacity frees up when the oldest live entry leaves the window.
            let retry_after = match self.requests.front() {
                Some(oldest) => to_std(*oldest + policy.window - now),
                None => Duration::ZERO,
            };
            return Err(QuotaDenied::WindowFull { retry_after });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QuotaGuard
// ---------------------------------------------------------------------------

/// Rolling-window gate shared by all account workers.
pub struct QuotaGuard {
    policy: QuotaPolicy,
    clock: Arc<dyn Clock>,
    windows: RwLock<HashMap<AccountId, Arc<Mutex<AccountWindow>>>>,
}

impl fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl QuotaGuard {
    pub fn new(policy: QuotaPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(policy: QuotaPolicy) -> Self {
        Self::new(policy, Arc::new(SystemClock))
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn slot(&self, account: &AccountId) -> Arc<Mutex<AccountWindow>> {
        {
            let read = self.windows.read().unwrap_or_else(|e| e.into_inner());
            if let Some(w) = read.get(account) {
                return Arc::clone(w);
            }
        }
        let mut write = self.windows.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(write.entry(account.clone()).or_default())
    }

    fn lock<'a>(slot: &'a Mutex<AccountWindow>) -> MutexGuard<'a, AccountWindow> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when a query issued now would be admitted.
    pub fn can_query(&self, account: &AccountId) -> bool {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        w.check(now, &self.policy).is_ok()
    }

    /// Append a query at the current instant and prune aged-out entries.
    /// Unconditional; admission is decided by [`QuotaGuard::check`].
    pub fn record_query(&self, account: &AccountId) {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        w.requests.push_back(now);
    }

    /// Why a query issued now would be refused, without recording anything.
    pub fn check(&self, account: &AccountId) -> Result<(), QuotaDenied> {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        w.check(now, &self.policy)
    }

    /// Zero when a query would be admitted now; otherwise the time until the
    /// suspension ends or the oldest live entry leaves the window.
    pub fn time_until_available(&self, account: &AccountId) -> Duration {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        match w.check(now, &self.policy) {
            Ok(()) => Duration::ZERO,
            Err(denied) => denied.wait_from(now),
        }
    }

    /// Start the cool-down after the authority reported a quota violation.
    /// Returns the instant the account becomes eligible again.
    pub fn suspend(&self, account: &AccountId) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = now + self.policy.cooldown;
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        // Never shorten a suspension that is already running.
        let until = match w.suspended_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        w.suspended_until = Some(until);
        tracing::warn!(
            account = %account,
            until = %until.to_rfc3339(),
            "quota/suspended"
        );
        until
    }

    pub fn suspended_until(&self, account: &AccountId) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        w.suspended_until
    }

    /// Live state of one account, suitable for persistence.
    pub fn snapshot(&self, account: &AccountId) -> QuotaWindowSnapshot {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        w.prune(now, self.policy.window);
        QuotaWindowSnapshot {
            requests: w.requests.iter().copied().collect(),
            suspended_until: w.suspended_until,
        }
    }

    /// Replace one account's request window with a persisted snapshot.
    /// Entries already outside the window are dropped; of the local and the
    /// persisted suspension, the later deadline is kept.
    pub fn restore(&self, account: &AccountId, snapshot: &QuotaWindowSnapshot) {
        let now = self.clock.now();
        let slot = self.slot(account);
        let mut w = Self::lock(&slot);
        let mut requests: Vec<DateTime<Utc>> = snapshot.requests.clone();
        requests.sort();
        w.requests = requests.into_iter().collect();
        w.suspended_until = w.suspended_until.max(snapshot.suspended_until);
        w.prune(now, self.policy.window);
    }
}

use dashmap::DashMap;
use std::time::{Duration, Instant};

struct FailureRecord {
    count: u32,
    first_failure: Instant,
    locked_until: Option<Instant>,
}

/// Per-IP login failure tracker.
///
/// `max_failures` bad logins within `window` lock the IP out for `lockout`.
pub struct BruteForceGuard {
    failures: DashMap<String, FailureRecord>,
    max_failures: u32,
    window: Duration,
    lockout: Duration,
}

impl BruteForceGuard {
    pub fn new(max_failures: u32, window: Duration, lockout: Duration) -> Self {
        tracing::info!(
            "Login guard: max {} failures in {}s window, {}s lockout",
            max_failures,
            window.as_secs(),
            lockout.as_secs()
        );

        Self {
            failures: DashMap::new(),
            max_failures: max_failures.max(1),
            window,
            lockout,
        }
    }

    pub fn record_failure(&self, ip: &str) {
        let now = Instant::now();
        let mut entry = self.failures.entry(ip.to_string()).or_insert(FailureRecord {
            count: 0,
            first_failure: now,
            locked_until: None,
        });
        let record = entry.value_mut();

        if now.duration_since(record.first_failure) > self.window {
            record.count = 0;
            record.first_failure = now;
            record.locked_until = None;
        }

        record.count += 1;
        if record.count >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                "Login lockout for IP {} ({} failures in window)",
                ip,
                record.count
            );
        }
    }

    pub fn is_locked(&self, ip: &str) -> bool {
        self.failures
            .get(ip)
            .and_then(|entry| entry.locked_until)
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn record_success(&self, ip: &str) {
        self.failures.remove(ip);
    }

    /// Drop records older than window + lockout. Run periodically.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let max_age = self.window + self.lockout;
        self.failures
            .retain(|_, record| now.duration_since(record.first_failure) < max_age);
    }

    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

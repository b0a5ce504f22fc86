use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct RateCounter {
    window_start: Instant,
    count: u32,
}

/// Fixed-window request counter keyed by client.
#[derive(Clone)]
pub struct RateGate {
    inner: Arc<Mutex<HashMap<String, RateCounter>>>,
    window: Duration,
    max: u32,
    max_keys: usize,
    exempt_paths: Arc<BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Exempt,
    Limited { retry_after_secs: u64 },
}

impl RateGate {
    pub fn new(window: Duration, max: u32, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max,
            max_keys: max_keys.max(1),
            exempt_paths: Arc::new(BTreeSet::new()),
        }
    }

    pub fn with_exempt_path(mut self, path: &str) -> Self {
        Arc::make_mut(&mut self.exempt_paths).insert(path.to_string());
        self
    }

    pub fn check(&self, path: &str, key: &str) -> RateDecision {
        self.check_at(path, key, Instant::now())
    }

    pub fn check_at(&self, path: &str, key: &str, now: Instant) -> RateDecision {
        if self.exempt_paths.contains(path) {
            return RateDecision::Exempt;
        }
        if self.max == 0 {
            return RateDecision::Allowed;
        }

        let mut inner = self.lock();

        let counter = inner.entry(key.to_string()).or_insert(RateCounter {
            window_start: now,
            count: 0,
        });
        if now.saturating_duration_since(counter.window_start) >= self.window {
            counter.window_start = now;
            counter.count = 0;
        }

        if counter.count >= self.max {
            let elapsed = now.saturating_duration_since(counter.window_start);
            let remaining = self.window.saturating_sub(elapsed);
            return RateDecision::Limited {
                retry_after_secs: ceil_secs(remaining).max(1),
            };
        }
        counter.count += 1;

        if inner.len() > self.max_keys {
            self.prune(&mut inner, now, key);
        }

        RateDecision::Allowed
    }

    pub fn current_count(&self, key: &str, now: Instant) -> u32 {
        let inner = self.lock();
        inner
            .get(key)
            .filter(|c| now.saturating_duration_since(c.window_start) < self.window)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn prune(&self, inner: &mut HashMap<String, RateCounter>, now: Instant, keep: &str) {
        inner.retain(|_, c| now.saturating_duration_since(c.window_start) < self.window);

        if inner.len() > self.max_keys {
            let mut overflow = inner.len() - self.max_keys;
            let mut oldest = inner
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .map(|(k, c)| (c.window_start, k.clone()))
                .collect::<Vec<_>>();
            oldest.sort();
            for (_, key) in oldest {
                if overflow == 0 {
                    break;
                }
                if inner.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateCounter>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

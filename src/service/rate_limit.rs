use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 限流判定 / Rate limit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after_ms: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// 令牌桶状态 / Token bucket state
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    admitted: VecDeque<Instant>, // 窗口内放行的时刻 / Admissions still inside the window
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self { tokens: capacity, last_refill: now, admitted: VecDeque::new() }
    }
}

/// 令牌桶限流器 / Token bucket limiter keyed by connection id or peer ip
///
/// 容量为 `points`，按 `points / window_ms` 的速率补充；另以滑动窗口限制任意
/// `window_ms` 内最多放行 `points` 次，连续补充不会让突发之后的请求越过窗口上限。
/// Capacity is `points`, refilled at `points / window_ms`. A sliding window additionally caps
/// admissions at `points` within any `window_ms`, so refill after a burst cannot exceed the window.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    points: u32,
    capacity: f64,
    refill_per_ms: f64,
    window_ms: u64,
}

impl RateLimiter {
    pub fn new(points: u32, window_ms: u64) -> Self {
        let window_ms = window_ms.max(1);
        let points = points.max(1);
        let capacity = points as f64;
        Self { buckets: DashMap::new(), points, capacity, refill_per_ms: capacity / window_ms as f64, window_ms }
    }

    /// 建立满桶 / Initialize a full bucket
    pub fn init(&self, key: &str) {
        self.buckets.insert(key.to_string(), Bucket::full(self.capacity, Instant::now()));
    }

    pub fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn consume(&self, key: &str, cost: u32) -> RateDecision {
        self.consume_at(key, cost, Instant::now())
    }

    pub fn consume_at(&self, key: &str, cost: u32, now: Instant) -> RateDecision {
        let cost_n = cost.max(1);
        let cost = cost_n as f64;
        let window = Duration::from_millis(self.window_ms);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(self.capacity, now));
        let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_secs_f64() * 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        bucket.last_refill = now;
        while matches!(bucket.admitted.front(), Some(t) if now.saturating_duration_since(*t) >= window) {
            bucket.admitted.pop_front();
        }

        let in_window = bucket.admitted.len() as u64;
        let over_window = (in_window + cost_n as u64).saturating_sub(self.points as u64);
        if bucket.tokens >= cost && over_window == 0 {
            bucket.tokens -= cost;
            bucket.admitted.extend(std::iter::repeat(now).take(cost_n as usize));
            let window_left = self.points as u64 - bucket.admitted.len() as u64;
            let remaining = (bucket.tokens.floor() as u64).min(window_left) as u32;
            return RateDecision::Allowed { remaining };
        }

        let bucket_wait = if bucket.tokens >= cost {
            0
        } else {
            ((cost - bucket.tokens) / self.refill_per_ms).ceil() as u64
        };
        // 需等到第 over_window 个旧放行滑出窗口 / Wait until enough old admissions slide out
        let window_wait = match over_window {
            0 => 0,
            n => match bucket.admitted.get(n as usize - 1) {
                Some(t) => ceil_ms((*t + window).saturating_duration_since(now)),
                None => self.window_ms,
            },
        };
        let retry_after_ms = bucket_wait.max(window_wait).max(1);
        debug!("🚦 {} limited, retry after {}ms", key, retry_after_ms);
        RateDecision::Denied { retry_after_ms }
    }

    /// 清理长时间空闲的桶 / Drop buckets idle for two windows (they would be full anyway)
    pub fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let idle = Duration::from_millis(self.window_ms.saturating_mul(2));
        let before = self.buckets.len();
        self.buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < idle);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn ceil_ms(d: Duration) -> u64 {
    ((d.as_micros() + 999) / 1_000) as u64
}

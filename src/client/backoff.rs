use crate::config::ENV_PREFIX;
use rand::Rng;
use std::time::Duration;

/// 首次重连延迟（秒）- 可通过环境变量 FAROS_TUNNEL_RECONNECT_DELAY_SECS 覆盖
pub const RECONNECT_DELAY_SECS: u64 = 5;
/// 最大重连延迟（秒）- 可通过环境变量 FAROS_TUNNEL_RECONNECT_MAX_DELAY_SECS 覆盖
pub const RECONNECT_MAX_DELAY_SECS: u64 = 5 * 60;
/// 会话持续超过该时间后，重连延迟恢复为初始值
pub const STEADY_STATE_AFTER: Duration = Duration::from_secs(60);

const FACTOR: u32 = 2;
const JITTER: f64 = 0.2;

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// 带抖动的指数退避
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            Duration::from_secs(env_secs("RECONNECT_DELAY_SECS", RECONNECT_DELAY_SECS)),
            Duration::from_secs(env_secs(
                "RECONNECT_MAX_DELAY_SECS",
                RECONNECT_MAX_DELAY_SECS,
            )),
        )
    }

    /// 返回下一次等待时间（±20% 抖动），并把基准值翻倍
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * FACTOR).min(self.max);

        let jitter = rand::rng().random_range(-JITTER..=JITTER);
        base.mul_f64(1.0 + jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// 根据上一次会话的持续时间决定是否重置
    pub fn session_ended(&mut self, lasted: Duration) {
        if lasted >= STEADY_STATE_AFTER {
            self.reset();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(RECONNECT_DELAY_SECS),
            Duration::from_secs(RECONNECT_MAX_DELAY_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within_jitter(delay: Duration, base: Duration) -> bool {
        delay >= base.mul_f64(1.0 - JITTER) && delay <= base.mul_f64(1.0 + JITTER)
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::default();
        let expected = [5, 10, 20, 40, 80, 160, 300, 300];
        for secs in expected {
            let delay = backoff.next_delay();
            assert!(
                within_jitter(delay, Duration::from_secs(secs)),
                "{:?} not within jitter of {}s",
                delay,
                secs
            );
        }
    }

    #[test]
    fn test_short_session_keeps_growing() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.session_ended(Duration::from_secs(10));
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(20)));
    }

    #[test]
    fn test_steady_session_resets() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.session_ended(STEADY_STATE_AFTER);
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(5)));
    }

    #[test]
    fn test_max_never_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(1));
        backoff.next_delay();
        assert!(within_jitter(backoff.next_delay(), Duration::from_secs(10)));
    }
}

use http::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// 指数退避
///
/// 从 `initial` 开始每次翻倍，不超过 `max`。成功后调用 `reset` 重新开始。
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Default for Backoff {
    /// 监听器 accept 使用的退避：5ms 起步，上限 1s
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// 下一次等待时间
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(d) => (d * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    /// 等待下一次退避时间
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await;
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_initial_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    2000
}

/// RoundTrip 过滤器层的重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// 最多尝试次数（含第一次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// 需要重试的响应状态码
    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,

    #[serde(default = "default_initial_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            statuses: default_retry_statuses(),
            initial_backoff_ms: default_initial_ms(),
            max_backoff_ms: default_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    pub fn should_retry_status(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

//! 响应限速过滤器
//!
//! 已知长度超过阈值的响应体按令牌桶限速下发。

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info};
use serde::Deserialize;
use std::io;
use std::time::Duration;
use tokio::time::Instant;

use super::{Filter, FilterEnv, ResponseFilter};
use crate::config::read_json_or_default;
use crate::context::Context;
use crate::error::Result;
use crate::http::{Body, Response};

pub const NAME: &str = "ratelimit";

/// ratelimit.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 响应体超过该字节数才限速
    pub threshold: u64,
    /// 每秒字节数，0 表示不限速
    pub rate: u64,
    /// 令牌桶容量，0 表示 rate * 1024
    pub capacity: u64,
}

/// 令牌桶
///
/// 初始为满，令牌可以透支，透支部分按速率折算为等待时间。
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64, capacity: u64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            rate: rate.max(1) as f64,
            capacity,
            tokens: capacity,
            last: Instant::now(),
        }
    }

    /// 取出 `n` 个令牌，返回需要等待的时间
    pub fn take(&mut self, n: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.tokens -= n as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// 按令牌桶节奏转发数据块
fn throttle(
    inner: BoxStream<'static, io::Result<Bytes>>,
    bucket: TokenBucket,
) -> BoxStream<'static, io::Result<Bytes>> {
    stream::unfold((inner, bucket), |(mut inner, mut bucket)| async move {
        let item = inner.next().await?;
        if let Ok(chunk) = &item {
            let wait = bucket.take(chunk.len());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        Some((item, (inner, bucket)))
    })
    .boxed()
}

pub struct RateLimitFilter {
    threshold: u64,
    rate: u64,
    capacity: u64,
}

impl RateLimitFilter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = match config.capacity {
            0 => config.rate.saturating_mul(1024),
            c => c,
        };
        Self {
            threshold: config.threshold,
            rate: config.rate,
            capacity,
        }
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: RateLimitConfig = read_json_or_default(env.store.as_ref(), "ratelimit.json")?;
        let filter = Self::new(&config);
        info!(
            "🐢 ratelimit 过滤器就绪: 阈值 {} 字节, 速率 {} 字节/秒",
            filter.threshold, filter.rate
        );
        Ok(filter)
    }
}

impl Filter for RateLimitFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_response(&self) -> Option<&dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl ResponseFilter for RateLimitFilter {
    async fn response(&self, _ctx: &mut Context, resp: Response) -> Result<Response> {
        if self.rate == 0 {
            return Ok(resp);
        }
        let length = match resp.body().length() {
            Some(n) if n > self.threshold => n,
            _ => return Ok(resp),
        };

        debug!("响应体 {} 字节, 限速 {} 字节/秒", length, self.rate);
        let (parts, body) = resp.into_parts();
        let bucket = TokenBucket::new(self.rate, self.capacity);
        let body = Body::stream(throttle(body.into_stream(), bucket), Some(length));
        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::filters::tests::env_with;
    use crate::http::simple_response;
    use http::StatusCode;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket() {
        let mut bucket = TokenBucket::new(1000, 1000);
        assert_eq!(bucket.take(1000), Duration::ZERO);
        assert_eq!(bucket.take(500), Duration::from_millis(500));

        tokio::time::advance(Duration::from_secs(2)).await;
        // 补充的令牌不超过容量
        assert_eq!(bucket.take(1000), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_body_is_throttled() {
        let filter = RateLimitFilter::new(&RateLimitConfig {
            threshold: 100,
            rate: 1000,
            capacity: 1000,
        });

        let chunks = (0..3).map(|_| Ok::<_, io::Error>(Bytes::from(vec![0u8; 1000])));
        let body = Body::stream(stream::iter(chunks).boxed(), Some(3000));
        let mut resp = Response::new(body);
        *resp.status_mut() = StatusCode::OK;

        let resp = filter.response(&mut Context::new(), resp).await.unwrap();
        assert_eq!(resp.body().length(), Some(3000));

        let start = Instant::now();
        let data = resp.into_body().collect(10_000).await.unwrap();
        let elapsed = start.elapsed();
        assert_eq!(data.len(), 3000);
        assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2500), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_small_or_unknown_bodies_untouched() {
        let filter = RateLimitFilter::new(&RateLimitConfig {
            threshold: 100,
            rate: 10,
            capacity: 0,
        });
        assert_eq!(filter.capacity, 10 * 1024);

        let resp = simple_response(StatusCode::OK, "text/plain", "short");
        let resp = filter.response(&mut Context::new(), resp).await.unwrap();
        assert!(matches!(resp.body(), Body::Full(_)));

        let body = Body::stream(stream::empty().boxed(), None);
        let resp = filter.response(&mut Context::new(), Response::new(body)).await.unwrap();
        assert!(matches!(resp.body(), Body::Stream { length: None, .. }));
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let filter = RateLimitFilter::from_env(&env_with(MemoryStore::new())).unwrap();
        let resp = simple_response(StatusCode::OK, "text/plain", "x".repeat(4096));
        let resp = filter.response(&mut Context::new(), resp).await.unwrap();
        assert!(matches!(resp.body(), Body::Full(_)));
    }
}

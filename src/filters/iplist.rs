//! 多 IP 过滤器
//!
//! 只处理命中站点规则的主机：通过 `MultiDialer` 在别名的全部地址间竞速，
//! CONNECT 接管连接建立隧道，其余请求转发到上游，遇到 502/503/504 或网络错误时按策略重试。

use async_trait::async_trait;
use http::uri::Scheme;
use http::Method;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::Arc;

use super::{bad_gateway, serve_tunnel, Filter, FilterEnv, RoundTripFilter};
use crate::config::read_json_or_default;
use crate::context::Context;
use crate::dialer::{MultiDialer, MultiDialerConfig};
use crate::error::Result;
use crate::http::{join_host_port, send_request, target_host_port, Request, Response};
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;

pub const NAME: &str = "iplist";

/// iplist.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IplistConfig {
    pub dialer: MultiDialerConfig,
    pub retry: RetryPolicy,
}

pub struct IplistFilter {
    dialer: Arc<MultiDialer>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl IplistFilter {
    pub fn new(config: IplistConfig, env: &FilterEnv) -> Result<Self> {
        let dialer = MultiDialer::new(config.dialer, Arc::clone(&env.resolver))?
            .with_metrics(env.metrics.clone());
        Ok(Self {
            dialer: Arc::new(dialer),
            retry: config.retry,
            metrics: env.metrics.clone(),
        })
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: IplistConfig = read_json_or_default(env.store.as_ref(), "iplist.json")?;
        let filter = Self::new(config, env)?;
        info!("🌐 iplist 过滤器就绪, 最多尝试 {} 次", filter.retry.attempts());
        Ok(filter)
    }

    pub fn dialer(&self) -> &Arc<MultiDialer> {
        &self.dialer
    }

    async fn forward(&self, addr: &str, req: &Request) -> Result<Response> {
        let stream = if req.uri().scheme() == Some(&Scheme::HTTPS) {
            self.dialer.dial_tls("tcp", addr, None).await?
        } else {
            self.dialer.dial("tcp", addr).await?
        };
        send_request(stream, req).await
    }

    /// 幂等请求才允许重试
    fn attempts_for(&self, method: &Method) -> usize {
        if method.is_idempotent() {
            self.retry.attempts()
        } else {
            1
        }
    }
}

impl Filter for IplistFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_round_trip(&self) -> Option<&dyn RoundTripFilter> {
        Some(self)
    }
}

#[async_trait]
impl RoundTripFilter for IplistFilter {
    async fn round_trip(&self, ctx: &mut Context, req: &Request) -> Result<Option<Response>> {
        let Some((host, port)) = target_host_port(req) else {
            return Ok(None);
        };
        let Some(alias) = self.dialer.site_alias(&host) else {
            return Ok(None);
        };
        let addr = join_host_port(&host, port);

        if req.method() == Method::CONNECT {
            let remote = self.dialer.dial("tcp", &addr).await?;
            debug!("{} 经别名 {} 建立隧道", addr, alias);
            serve_tunnel(ctx, remote, &self.metrics).await?;
            return Ok(None);
        }

        let attempts = self.attempts_for(req.method());
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = attempt >= attempts;
            match self.forward(&addr, req).await {
                Ok(resp) if last || !self.retry.should_retry_status(resp.status()) => {
                    return Ok(Some(resp));
                }
                Ok(resp) => {
                    debug!(
                        "{} {} 返回 {}, 第 {}/{} 次尝试",
                        req.method(),
                        req.uri(),
                        resp.status(),
                        attempt,
                        attempts
                    );
                }
                Err(e) if last || !e.is_transient() => {
                    warn!("{} {} 失败: {}", req.method(), req.uri(), e);
                    self.metrics.inc_bad_gateway();
                    return Ok(Some(bad_gateway(&e)));
                }
                Err(e) => {
                    debug!("{} {} 出错: {}, 第 {}/{} 次尝试", req.method(), req.uri(), e, attempt, attempts);
                }
            }
            backoff.wait().await;
        }
    }
}

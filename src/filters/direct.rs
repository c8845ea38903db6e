//! 直连过滤器
//!
//! 兜底的 RoundTrip 过滤器：解析目标主机后对全部 IP 竞速拨号，不经过任何别名。

use async_trait::async_trait;
use http::uri::Scheme;
use http::Method;
use log::{debug, warn};
use rustls::ClientConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::{bad_gateway, serve_tunnel, Filter, FilterEnv, RoundTripFilter};
use crate::config::read_json_or_default;
use crate::context::Context;
use crate::dialer::{tls_connect, Dialer, ResolvingDialer, TcpDialer};
use crate::error::{Error, Result};
use crate::http::{join_host_port, send_request, target_host_port, Request, Response};
use crate::metrics::Metrics;
use crate::tls;

pub const NAME: &str = "direct";

/// direct.json
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    /// 同时竞速的地址数
    pub window: usize,
    pub dial_timeout_ms: u64,
    pub tls_timeout_ms: u64,
    /// 转发 https 请求时不校验上游证书
    pub insecure_skip_verify: bool,
    /// TCP keepalive 空闲时间，0 表示关闭
    pub keepalive_secs: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            window: 2,
            dial_timeout_ms: 5000,
            tls_timeout_ms: 5000,
            insecure_skip_verify: false,
            keepalive_secs: 60,
        }
    }
}

pub struct DirectFilter {
    dialer: Box<dyn Dialer>,
    tls_config: Arc<ClientConfig>,
    tls_timeout: Duration,
    metrics: Metrics,
}

impl DirectFilter {
    pub fn new(config: &DirectConfig, env: &FilterEnv) -> Self {
        let keepalive = match config.keepalive_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let tcp = TcpDialer::new(Duration::from_millis(config.dial_timeout_ms))
            .with_keepalive(keepalive);
        let tls_config = if config.insecure_skip_verify {
            tls::insecure_client_config()
        } else {
            tls::verified_client_config()
        };

        Self {
            dialer: Box::new(ResolvingDialer::new(
                Arc::clone(&env.resolver),
                config.window,
                tcp,
            )),
            tls_config,
            tls_timeout: Duration::from_millis(config.tls_timeout_ms),
            metrics: env.metrics.clone(),
        }
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: DirectConfig = read_json_or_default(env.store.as_ref(), "direct.json")?;
        Ok(Self::new(&config, env))
    }

    /// 替换转发 https 请求时使用的 TLS 配置
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = config;
        self
    }

    async fn forward(&self, host: &str, addr: &str, req: &Request) -> Result<Response> {
        let mut stream = self.dialer.dial(addr).await?;
        if req.uri().scheme() == Some(&Scheme::HTTPS) {
            stream = tls_connect(stream, host, Arc::clone(&self.tls_config), self.tls_timeout).await?;
        }
        send_request(stream, req).await
    }
}

impl Filter for DirectFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_round_trip(&self) -> Option<&dyn RoundTripFilter> {
        Some(self)
    }
}

#[async_trait]
impl RoundTripFilter for DirectFilter {
    async fn round_trip(&self, ctx: &mut Context, req: &Request) -> Result<Option<Response>> {
        let (host, port) =
            target_host_port(req).ok_or_else(|| Error::http("请求缺少目标主机"))?;
        let addr = join_host_port(&host, port);

        if req.method() == Method::CONNECT {
            let remote = self.dialer.dial(&addr).await?;
            debug!("直连隧道 {}", addr);
            serve_tunnel(ctx, remote, &self.metrics).await?;
            return Ok(None);
        }

        match self.forward(&host, &addr, req).await {
            Ok(resp) => Ok(Some(resp)),
            Err(e) => {
                warn!("直连 {} {} 失败: {}", req.method(), req.uri(), e);
                self.metrics.inc_bad_gateway();
                Ok(Some(bad_gateway(&e)))
            }
        }
    }
}

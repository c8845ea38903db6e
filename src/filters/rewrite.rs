//! 请求/响应改写过滤器

use async_trait::async_trait;
use http::header::{self, HeaderName};
use http::HeaderValue;
use log::{debug, info};
use serde::Deserialize;

use super::{Filter, FilterEnv, RequestFilter, ResponseFilter};
use crate::config::read_json_or_default;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::http::{Request, Response};

pub const NAME: &str = "rewrite";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserAgentRule {
    pub enabled: bool,
    pub value: String,
}

/// 用请求中的另一个头部替换 Host
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostRule {
    pub enabled: bool,
    pub rewrite_by: String,
}

/// rewrite.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    pub user_agent: UserAgentRule,
    pub host: HostRule,
    /// 从响应中删除的头部
    pub remove_response_headers: Vec<String>,
}

pub struct RewriteFilter {
    user_agent: Option<HeaderValue>,
    host_header: Option<HeaderName>,
    remove_response_headers: Vec<HeaderName>,
}

impl RewriteFilter {
    pub fn new(config: &RewriteConfig) -> Result<Self> {
        let user_agent = if config.user_agent.enabled {
            Some(HeaderValue::from_str(&config.user_agent.value).map_err(|_| {
                Error::Config(format!("User-Agent 非法: {:?}", config.user_agent.value))
            })?)
        } else {
            None
        };
        let host_header = if config.host.enabled {
            Some(parse_name(&config.host.rewrite_by)?)
        } else {
            None
        };
        let remove_response_headers = config
            .remove_response_headers
            .iter()
            .map(|name| parse_name(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            user_agent,
            host_header,
            remove_response_headers,
        })
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: RewriteConfig = read_json_or_default(env.store.as_ref(), "rewrite.json")?;
        let filter = Self::new(&config)?;
        info!(
            "✏️  rewrite 过滤器就绪: User-Agent={} Host={:?}",
            filter.user_agent.is_some(),
            filter.host_header
        );
        Ok(filter)
    }
}

fn parse_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::Config(format!("非法的头部名 {:?}", name)))
}

impl Filter for RewriteFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_request(&self) -> Option<&dyn RequestFilter> {
        Some(self)
    }

    fn as_response(&self) -> Option<&dyn ResponseFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for RewriteFilter {
    async fn request(&self, _ctx: &mut Context, mut req: Request) -> Result<Request> {
        if let Some(ua) = &self.user_agent {
            req.headers_mut().insert(header::USER_AGENT, ua.clone());
        }

        if let Some(name) = &self.host_header {
            if let Some(host) = req.headers_mut().remove(name) {
                debug!("改写 Host: {:?} -> {:?}", req.headers().get(header::HOST), host);
                req.headers_mut().insert(header::HOST, host);
            }
        }

        Ok(req)
    }
}

#[async_trait]
impl ResponseFilter for RewriteFilter {
    async fn response(&self, _ctx: &mut Context, mut resp: Response) -> Result<Response> {
        for name in &self.remove_response_headers {
            resp.headers_mut().remove(name);
        }
        Ok(resp)
    }
}

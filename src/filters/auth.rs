//! 代理认证过滤器
//!
//! Request 阶段取出 `Proxy-Authorization` 按客户端地址缓存，RoundTrip 阶段校验：
//! 白名单 IP 或缓存中有正确的 Basic 凭据时放行，否则返回 407。

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{header, HeaderValue, StatusCode};
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use super::{Filter, FilterEnv, RequestFilter, RoundTripFilter};
use crate::config::read_json_or_default;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::http::{simple_response, Request, Response};
use crate::ttl_cache::TtlCache;

pub const NAME: &str = "auth";

const CHALLENGE: &str = "Basic realm=\"Proxy Authentication Required\"";

#[derive(Debug, Clone, Deserialize)]
pub struct BasicUser {
    pub username: String,
    pub password: String,
}

/// auth.json
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache_size: usize,
    /// 凭据在缓存中保留的时间
    pub cache_ttl_secs: u64,
    pub basic: Vec<BasicUser>,
    /// 免认证的客户端 IP
    pub whitelist: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_size: 1000,
            cache_ttl_secs: 3600,
            basic: Vec::new(),
            whitelist: Vec::new(),
        }
    }
}

pub struct AuthFilter {
    credentials: HashSet<String>,
    whitelist: HashSet<IpAddr>,
    cache: TtlCache<String, String>,
    ttl: Duration,
}

impl AuthFilter {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let whitelist = config
            .whitelist
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| Error::Config(format!("auth 白名单地址非法: {:?}", s)))
            })
            .collect::<Result<HashSet<_>>>()?;
        let credentials = config
            .basic
            .iter()
            .map(|u| format!("{}:{}", u.username, u.password))
            .collect();

        Ok(Self {
            credentials,
            whitelist,
            cache: TtlCache::new(config.cache_size.max(1)),
            ttl: Duration::from_secs(config.cache_ttl_secs),
        })
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: AuthConfig = read_json_or_default(env.store.as_ref(), "auth.json")?;
        let filter = Self::new(&config)?;
        info!(
            "🔐 auth 过滤器就绪: {} 个用户, {} 个白名单地址",
            filter.credentials.len(),
            filter.whitelist.len()
        );
        Ok(filter)
    }

    /// 校验 `Basic <base64(user:pass)>`
    fn is_valid(&self, authorization: &str) -> bool {
        let Some((scheme, encoded)) = authorization.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        match STANDARD.decode(encoded.trim()) {
            Ok(decoded) => match String::from_utf8(decoded) {
                Ok(pair) => self.credentials.contains(&pair),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    fn challenge() -> Response {
        let mut resp = simple_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "text/plain; charset=utf-8",
            "407 Proxy Authentication Required",
        );
        let headers = resp.headers_mut();
        headers.insert(
            header::PROXY_AUTHENTICATE,
            HeaderValue::from_static(CHALLENGE),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        resp
    }
}

impl Filter for AuthFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_request(&self) -> Option<&dyn RequestFilter> {
        Some(self)
    }

    fn as_round_trip(&self) -> Option<&dyn RoundTripFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for AuthFilter {
    async fn request(&self, ctx: &mut Context, mut req: Request) -> Result<Request> {
        if let Some(value) = req.headers_mut().remove(header::PROXY_AUTHORIZATION) {
            if let (Some(addr), Ok(value)) = (ctx.remote_addr(), value.to_str()) {
                self.cache
                    .set(addr.to_string(), value.to_string(), Some(self.ttl));
            }
        }
        Ok(req)
    }
}

#[async_trait]
impl RoundTripFilter for AuthFilter {
    async fn round_trip(&self, ctx: &mut Context, req: &Request) -> Result<Option<Response>> {
        let Some(addr) = ctx.remote_addr() else {
            return Ok(Some(Self::challenge()));
        };
        if self.whitelist.contains(&addr.ip()) {
            return Ok(None);
        }
        if let Some(authorization) = self.cache.get(&addr.to_string()) {
            if self.is_valid(&authorization) {
                return Ok(None);
            }
        }
        debug!("{} 未通过认证: {} {}", addr, req.method(), req.uri());
        Ok(Some(Self::challenge()))
    }
}

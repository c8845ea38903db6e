//! 过滤器链
//!
//! 每个请求依次经过 Request、RoundTrip、Response 三个阶段。一个过滤器可以实现其中
//! 一个或多个阶段，启动时由 `FilterRegistry` 按名字创建并在所有请求间共享。

pub mod auth;
pub mod direct;
pub mod iplist;
pub mod ratelimit;
pub mod rewrite;
pub mod stripssl;

use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::Store;
use crate::conn::BoxedStream;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::http::{simple_response, write_tunnel_established, Request, Response};
use crate::metrics::Metrics;
use crate::proxy::tunnel;
use crate::resolver::Resolver;

/// 过滤器
///
/// 通过 `as_*` 声明自己实现了哪些阶段。
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn as_request(&self) -> Option<&dyn RequestFilter> {
        None
    }

    fn as_round_trip(&self) -> Option<&dyn RoundTripFilter> {
        None
    }

    fn as_response(&self) -> Option<&dyn ResponseFilter> {
        None
    }
}

/// 请求阶段：改写请求，或者接管连接（设置 hijacked）
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn request(&self, ctx: &mut Context, req: Request) -> Result<Request>;
}

/// RoundTrip 阶段：返回 `Ok(None)` 表示不处理，交给下一个过滤器
#[async_trait]
pub trait RoundTripFilter: Send + Sync {
    async fn round_trip(&self, ctx: &mut Context, req: &Request) -> Result<Option<Response>>;
}

/// 响应阶段：改写响应
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    async fn response(&self, ctx: &mut Context, resp: Response) -> Result<Response>;
}

/// 创建过滤器时可用的共享资源
#[derive(Clone)]
pub struct FilterEnv {
    pub store: Arc<dyn Store>,
    pub metrics: Metrics,
    pub resolver: Arc<Resolver>,
}

type Factory = Box<dyn Fn(&FilterEnv) -> Result<Arc<dyn Filter>> + Send + Sync>;

/// 过滤器注册表
///
/// 名字到工厂函数的映射。同名过滤器只创建一次，之后的 `get` 返回同一个实例。
#[derive(Default)]
pub struct FilterRegistry {
    factories: HashMap<String, Factory>,
    instances: Mutex<HashMap<String, Arc<dyn Filter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册了全部内置过滤器的注册表
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(auth::NAME, auth::AuthFilter::from_env)?;
        registry.register(rewrite::NAME, rewrite::RewriteFilter::from_env)?;
        registry.register(ratelimit::NAME, ratelimit::RateLimitFilter::from_env)?;
        registry.register(stripssl::NAME, stripssl::StripSslFilter::from_env)?;
        registry.register(iplist::NAME, iplist::IplistFilter::from_env)?;
        registry.register(direct::NAME, direct::DirectFilter::from_env)?;
        Ok(registry)
    }

    /// 注册过滤器，重名返回错误
    pub fn register<F, T>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&FilterEnv) -> Result<T> + Send + Sync + 'static,
        T: Filter + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(Error::DuplicateFilter(name.to_string()));
        }
        self.factories.insert(
            name.to_string(),
            Box::new(move |env: &FilterEnv| -> Result<Arc<dyn Filter>> {
                Ok(Arc::new(factory(env)?))
            }),
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// 取过滤器实例，首次调用时创建
    pub fn get(&self, name: &str, env: &FilterEnv) -> Result<Arc<dyn Filter>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownFilter(name.to_string()))?;

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = instances.get(name) {
            return Ok(Arc::clone(f));
        }

        let filter = factory(env)?;
        info!("🔧 创建过滤器 {}", name);
        instances.insert(name.to_string(), Arc::clone(&filter));
        Ok(filter)
    }
}

/// 过滤器链的执行结果
pub enum Outcome {
    /// 得到响应，交给处理器写回客户端
    Response(Response),
    /// 连接已被过滤器接管，处理器不再写任何东西
    Hijacked,
    /// Request 阶段出错，直接关闭连接
    Closed(Error),
    /// RoundTrip/Response 阶段出错或没有过滤器给出响应，处理器回复 502
    Failed(Error),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Response(r) => write!(f, "Response({})", r.status()),
            Outcome::Hijacked => write!(f, "Hijacked"),
            Outcome::Closed(e) => write!(f, "Closed({})", e),
            Outcome::Failed(e) => write!(f, "Failed({})", e),
        }
    }
}

/// 按配置顺序排列的过滤器链
#[derive(Clone, Default)]
pub struct FilterChain {
    request: Vec<Arc<dyn Filter>>,
    round_trip: Vec<Arc<dyn Filter>>,
    response: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按名字组装过滤器链，名字未注册或过滤器不具备对应阶段都是启动期错误
    pub fn build(
        registry: &FilterRegistry,
        env: &FilterEnv,
        request: &[String],
        round_trip: &[String],
        response: &[String],
    ) -> Result<Self> {
        let mut chain = Self::new();
        for name in request {
            chain.push_request(registry.get(name, env)?)?;
        }
        for name in round_trip {
            chain.push_round_trip(registry.get(name, env)?)?;
        }
        for name in response {
            chain.push_response(registry.get(name, env)?)?;
        }
        Ok(chain)
    }

    pub fn push_request(&mut self, filter: Arc<dyn Filter>) -> Result<()> {
        if filter.as_request().is_none() {
            return Err(capability(&filter, "RequestFilter"));
        }
        self.request.push(filter);
        Ok(())
    }

    pub fn push_round_trip(&mut self, filter: Arc<dyn Filter>) -> Result<()> {
        if filter.as_round_trip().is_none() {
            return Err(capability(&filter, "RoundTripFilter"));
        }
        self.round_trip.push(filter);
        Ok(())
    }

    pub fn push_response(&mut self, filter: Arc<dyn Filter>) -> Result<()> {
        if filter.as_response().is_none() {
            return Err(capability(&filter, "ResponseFilter"));
        }
        self.response.push(filter);
        Ok(())
    }

    /// 各阶段的过滤器名
    pub fn describe(&self) -> String {
        let names = |v: &[Arc<dyn Filter>]| v.iter().map(|f| f.name()).collect::<Vec<_>>().join(",");
        format!(
            "request=[{}] round_trip=[{}] response=[{}]",
            names(&self.request),
            names(&self.round_trip),
            names(&self.response)
        )
    }

    /// 让请求走完整条链
    pub async fn run(&self, ctx: &mut Context, req: Request) -> Outcome {
        let mut req = req;
        for filter in &self.request {
            let Some(stage) = filter.as_request() else { continue };
            match stage.request(ctx, req).await {
                Ok(next) => req = next,
                Err(e) => {
                    if ctx.is_hijacked() {
                        debug!("{} 接管连接后出错: {}", filter.name(), e);
                        return Outcome::Hijacked;
                    }
                    return Outcome::Closed(e);
                }
            }
            if ctx.is_hijacked() {
                debug!("{} 接管了连接", filter.name());
                return Outcome::Hijacked;
            }
        }

        let mut resp = None;
        for filter in &self.round_trip {
            let Some(stage) = filter.as_round_trip() else { continue };
            let result = stage.round_trip(ctx, &req).await;
            if ctx.is_hijacked() {
                ctx.set_round_trip_filter(filter.name());
                if let Err(e) = result {
                    debug!("{} 接管连接后出错: {}", filter.name(), e);
                }
                return Outcome::Hijacked;
            }
            match result {
                Ok(Some(r)) => {
                    ctx.set_round_trip_filter(filter.name());
                    resp = Some(r);
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    ctx.set_round_trip_filter(filter.name());
                    return Outcome::Failed(e);
                }
            }
        }

        let Some(mut resp) = resp else {
            return Outcome::Failed(Error::DeadEnd);
        };

        for filter in &self.response {
            let Some(stage) = filter.as_response() else { continue };
            match stage.response(ctx, resp).await {
                Ok(next) => resp = next,
                Err(e) => return Outcome::Failed(e),
            }
            if ctx.is_hijacked() {
                return Outcome::Hijacked;
            }
        }

        Outcome::Response(resp)
    }
}

fn capability(filter: &Arc<dyn Filter>, stage: &'static str) -> Error {
    Error::FilterCapability {
        name: filter.name().to_string(),
        stage,
    }
}

/// 上游出错时交给客户端的 502，正文是错误信息
pub(crate) fn bad_gateway(err: &Error) -> Response {
    let mut resp = simple_response(
        StatusCode::BAD_GATEWAY,
        "text/plain; charset=utf-8",
        err.to_string(),
    );
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

/// 接管客户端连接，回复 200 后双向转发，直到任一端关闭
pub(crate) async fn serve_tunnel(
    ctx: &mut Context,
    remote: BoxedStream,
    metrics: &Metrics,
) -> Result<()> {
    let mut conn = ctx.hijack()?;
    write_tunnel_established(&mut conn).await?;
    let client = conn.remote_addr();
    let (up, down) = tunnel(conn, remote, metrics).await;
    debug!("隧道结束 {} 上行 {} 字节 下行 {} 字节", client, up, down);
    Ok(())
}

//! 客户端连接处理
//!
//! 每条连接一个循环：读请求、补全代理 URL、走过滤器链、写回响应，
//! 直到客户端或响应要求关闭连接、连接被过滤器接管、或空闲超时。

use http::header::{self, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Method, StatusCode, Version};
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::conn::ClientConn;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::filters::{FilterChain, Outcome};
use crate::http::{
    read_request, simple_response, wants_keep_alive, write_response, Request, Response,
    WriteOptions,
};
use crate::listener::Listener;
use crate::metrics::Metrics;

/// 请求处理器
pub struct Handler {
    chain: Arc<FilterChain>,
    listener: Arc<Listener>,
    metrics: Metrics,
    branding: String,
    /// 读取第一个请求的超时
    read_timeout: Duration,
    /// 两个请求之间的空闲超时
    keep_alive: Duration,
}

impl Handler {
    pub fn new(chain: Arc<FilterChain>, listener: Arc<Listener>, metrics: Metrics) -> Self {
        Self {
            chain,
            listener,
            metrics,
            branding: concat!("multipath-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
            read_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(75),
        }
    }

    pub fn with_branding(mut self, branding: impl Into<String>) -> Self {
        self.branding = branding.into();
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// 处理一条客户端连接直到它关闭
    pub async fn serve(&self, conn: ClientConn) -> Result<()> {
        let mut conn = conn;
        let remote = conn.remote_addr();
        let mut idle = self.read_timeout;

        loop {
            let req = match timeout(idle, read_request(conn.stream_mut())).await {
                Ok(Ok(req)) => req,
                Ok(Err(Error::EndOfInput)) => return Ok(()),
                Ok(Err(Error::Http(reason))) => {
                    debug!("{} 请求格式错误: {}", remote, reason);
                    let resp = simple_response(StatusCode::BAD_REQUEST, "text/plain; charset=utf-8", "400 Bad Request");
                    let opts = WriteOptions {
                        head_only: false,
                        http10: false,
                        keep_alive: false,
                    };
                    write_response(&mut conn, resp, opts).await?;
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!("{} 空闲超时 ({:?})", remote, idle);
                    return Ok(());
                }
            };
            idle = self.keep_alive;
            self.metrics.inc_requests();

            let req = normalize_proxy_url(req, conn.tls_server_name());
            let method = req.method().clone();
            let uri = req.uri().clone();
            let opts = WriteOptions {
                head_only: method == Method::HEAD,
                http10: req.version() == Version::HTTP_10,
                keep_alive: wants_keep_alive(&req) && !self.keep_alive.is_zero(),
            };

            let mut ctx = Context::new()
                .with_listener(Arc::clone(&self.listener))
                .with_conn(conn);

            let resp = match self.chain.run(&mut ctx, req).await {
                Outcome::Response(resp) => resp,
                Outcome::Hijacked => {
                    self.metrics.inc_hijacked();
                    debug!("{} \"{} {}\" 连接已被接管", remote, method, uri);
                    return Ok(());
                }
                Outcome::Closed(Error::EndOfInput) => return Ok(()),
                Outcome::Closed(e) => {
                    error!("{} Request 过滤器出错 \"{} {}\": {}", remote, method, uri, e);
                    return Ok(());
                }
                Outcome::Failed(e) => {
                    if matches!(e, Error::DeadEnd) {
                        self.metrics.inc_dead_ends();
                    }
                    self.metrics.inc_bad_gateway();
                    error!(
                        "{} 过滤器 {} 出错 \"{} {}\": {}",
                        remote,
                        ctx.round_trip_filter().unwrap_or("-"),
                        method,
                        uri,
                        e
                    );
                    self.error_response(&ctx, &e)
                }
            };

            let Some(taken) = ctx.take_conn() else {
                warn!("{} 连接已不可用，丢弃响应", remote);
                return Ok(());
            };
            conn = taken;

            let status = resp.status();
            let opts = WriteOptions {
                keep_alive: opts.keep_alive && !response_closes(&resp),
                ..opts
            };
            let written = write_response(&mut conn, resp, opts).await?;
            debug!(
                "{} \"{} {}\" {} {}",
                remote, method, uri, status.as_u16(), written.body_bytes
            );

            if !written.keep_alive {
                return Ok(());
            }
        }
    }

    /// 502 错误页面（JSON）
    fn error_response(&self, ctx: &Context, err: &Error) -> Response {
        let body = serde_json::json!({
            "type": "localproxy",
            "host": self.listener.local_addr().to_string(),
            "software": format!(
                "{} ({}/{})",
                self.branding,
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            "filter": ctx.round_trip_filter().unwrap_or(""),
            "error": err.to_string(),
        });
        let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
        simple_response(
            StatusCode::BAD_GATEWAY,
            "application/json; charset=utf-8",
            text + "\n",
        )
    }
}

/// 响应自己要求关闭连接
fn response_closes(resp: &Response) -> bool {
    resp.headers()
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("close"))
}

/// 把发给代理的相对 URL 补全为绝对 URL
///
/// 经过 TLS 终结的连接使用 https，主机名缺失时取 TLS 握手中的服务器名，
/// 其余使用 http 和 Host 头。CONNECT 与已是绝对 URL 的请求不变。
pub fn normalize_proxy_url(req: Request, tls_server_name: Option<&str>) -> Request {
    if req.method() == Method::CONNECT || req.uri().scheme().is_some() {
        return req;
    }

    let (mut parts, body) = req.into_parts();
    if parts.headers.get(header::HOST).is_none() {
        if let Some(name) = tls_server_name {
            if let Ok(value) = HeaderValue::from_str(name) {
                parts.headers.insert(header::HOST, value);
            }
        }
    }

    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.parse::<Authority>().ok());
    let Some(authority) = authority else {
        return Request::from_parts(parts, body);
    };

    let scheme = if tls_server_name.is_some() {
        Scheme::HTTPS
    } else {
        Scheme::HTTP
    };
    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    match Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path)
        .build()
    {
        Ok(uri) => parts.uri = uri,
        Err(e) => debug!("补全 URL 失败 {}: {}", parts.uri, e),
    }
    Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{Filter, RequestFilter, RoundTripFilter};
    use crate::listener::ListenOptions;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// 把请求 URL 作为响应体返回
    struct EchoUri;

    impl Filter for EchoUri {
        fn name(&self) -> &'static str {
            "echo_uri"
        }

        fn as_round_trip(&self) -> Option<&dyn RoundTripFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RoundTripFilter for EchoUri {
        async fn round_trip(&self, _ctx: &mut Context, req: &Request) -> Result<Option<Response>> {
            if req.uri().path() == "/pass" {
                return Ok(None);
            }
            Ok(Some(simple_response(
                StatusCode::OK,
                "text/plain",
                req.uri().to_string(),
            )))
        }
    }

    /// Request 阶段总是失败
    struct Reject;

    impl Filter for Reject {
        fn name(&self) -> &'static str {
            "reject"
        }

        fn as_request(&self) -> Option<&dyn RequestFilter> {
            Some(self)
        }
    }

    #[async_trait]
    impl RequestFilter for Reject {
        async fn request(&self, _ctx: &mut Context, _req: Request) -> Result<Request> {
            Err(Error::http("rejected"))
        }
    }

    async fn handler(chain: FilterChain) -> (Handler, Metrics) {
        let opts = ListenOptions {
            inherit: false,
            ..ListenOptions::default()
        };
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), opts).await.unwrap();
        let metrics = Metrics::new();
        let handler = Handler::new(Arc::new(chain), listener, metrics.clone())
            .with_branding("test-proxy/1.0");
        (handler, metrics)
    }

    fn echo_chain() -> FilterChain {
        let mut chain = FilterChain::new();
        chain.push_round_trip(Arc::new(EchoUri)).unwrap();
        chain
    }

    /// 在后台处理连接，返回客户端一端
    fn serve(handler: Handler, tls_name: Option<&str>) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "10.0.0.9:9000".parse().unwrap();
        let mut conn = ClientConn::new(Box::new(server_side), addr);
        if let Some(name) = tls_name {
            conn = conn.with_tls_server_name(name);
        }
        let task = tokio::spawn(async move { handler.serve(conn).await });
        (client, task)
    }

    async fn exchange(client: &mut DuplexStream, raw: &str) -> String {
        client.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_keep_alive_and_url_normalisation() {
        let (handler, metrics) = handler(echo_chain()).await;
        let (mut client, task) = serve(handler, None);

        let out = exchange(
            &mut client,
            "GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n\
             GET http://other.com/b HTTP/1.1\r\nHost: other.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        task.await.unwrap().unwrap();

        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(out.contains("http://example.com/a?x=1"));
        assert!(out.contains("http://other.com/b"));
        assert_eq!(metrics.snapshot().requests, 2);
    }

    #[tokio::test]
    async fn test_tls_connection_uses_https_and_server_name() {
        let (handler, _) = handler(echo_chain()).await;
        let (mut client, task) = serve(handler, Some("secure.example"));

        let out = exchange(&mut client, "GET /x HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        task.await.unwrap().unwrap();
        assert!(out.contains("https://secure.example/x"), "{}", out);
    }

    #[tokio::test]
    async fn test_dead_end_returns_json_error() {
        let (handler, metrics) = handler(echo_chain()).await;
        let listen_addr = handler.listener.local_addr().to_string();
        let (mut client, task) = serve(handler, None);

        let out = exchange(
            &mut client,
            "GET /pass HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        task.await.unwrap().unwrap();

        assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", out);
        let body = &out[out.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["type"], "localproxy");
        assert_eq!(json["host"], listen_addr);
        assert!(json["software"].as_str().unwrap().starts_with("test-proxy/1.0 ("));
        assert_eq!(json["filter"], "");
        assert!(json["error"].as_str().unwrap().contains("没有过滤器处理该请求"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.dead_ends, 1);
        assert_eq!(snapshot.bad_gateway, 1);
    }

    #[tokio::test]
    async fn test_request_filter_error_closes_silently() {
        let mut chain = echo_chain();
        chain.push_request(Arc::new(Reject)).unwrap();
        let (handler, _) = handler(chain).await;
        let (mut client, task) = serve(handler, None);

        let out = exchange(&mut client, "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        task.await.unwrap().unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_gets_bad_request() {
        let (handler, _) = handler(echo_chain()).await;
        let (mut client, task) = serve(handler, None);

        let out = exchange(&mut client, "NOT A REQUEST\r\n\r\n").await;
        task.await.unwrap().unwrap();
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let (handler, _) = handler(echo_chain()).await;
        let handler = handler.with_read_timeout(Duration::from_secs(1));
        let (_client, task) = serve(handler, None);
        // 客户端不发送任何数据
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_normalize_leaves_connect_and_absolute() {
        let req = http::Request::builder()
            .method(Method::CONNECT)
            .uri("example.com:443")
            .body(bytes::Bytes::new())
            .unwrap();
        let req = normalize_proxy_url(req, Some("x"));
        assert_eq!(req.uri(), "example.com:443");

        let req = http::Request::builder()
            .uri("http://a.com/p")
            .header("host", "b.com")
            .body(bytes::Bytes::new())
            .unwrap();
        assert_eq!(normalize_proxy_url(req, None).uri(), "http://a.com/p");

        // 没有 Host 也不是 TLS 连接时保持原样
        let req = http::Request::builder()
            .uri("/only-path")
            .body(bytes::Bytes::new())
            .unwrap();
        assert_eq!(normalize_proxy_url(req, None).uri(), "/only-path");
    }
}

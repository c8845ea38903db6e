//! TLS 剥离过滤器
//!
//! 对命中站点规则的 CONNECT 请求，接管连接并回复 200，端口在列表中时用配置的证书终结 TLS，
//! 然后把明文连接交还给监听器，之后的请求和普通连接一样走过滤器链。

use async_trait::async_trait;
use http::Method;
use log::{debug, info, warn};
use rustls::ServerConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use super::{Filter, FilterEnv, RequestFilter};
use crate::config::read_json_or_default;
use crate::conn::{BoxedStream, ClientConn};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::host_matcher::HostMatcher;
use crate::http::{target_host_port, write_tunnel_established, Request};
use crate::tls::load_server_config;

pub const NAME: &str = "stripssl";

/// stripssl.json
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StripSslConfig {
    pub sites: Vec<String>,
    /// 需要终结 TLS 的端口，其余端口原样交还
    pub ports: Vec<u16>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub handshake_timeout_secs: u64,
}

impl Default for StripSslConfig {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            ports: vec![443],
            cert_file: None,
            key_file: None,
            handshake_timeout_secs: 10,
        }
    }
}

pub struct StripSslFilter {
    sites: HostMatcher<()>,
    ports: HashSet<u16>,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl StripSslFilter {
    /// `server_config` 为空时只能处理不需要终结 TLS 的端口
    pub fn new(config: &StripSslConfig, server_config: Option<Arc<ServerConfig>>) -> Result<Self> {
        let sites = HostMatcher::from_hosts(&config.sites)?;
        let ports: HashSet<u16> = config.ports.iter().copied().collect();
        if !sites.is_empty() && !ports.is_empty() && server_config.is_none() {
            return Err(Error::Config("stripssl 缺少证书配置 cert_file/key_file".to_string()));
        }

        Ok(Self {
            sites,
            ports,
            acceptor: server_config.map(TlsAcceptor::from),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs.max(1)),
        })
    }

    pub fn from_env(env: &FilterEnv) -> Result<Self> {
        let config: StripSslConfig = read_json_or_default(env.store.as_ref(), "stripssl.json")?;
        let server_config = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => Some(load_server_config(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "stripssl 的 cert_file 和 key_file 必须同时配置".to_string(),
                ))
            }
        };
        let filter = Self::new(&config, server_config)?;
        info!(
            "🔓 stripssl 过滤器就绪: {} 条站点规则, 端口 {:?}",
            filter.sites.len(),
            config.ports
        );
        Ok(filter)
    }

    async fn accept_tls(&self, conn: ClientConn, host: &str) -> Result<BoxedStream> {
        let Some(acceptor) = &self.acceptor else {
            return Err(Error::Tls("没有可用的服务端证书".to_string()));
        };
        let remote = conn.remote_addr();
        match timeout(self.handshake_timeout, acceptor.accept(conn)).await {
            Ok(Ok(tls)) => Ok(Box::new(tls)),
            Ok(Err(e)) => {
                debug!("{} 终结 {} 的 TLS 失败: {}", remote, host, e);
                Err(Error::Tls(format!("{}: {}", host, e)))
            }
            Err(_) => Err(Error::Timeout {
                op: "TLS 握手",
                after: self.handshake_timeout,
            }),
        }
    }
}

impl Filter for StripSslFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_request(&self) -> Option<&dyn RequestFilter> {
        Some(self)
    }
}

#[async_trait]
impl RequestFilter for StripSslFilter {
    async fn request(&self, ctx: &mut Context, req: Request) -> Result<Request> {
        if req.method() != Method::CONNECT {
            return Ok(req);
        }
        let Some((host, port)) = target_host_port(&req) else {
            return Ok(req);
        };
        if !self.sites.matches(&host) {
            return Ok(req);
        }
        let Some(listener) = ctx.listener().cloned() else {
            return Err(Error::Hijack("没有可交还连接的监听器".to_string()));
        };

        let mut conn = ctx.hijack()?;
        write_tunnel_established(&mut conn).await?;
        let remote = conn.remote_addr();
        debug!("{} STRIP {}:{}", remote, host, port);

        let plain = if self.ports.contains(&port) {
            let tls = self.accept_tls(conn, &host).await?;
            ClientConn::new(tls, remote).with_tls_server_name(host)
        } else {
            ClientConn::new(Box::new(conn), remote)
        };

        if let Err(e) = listener.add(plain).await {
            warn!("{} 交还连接失败: {}", remote, e);
            return Err(e);
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::filters::tests::{env_with, get};
    use crate::listener::{ListenOptions, Listener};
    use crate::tls::tests::{test_roots, test_server_config};
    use crate::tls::{client_config_with_roots, server_name};
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_rustls::TlsConnector;

    fn filter(ports: &[u16]) -> StripSslFilter {
        let config = StripSslConfig {
            sites: vec!["localhost".to_string()],
            ports: ports.to_vec(),
            ..StripSslConfig::default()
        };
        StripSslFilter::new(&config, Some(test_server_config())).unwrap()
    }

    async fn listener() -> Arc<Listener> {
        let opts = ListenOptions {
            inherit: false,
            ..ListenOptions::default()
        };
        Listener::bind("127.0.0.1:0".parse().unwrap(), opts).await.unwrap()
    }

    fn connect(target: &str) -> Request {
        http::Request::builder()
            .method(Method::CONNECT)
            .uri(target)
            .body(bytes::Bytes::new())
            .unwrap()
    }

    fn client_ctx(listener: &Arc<Listener>) -> (Context, DuplexStream) {
        let (client, server_side) = tokio::io::duplex(16 * 1024);
        let addr: SocketAddr = "10.0.0.3:7000".parse().unwrap();
        let ctx = Context::new()
            .with_listener(Arc::clone(listener))
            .with_conn(ClientConn::new(Box::new(server_side), addr));
        (ctx, client)
    }

    #[tokio::test]
    async fn test_strip_tls_and_hand_back() {
        let listener = listener().await;
        let filter = Arc::new(filter(&[443]));
        let (mut ctx, mut client) = client_ctx(&listener);

        let task = tokio::spawn(async move {
            let result = filter.request(&mut ctx, connect("localhost:443")).await;
            (result.is_ok(), ctx.is_hijacked())
        });

        let mut established = [0u8; 19];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established, b"HTTP/1.1 200 OK\r\n\r\n");

        let connector = TlsConnector::from(client_config_with_roots(test_roots()));
        let mut tls = connector
            .connect(server_name("localhost").unwrap(), client)
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), (true, true));

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.tls_server_name(), Some("localhost"));
        assert_eq!(accepted.remote_addr(), "10.0.0.3:7000".parse::<SocketAddr>().unwrap());
        assert!(accepted.is_tracked());

        tls.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 16];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_other_port_handed_back_as_is() {
        let listener = listener().await;
        let filter = filter(&[443]);
        let (mut ctx, mut client) = client_ctx(&listener);

        filter.request(&mut ctx, connect("localhost:8080")).await.unwrap();
        assert!(ctx.is_hijacked());

        let mut established = [0u8; 19];
        client.read_exact(&mut established).await.unwrap();

        let mut accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.tls_server_name(), None);
        client.write_all(b"plain").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"plain");
    }

    #[tokio::test]
    async fn test_unmatched_requests_untouched() {
        let listener = listener().await;
        let filter = filter(&[443]);

        let (mut ctx, _client) = client_ctx(&listener);
        filter.request(&mut ctx, connect("example.com:443")).await.unwrap();
        assert!(!ctx.is_hijacked());

        let (mut ctx, _client) = client_ctx(&listener);
        filter.request(&mut ctx, get("http://localhost/")).await.unwrap();
        assert!(!ctx.is_hijacked());
    }

    #[test]
    fn test_missing_certificate_is_config_error() {
        let env = env_with(
            MemoryStore::new().with("stripssl.json", r#"{"sites": ["example.com"]}"#),
        );
        assert!(matches!(
            StripSslFilter::from_env(&env),
            Err(Error::Config(_))
        ));
        // 默认配置没有站点，不需要证书
        assert!(StripSslFilter::from_env(&env_with(MemoryStore::new())).is_ok());
    }
}

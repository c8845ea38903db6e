use async_trait::async_trait;
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rustls::ClientConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;

use crate::conn::BoxedStream;
use crate::error::{Error, Result};
use crate::host_matcher::HostMatcher;
use crate::http::join_host_port;
use crate::metrics::Metrics;
use crate::racer::{ConnRacer, ScoreCache};
use crate::resolver::{BlackList, Resolver};
use crate::tls::{self, PinPolicy};
use crate::ttl_cache::TtlCache;

/// 基础拨号器
#[async_trait]
pub trait Dialer: Send + Sync {
    /// 建立到 `addr`（host:port）的 TCP 连接
    async fn dial(&self, addr: &str) -> Result<BoxedStream>;
}

/// 把 `host:port` 拆分为主机和端口，支持 `[v6]:port`
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let bad = || Error::Config(format!("非法地址 {:?}", addr));
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(bad)?;
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(bad)?;
        (&rest[..end], port)
    } else {
        addr.rsplit_once(':').ok_or_else(bad)?
    };
    if host.is_empty() || (host.contains(':') && !addr.starts_with('[')) {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

/// 直接 TCP 拨号，带连接超时和 keepalive
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                return Err(Error::Timeout {
                    op: "TCP 连接",
                    after: self.connect_timeout,
                })
            }
        };

        let _ = stream.set_nodelay(true);
        if let Some(idle) = self.keepalive {
            let sock = socket2::SockRef::from(&stream);
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
                debug!("设置 keepalive 失败 {}: {}", addr, e);
            }
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        Ok(Box::new(self.connect(addr).await?))
    }
}

/// 在已建立的连接上完成 TLS 握手
pub async fn tls_connect(
    stream: BoxedStream,
    sni: &str,
    config: Arc<ClientConfig>,
    after: Duration,
) -> Result<BoxedStream> {
    let name = tls::server_name(sni)?;
    let connector = TlsConnector::from(config);
    match timeout(after, connector.connect(name, stream)).await {
        Ok(Ok(s)) => Ok(Box::new(s)),
        Ok(Err(e)) => Err(Error::Tls(format!("{}: {}", sni, e))),
        Err(_) => Err(Error::Timeout { op: "TLS 握手", after }),
    }
}

/// 解析主机名后对全部 IP 竞速拨号（直连使用）
pub struct ResolvingDialer {
    resolver: Arc<Resolver>,
    racer: ConnRacer,
    scores: Arc<ScoreCache>,
    tcp: TcpDialer,
}

impl ResolvingDialer {
    pub fn new(resolver: Arc<Resolver>, window: usize, tcp: TcpDialer) -> Self {
        Self {
            resolver,
            racer: ConnRacer::new(window),
            scores: Arc::new(ScoreCache::new(
                1024,
                Duration::from_secs(1800),
                Duration::from_secs(300),
            )),
            tcp,
        }
    }
}

#[async_trait]
impl Dialer for ResolvingDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let (host, port) = split_host_port(addr)?;
        let addrs: Vec<String> = self
            .resolver
            .lookup_host(&host)
            .await?
            .iter()
            .map(|ip| join_host_port(ip, port))
            .collect();

        let tcp = self.tcp.clone();
        self.racer
            .race(&addrs, &self.scores, move |a| {
                let tcp = tcp.clone();
                async move { tcp.dial(&a).await }
            })
            .await
    }
}

fn default_window() -> usize {
    4
}

fn default_dial_timeout_ms() -> u64 {
    5000
}

fn default_tls_timeout_ms() -> u64 {
    5000
}

fn default_trusted_prefixes() -> Vec<String> {
    vec!["google_".to_string()]
}

fn default_issuer_prefix() -> Option<String> {
    Some("Google ".to_string())
}

fn default_good_expiry_secs() -> u64 {
    1800
}

fn default_error_expiry_secs() -> u64 {
    300
}

fn default_alias_expiry_secs() -> u64 {
    600
}

fn default_score_cache_size() -> usize {
    4096
}

fn default_pin_blacklist_secs() -> u64 {
    3600
}

/// 多路拨号配置
#[derive(Debug, Clone, Deserialize)]
pub struct MultiDialerConfig {
    /// 同一次竞速的并发拨号数
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_tls_timeout_ms")]
    pub tls_timeout_ms: u64,

    /// 非受信别名是否校验证书
    #[serde(default)]
    pub ssl_verify: bool,

    /// 以这些前缀开头的别名使用受信服务商的 TLS 配置
    #[serde(default = "default_trusted_prefixes")]
    pub trusted_prefixes: Vec<String>,

    /// 受信别名握手时随机使用的 SNI，为空时使用原主机名
    #[serde(default)]
    pub sni_names: Vec<String>,

    /// 受信别名签发者证书的 SPKI SHA-256（base64）
    #[serde(default)]
    pub pins: Vec<String>,

    /// 未配置指纹时要求的签发者 CN 前缀
    #[serde(default = "default_issuer_prefix")]
    pub issuer_prefix: Option<String>,

    #[serde(default = "default_good_expiry_secs")]
    pub good_expiry_secs: u64,

    #[serde(default = "default_error_expiry_secs")]
    pub error_expiry_secs: u64,

    /// 别名解析结果的缓存时间
    #[serde(default = "default_alias_expiry_secs")]
    pub alias_expiry_secs: u64,

    #[serde(default = "default_score_cache_size")]
    pub score_cache_size: usize,

    /// 指纹校验失败的 IP 加入黑名单的时长
    #[serde(default = "default_pin_blacklist_secs")]
    pub pin_blacklist_secs: u64,

    /// 别名解析失败时是否退回直接拨原主机
    #[serde(default)]
    pub fallback_direct: bool,

    /// 别名 -> 主机名/IP 列表
    #[serde(default)]
    pub hosts: HashMap<String, Vec<String>>,

    /// 主机规则 -> 别名
    #[serde(default)]
    pub sites: BTreeMap<String, String>,
}

impl Default for MultiDialerConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            dial_timeout_ms: default_dial_timeout_ms(),
            tls_timeout_ms: default_tls_timeout_ms(),
            ssl_verify: false,
            trusted_prefixes: default_trusted_prefixes(),
            sni_names: Vec::new(),
            pins: Vec::new(),
            issuer_prefix: default_issuer_prefix(),
            good_expiry_secs: default_good_expiry_secs(),
            error_expiry_secs: default_error_expiry_secs(),
            alias_expiry_secs: default_alias_expiry_secs(),
            score_cache_size: default_score_cache_size(),
            pin_blacklist_secs: default_pin_blacklist_secs(),
            fallback_direct: false,
            hosts: HashMap::new(),
            sites: BTreeMap::new(),
        }
    }
}

/// 受信别名在一次 TLS 竞速中使用的参数
#[derive(Clone)]
struct TlsAttempt {
    config: Arc<ClientConfig>,
    sni: String,
    pin: Option<PinPolicy>,
}

/// 多路拨号器
///
/// 主机命中站点规则时展开为别名下的全部地址并竞速拨号；未命中时直接拨号。
/// TCP 与 TLS 的耗时记录分开保存。
pub struct MultiDialer {
    config: MultiDialerConfig,
    resolver: Arc<Resolver>,
    sites: HostMatcher<String>,
    aliases: TtlCache<String, Vec<String>>,
    racer: ConnRacer,
    tcp_scores: Arc<ScoreCache>,
    tls_scores: Arc<ScoreCache>,
    tcp: TcpDialer,
    pin: PinPolicy,
    verified: Arc<ClientConfig>,
    insecure: Arc<ClientConfig>,
    metrics: Option<Metrics>,
}

impl MultiDialer {
    pub fn new(config: MultiDialerConfig, resolver: Arc<Resolver>) -> Result<Self> {
        let sites = HostMatcher::new(
            config
                .sites
                .iter()
                .map(|(rule, alias)| (rule.clone(), alias.clone())),
        )?;
        for alias in config.sites.values() {
            if !config.hosts.contains_key(alias) {
                warn!("站点规则引用了未定义的别名 {:?}", alias);
            }
        }
        let pin = PinPolicy::new(&config.pins, config.issuer_prefix.clone())?;

        let good = Duration::from_secs(config.good_expiry_secs);
        let bad = Duration::from_secs(config.error_expiry_secs);
        let tcp = TcpDialer::new(Duration::from_millis(config.dial_timeout_ms));

        info!(
            "多路拨号器: {} 个别名, {} 条站点规则, 竞速窗口 {}",
            config.hosts.len(),
            sites.len(),
            config.window
        );

        Ok(Self {
            sites,
            aliases: TtlCache::new(config.hosts.len().max(16)),
            racer: ConnRacer::new(config.window),
            tcp_scores: Arc::new(ScoreCache::new(config.score_cache_size, good, bad)),
            tls_scores: Arc::new(ScoreCache::new(config.score_cache_size, good, bad)),
            tcp,
            pin,
            verified: tls::verified_client_config(),
            insecure: tls::insecure_client_config(),
            metrics: None,
            resolver,
            config,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 替换校验证书时使用的客户端配置（自定义根证书）
    pub fn with_verified_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.verified = config;
        self
    }

    /// 主机对应的别名
    pub fn site_alias(&self, host: &str) -> Option<&str> {
        self.sites.lookup(host).map(String::as_str)
    }

    fn is_trusted(&self, alias: &str) -> bool {
        self.config
            .trusted_prefixes
            .iter()
            .any(|p| alias.starts_with(p.as_str()))
    }

    fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.config.tls_timeout_ms)
    }

    /// 把别名展开为 IP 列表
    ///
    /// 别名下的每个名字分别解析，单个名字失败会被跳过。缓存的是展开结果本身，
    /// 每次返回前都重新经过黑名单，运行期加入黑名单的地址（例如指纹校验失败）立即生效。
    /// 过滤后为空时返回 `NoUsableAddress`。
    pub async fn lookup_alias(&self, alias: &str) -> Result<Vec<String>> {
        let ips = match self.aliases.get(alias) {
            Some(ips) => ips,
            None => self.expand_alias(alias).await?,
        };

        let blacklist = self.resolver.blacklist();
        let usable: Vec<String> = ips
            .into_iter()
            .filter(|ip| !blacklist.contains_str(ip))
            .collect();
        if usable.is_empty() {
            return Err(Error::NoUsableAddress {
                name: alias.to_string(),
            });
        }
        Ok(usable)
    }

    async fn expand_alias(&self, alias: &str) -> Result<Vec<String>> {
        let names = self
            .config
            .hosts
            .get(alias)
            .ok_or_else(|| Error::AliasNotFound(alias.to_string()))?;

        let mut ips: Vec<String> = Vec::new();
        for name in names {
            match self.resolver.lookup_host(name).await {
                Ok(found) => {
                    for ip in found {
                        if !ips.contains(&ip) {
                            ips.push(ip);
                        }
                    }
                }
                Err(e) => debug!("别名 {} 的 {} 解析失败: {}", alias, name, e),
            }
        }

        if ips.is_empty() {
            return Err(Error::NoUsableAddress {
                name: alias.to_string(),
            });
        }

        debug!("别名 {} -> {:?}", alias, ips);
        let expiry = match self.config.alias_expiry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.aliases.set(alias.to_string(), ips.clone(), expiry);
        Ok(ips)
    }

    /// 别名展开后的候选地址，按网络类型过滤协议族
    async fn candidates(&self, network: &str, alias: &str, port: u16) -> Result<Vec<String>> {
        let ips = self.lookup_alias(alias).await?;
        let addrs: Vec<String> = ips
            .iter()
            .filter(|ip| match (network, ip.parse::<IpAddr>()) {
                ("tcp4", Ok(ip)) => ip.is_ipv4(),
                ("tcp6", Ok(ip)) => ip.is_ipv6(),
                _ => true,
            })
            .map(|ip| join_host_port(ip, port))
            .collect();
        if addrs.is_empty() {
            return Err(Error::NoUsableAddress {
                name: format!("{} ({})", alias, network),
            });
        }
        Ok(addrs)
    }

    /// 别名解析失败时决定是否退回直连
    fn fallback(&self, host: &str, err: Error) -> Result<()> {
        if self.config.fallback_direct {
            warn!("{} 别名解析失败, 退回直连: {}", host, err);
            Ok(())
        } else {
            Err(err)
        }
    }

    fn count_race(&self, addrs: usize) {
        if addrs > 1 {
            if let Some(m) = &self.metrics {
                m.inc_races();
            }
        }
    }

    fn count_race_failure(&self, addrs: usize) {
        if addrs > 1 {
            if let Some(m) = &self.metrics {
                m.inc_race_failures();
            }
        }
    }

    /// 建立 TCP 连接
    pub async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream> {
        check_network(network)?;
        let (host, port) = split_host_port(addr)?;

        if let Some(alias) = self.site_alias(&host) {
            match self.candidates(network, alias, port).await {
                Ok(addrs) => {
                    debug!("{} 命中别名 {}, 竞速 {} 个地址", host, alias, addrs.len());
                    self.count_race(addrs.len());
                    let tcp = self.tcp.clone();
                    let result = self
                        .racer
                        .race(&addrs, &self.tcp_scores, move |a| {
                            let tcp = tcp.clone();
                            async move { tcp.dial(&a).await }
                        })
                        .await;
                    if result.is_err() {
                        self.count_race_failure(addrs.len());
                    }
                    return result;
                }
                Err(e) => self.fallback(&host, e)?,
            }
        }

        self.tcp.dial(addr).await
    }

    /// 建立 TLS 连接
    ///
    /// `config` 为 `None` 时按别名类别选择配置：受信别名跳过证书校验并改用公钥指纹，
    /// 其余别名在 `ssl_verify` 开启时校验证书。指纹不匹配的连接会被关闭，
    /// 对应 IP 在一段时间内加入黑名单。
    pub async fn dial_tls(
        &self,
        network: &str,
        addr: &str,
        config: Option<Arc<ClientConfig>>,
    ) -> Result<BoxedStream> {
        check_network(network)?;
        let (host, port) = split_host_port(addr)?;

        if let Some(alias) = self.site_alias(&host) {
            let trusted = self.is_trusted(alias);
            match self.candidates(network, alias, port).await {
                Ok(addrs) => {
                    let plan = TlsAttempt {
                        config: config.unwrap_or_else(|| self.profile(trusted)),
                        sni: self.pick_sni(trusted, &host),
                        pin: trusted.then(|| self.pin.clone()),
                    };
                    debug!(
                        "{} 命中别名 {} (受信: {}), TLS 竞速 {} 个地址, SNI {}",
                        host,
                        alias,
                        trusted,
                        addrs.len(),
                        plan.sni
                    );
                    self.count_race(addrs.len());
                    let result = self.race_tls(&addrs, plan).await;
                    if result.is_err() {
                        self.count_race_failure(addrs.len());
                    }
                    return result;
                }
                Err(e) => self.fallback(&host, e)?,
            }
        }

        let config = config.unwrap_or_else(|| self.profile(false));
        let stream = self.tcp.dial(addr).await?;
        tls_connect(stream, &host, config, self.tls_timeout()).await
    }

    fn profile(&self, trusted: bool) -> Arc<ClientConfig> {
        if !trusted && self.config.ssl_verify {
            Arc::clone(&self.verified)
        } else {
            Arc::clone(&self.insecure)
        }
    }

    fn pick_sni(&self, trusted: bool, host: &str) -> String {
        if trusted {
            if let Some(name) = self.config.sni_names.choose(&mut rand::thread_rng()) {
                return name.clone();
            }
        }
        host.to_string()
    }

    async fn race_tls(&self, addrs: &[String], plan: TlsAttempt) -> Result<BoxedStream> {
        let tcp = self.tcp.clone();
        let tcp_scores = Arc::clone(&self.tcp_scores);
        let blacklist = Arc::clone(self.resolver.blacklist());
        let metrics = self.metrics.clone();
        let after = self.tls_timeout();
        let ban = Duration::from_secs(self.config.pin_blacklist_secs);

        self.racer
            .race(addrs, &self.tls_scores, move |a| {
                let attempt = TlsRaceAttempt {
                    tcp: tcp.clone(),
                    tcp_scores: Arc::clone(&tcp_scores),
                    blacklist: Arc::clone(&blacklist),
                    metrics: metrics.clone(),
                    plan: plan.clone(),
                    after,
                    ban,
                };
                attempt.run(a)
            })
            .await
    }

    /// 清空所有耗时/错误记录和别名缓存，强制重新探测
    pub fn clear_cache(&self) {
        self.tcp_scores.clear();
        self.tls_scores.clear();
        self.aliases.clear();
        info!("🧹 已清除拨号耗时记录和别名缓存");
    }

    pub fn tcp_scores(&self) -> &Arc<ScoreCache> {
        &self.tcp_scores
    }

    pub fn tls_scores(&self) -> &Arc<ScoreCache> {
        &self.tls_scores
    }
}

#[async_trait]
impl Dialer for MultiDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        MultiDialer::dial(self, "tcp", addr).await
    }
}

fn check_network(network: &str) -> Result<()> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(Error::UnsupportedNetwork(other.to_string())),
    }
}

/// TLS 竞速中的单次尝试：TCP 连接、握手、指纹校验
struct TlsRaceAttempt {
    tcp: TcpDialer,
    tcp_scores: Arc<ScoreCache>,
    blacklist: Arc<BlackList>,
    metrics: Option<Metrics>,
    plan: TlsAttempt,
    after: Duration,
    ban: Duration,
}

impl TlsRaceAttempt {
    async fn run(self, addr: String) -> Result<BoxedStream> {
        let start = Instant::now();
        let stream = match self.tcp.connect(&addr).await {
            Ok(s) => {
                self.tcp_scores.record_success(&addr, start.elapsed());
                s
            }
            Err(e) => {
                self.tcp_scores.record_failure(&addr, &e);
                return Err(e);
            }
        };

        let name = tls::server_name(&self.plan.sni)?;
        let connector = TlsConnector::from(Arc::clone(&self.plan.config));
        let tls = match timeout(self.after, connector.connect(name, stream)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Tls(format!("{} ({}): {}", addr, self.plan.sni, e))),
            Err(_) => {
                return Err(Error::Timeout {
                    op: "TLS 握手",
                    after: self.after,
                })
            }
        };

        if let Some(pin) = &self.plan.pin {
            let (_, session) = tls.get_ref();
            let certs = session.peer_certificates().unwrap_or(&[]);
            if let Err(reason) = pin.check(certs) {
                warn!("⚠️  {} 证书校验失败, 加入黑名单: {}", addr, reason);
                if let Ok((host, _)) = split_host_port(&addr) {
                    if let Ok(ip) = host.parse::<IpAddr>() {
                        self.blacklist.add(ip, Some(self.ban));
                    }
                }
                if let Some(m) = &self.metrics {
                    m.inc_pin_failures();
                }
                drop(tls);
                return Err(Error::PinMismatch { addr, reason });
            }
        }

        Ok(Box::new(tls))
    }
}

use crate::error::{Error, Result};
use crate::ttl_cache::TtlCache;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// 解析器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// 显式 DNS 服务器（为空时使用系统解析）
    pub dns_server: Option<IpAddr>,
    /// DNS 服务器端口
    pub dns_port: u16,
    /// 单次 DNS 查询超时（毫秒）
    pub dns_timeout_ms: u64,
    /// 缓存有效期（秒），0 表示永不过期
    pub expiry_secs: u64,
    /// 缓存容量
    pub cache_size: usize,
    /// 丢弃 IPv6 结果
    pub disable_ipv6: bool,
    /// 只使用 IPv6
    pub force_ipv6: bool,
    /// 静态主机表，值可以是 IP 或者另一个主机名
    pub hosts: HashMap<String, Vec<String>>,
    /// 额外的黑名单 IP
    pub blacklist: Vec<IpAddr>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dns_server: None,
            dns_port: 53,
            dns_timeout_ms: 3000,
            expiry_secs: 600,
            cache_size: 8192,
            disable_ipv6: false,
            force_ipv6: false,
            hosts: HashMap::new(),
            blacklist: Vec::new(),
        }
    }
}

/// IP 黑名单
///
/// 包含回环地址、本机网卡地址、配置中的地址，以及运行期发现的问题地址（可带过期时间）。
/// 只追加不删除，条目靠过期和容量淘汰。
#[derive(Debug)]
pub struct BlackList {
    entries: TtlCache<IpAddr, ()>,
}

impl BlackList {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: TtlCache::new(capacity),
        }
    }

    /// 创建预置了回环地址和本机地址的黑名单
    pub fn with_local_addrs(capacity: usize) -> Self {
        let list = Self::new(capacity);
        list.add(IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        list.add(IpAddr::V6(Ipv6Addr::LOCALHOST), None);
        list.add(IpAddr::V4(Ipv4Addr::UNSPECIFIED), None);
        for ip in local_interface_ips() {
            list.add(ip, None);
        }
        debug!("黑名单初始化完成: {} 条", list.len());
        list
    }

    /// 加入黑名单，`ttl` 为 None 表示永久
    pub fn add(&self, ip: IpAddr, ttl: Option<Duration>) {
        self.entries.set(ip, (), ttl);
    }

    #[inline]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.contains(ip)
    }

    /// 按字符串查询，无法解析为 IP 的视为不在黑名单中
    pub fn contains_str(&self, s: &str) -> bool {
        s.trim_matches(|c| c == '[' || c == ']')
            .parse::<IpAddr>()
            .map(|ip| self.contains(&ip))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 枚举本机所有网卡地址
#[cfg(unix)]
pub fn local_interface_ips() -> Vec<IpAddr> {
    let mut ips = Vec::new();
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: getifaddrs 成功后链表在 freeifaddrs 之前一直有效，只读访问
    unsafe {
        if libc::getifaddrs(&mut head) != 0 {
            warn!("getifaddrs 失败: {}", std::io::Error::last_os_error());
            return ips;
        }

        let mut cur = head;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() {
                match (*ifa.ifa_addr).sa_family as libc::c_int {
                    libc::AF_INET => {
                        let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        ips.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))));
                    }
                    libc::AF_INET6 => {
                        let sa = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        ips.push(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)));
                    }
                    _ => {}
                }
            }
            cur = ifa.ifa_next;
        }

        libc::freeifaddrs(head);
    }

    ips
}

#[cfg(not(unix))]
pub fn local_interface_ips() -> Vec<IpAddr> {
    Vec::new()
}

/// 带缓存和黑名单过滤的 DNS 解析器
pub struct Resolver {
    config: ResolverConfig,
    cache: TtlCache<String, Vec<IpAddr>>,
    blacklist: Arc<BlackList>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Resolver {
    pub fn new(config: ResolverConfig, blacklist: Arc<BlackList>) -> Self {
        for ip in &config.blacklist {
            blacklist.add(*ip, None);
        }
        if let Some(server) = config.dns_server {
            info!("使用 DNS 服务器: {}:{}", server, config.dns_port);
        }

        Self {
            cache: TtlCache::new(config.cache_size),
            config,
            blacklist,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn blacklist(&self) -> &Arc<BlackList> {
        &self.blacklist
    }

    pub fn force_ipv6(&self) -> bool {
        self.config.force_ipv6
    }

    pub fn disable_ipv6(&self) -> bool {
        self.config.disable_ipv6
    }

    fn expiry(&self) -> Option<Duration> {
        match self.config.expiry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// 解析为 IP 字符串列表
    pub async fn lookup_host(&self, name: &str) -> Result<Vec<String>> {
        let ips = self.lookup_ip(name).await?;
        Ok(ips.iter().map(IpAddr::to_string).collect())
    }

    /// 解析为 IP 列表
    ///
    /// 字面量 IP 直接返回并永久缓存；其余名字依次查缓存、静态主机表、真实解析，
    /// 结果经过协议族策略和黑名单过滤。过滤后为空返回 `NoUsableAddress`。
    pub async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>> {
        let name = name.trim_matches(|c| c == '[' || c == ']');

        if let Ok(ip) = name.parse::<IpAddr>() {
            self.cache.set(name.to_string(), vec![ip], None);
            return Ok(vec![ip]);
        }

        let key = name.trim_end_matches('.').to_lowercase();
        if let Some(ips) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("DNS 缓存命中: {} -> {:?}", key, ips);
            return Ok(ips);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let ips = match self.config.hosts.get(&key) {
            Some(entries) => self.lookup_static(entries).await?,
            None => self.lookup_remote(&key).await?,
        };

        let ips = self.apply_policy(ips);
        if ips.is_empty() {
            warn!("{} 解析结果全部被过滤", key);
            return Err(Error::NoUsableAddress { name: key });
        }

        debug!("DNS 解析: {} -> {:?}", key, ips);
        self.cache.set(key, ips.clone(), self.expiry());
        Ok(ips)
    }

    async fn lookup_static(&self, entries: &[String]) -> Result<Vec<IpAddr>> {
        let mut ips = Vec::new();
        let mut last_err = None;
        for entry in entries {
            match entry.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                // 静态表只展开一层，避免循环引用
                Err(_) => match self.lookup_remote(entry).await {
                    Ok(resolved) => ips.extend(resolved),
                    Err(e) => last_err = Some(e),
                },
            }
        }
        match (ips.is_empty(), last_err) {
            (true, Some(e)) => Err(e),
            _ => Ok(ips),
        }
    }

    async fn lookup_remote(&self, name: &str) -> Result<Vec<IpAddr>> {
        match self.config.dns_server {
            Some(server) => {
                let server = SocketAddr::new(server, self.config.dns_port);
                query_dns(server, name, self.query_types(), self.dns_timeout()).await
            }
            None => {
                let addrs = tokio::net::lookup_host((name, 0))
                    .await
                    .map_err(|e| Error::resolve(name, e))?;
                Ok(addrs.map(|addr| addr.ip()).collect())
            }
        }
    }

    fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.config.dns_timeout_ms.max(1))
    }

    fn query_types(&self) -> &'static [RecordType] {
        if self.config.force_ipv6 {
            &[RecordType::AAAA]
        } else if self.config.disable_ipv6 {
            &[RecordType::A]
        } else {
            &[RecordType::A, RecordType::AAAA]
        }
    }

    fn apply_policy(&self, ips: Vec<IpAddr>) -> Vec<IpAddr> {
        let mut out: Vec<IpAddr> = Vec::with_capacity(ips.len());
        for ip in ips {
            let family_ok = match ip {
                IpAddr::V4(_) => !self.config.force_ipv6,
                IpAddr::V6(_) => self.config.force_ipv6 || !self.config.disable_ipv6,
            };
            if family_ok && !self.blacklist.contains(&ip) && !out.contains(&ip) {
                out.push(ip);
            }
        }
        out
    }

    /// 清空解析缓存
    pub fn clear(&self) {
        self.cache.clear();
        info!("DNS 缓存已清除");
    }

    /// (命中, 未命中, 缓存条目数)
    pub fn stats(&self) -> (u64, u64, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.cache.len(),
        )
    }
}

/// 向指定 DNS 服务器发送 UDP 查询
async fn query_dns(
    server: SocketAddr,
    name: &str,
    types: &[RecordType],
    after: Duration,
) -> Result<Vec<IpAddr>> {
    let fqdn = Name::from_ascii(format!("{}.", name.trim_end_matches('.')))
        .map_err(|e| Error::resolve(name, e))?;

    let bind: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;

    let mut ips = Vec::new();
    let mut buf = vec![0u8; 4096];

    for &rtype in types {
        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(fqdn.clone(), rtype));
        let bytes = request.to_vec().map_err(|e| Error::resolve(name, e))?;
        socket.send(&bytes).await?;

        let reply = loop {
            let n = timeout(after, socket.recv(&mut buf))
                .await
                .map_err(|_| Error::Timeout { op: "DNS 查询", after })??;
            let reply = Message::from_vec(&buf[..n]).map_err(|e| Error::resolve(name, e))?;
            // 丢弃迟到的旧应答
            if reply.id() == id {
                break reply;
            }
        };

        for record in reply.answers() {
            match record.data() {
                Some(RData::A(a)) => ips.push(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => ips.push(IpAddr::V6(aaaa.0)),
                _ => {}
            }
        }
    }

    if ips.is_empty() {
        return Err(Error::resolve(name, format!("DNS 服务器 {} 没有应答记录", server)));
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    fn resolver_with(config: ResolverConfig) -> Resolver {
        Resolver::new(config, Arc::new(BlackList::new(64)))
    }

    #[tokio::test]
    async fn test_literal_ip() {
        let resolver = resolver_with(ResolverConfig::default());
        assert_eq!(
            resolver.lookup_ip("1.2.3.4").await.unwrap(),
            vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(resolver.lookup_host("[::1]").await.unwrap(), vec!["::1".to_string()]);
    }

    #[tokio::test]
    async fn test_static_hosts_and_blacklist() {
        let mut config = ResolverConfig::default();
        config
            .hosts
            .insert("bad.example".to_string(), vec!["10.9.9.9".to_string()]);
        config.hosts.insert(
            "mixed.example".to_string(),
            vec!["10.9.9.9".to_string(), "10.1.1.1".to_string()],
        );
        config.blacklist.push("10.9.9.9".parse().unwrap());
        let resolver = resolver_with(config);

        assert!(matches!(
            resolver.lookup_ip("bad.example").await,
            Err(Error::NoUsableAddress { .. })
        ));
        assert_eq!(
            resolver.lookup_host("mixed.example").await.unwrap(),
            vec!["10.1.1.1".to_string()]
        );

        // 第二次命中缓存
        resolver.lookup_host("MIXED.example.").await.unwrap();
        let (hits, misses, _) = resolver.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 2);
    }

    #[tokio::test]
    async fn test_family_policy() {
        let mut config = ResolverConfig::default();
        config.hosts.insert(
            "dual.example".to_string(),
            vec!["10.0.0.1".to_string(), "2001:db8::1".to_string()],
        );
        config.disable_ipv6 = true;
        let resolver = resolver_with(config.clone());
        assert_eq!(resolver.lookup_host("dual.example").await.unwrap(), vec!["10.0.0.1"]);

        config.disable_ipv6 = false;
        config.force_ipv6 = true;
        let resolver = resolver_with(config);
        assert_eq!(resolver.lookup_host("dual.example").await.unwrap(), vec!["2001:db8::1"]);
    }

    #[tokio::test]
    async fn test_query_dns_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..n]).unwrap();
            let query = request.queries()[0].clone();

            let mut reply = Message::new();
            reply
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .add_query(query.clone())
                .add_answer(Record::from_rdata(
                    query.name().clone(),
                    60,
                    RData::A(A::new(10, 0, 0, 7)),
                ));
            server.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
        });

        let ips = query_dns(
            server_addr,
            "relay.example",
            &[RecordType::A],
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(ips, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_query_dns_timeout() {
        // 绑定但从不应答
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = query_dns(
            silent.local_addr().unwrap(),
            "slow.example",
            &[RecordType::A],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_blacklist_seed() {
        let list = BlackList::with_local_addrs(256);
        assert!(list.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(list.contains_str("[::1]"));
        assert!(!list.contains_str("not-an-ip"));

        list.add("10.0.0.9".parse().unwrap(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.contains_str("10.0.0.9"));
    }
}

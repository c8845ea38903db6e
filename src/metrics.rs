use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 代理运行指标
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    // 连接统计
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    failed_connections: AtomicU64,

    // 流量统计（上行：客户端到远端）
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,

    // 请求统计
    requests: AtomicU64,
    hijacked: AtomicU64,
    bad_gateway: AtomicU64,
    dead_ends: AtomicU64,

    // 拨号统计
    races: AtomicU64,
    race_failures: AtomicU64,
    pin_failures: AtomicU64,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_connections: AtomicU64::new(0),
                active_connections: AtomicUsize::new(0),
                failed_connections: AtomicU64::new(0),
                bytes_up: AtomicU64::new(0),
                bytes_down: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                hijacked: AtomicU64::new(0),
                bad_gateway: AtomicU64::new(0),
                dead_ends: AtomicU64::new(0),
                races: AtomicU64::new(0),
                race_failures: AtomicU64::new(0),
                pin_failures: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // 连接统计
    pub fn inc_total_connections(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_active_connections(&self) {
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_connections(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_failed_connections(&self) {
        self.inner.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    // 流量统计
    pub fn add_bytes_up(&self, bytes: u64) {
        self.inner.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.inner.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    // 请求统计
    pub fn inc_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hijacked(&self) {
        self.inner.hijacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bad_gateway(&self) {
        self.inner.bad_gateway.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dead_ends(&self) {
        self.inner.dead_ends.fetch_add(1, Ordering::Relaxed);
    }

    // 拨号统计
    pub fn inc_races(&self) {
        self.inner.races.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_race_failures(&self) {
        self.inner.race_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pin_failures(&self) {
        self.inner.pin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_connections(&self) -> u64 {
        self.inner.total_connections.load(Ordering::Relaxed)
    }

    pub fn get_active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            failed_connections: self.inner.failed_connections.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
            requests: self.inner.requests.load(Ordering::Relaxed),
            hijacked: self.inner.hijacked.load(Ordering::Relaxed),
            bad_gateway: self.inner.bad_gateway.load(Ordering::Relaxed),
            dead_ends: self.inner.dead_ends.load(Ordering::Relaxed),
            races: self.inner.races.load(Ordering::Relaxed),
            race_failures: self.inner.race_failures.load(Ordering::Relaxed),
            pin_failures: self.inner.pin_failures.load(Ordering::Relaxed),
            uptime: self.inner.start_time.elapsed(),
        }
    }

    /// 打印监控指标
    pub fn print_summary(&self) {
        let snapshot = self.snapshot();
        log::info!("=== 运行指标 ===");
        log::info!("运行时间: {:?}", snapshot.uptime);
        log::info!("总连接数: {}", snapshot.total_connections);
        log::info!("活跃连接: {}", snapshot.active_connections);
        log::info!("失败连接: {}", snapshot.failed_connections);
        log::info!("请求数: {}", snapshot.requests);
        log::info!("接管连接: {}", snapshot.hijacked);
        log::info!("网关错误: {}", snapshot.bad_gateway);
        log::info!("无人处理: {}", snapshot.dead_ends);
        log::info!("上行流量: {} MB", snapshot.bytes_up / 1024 / 1024);
        log::info!("下行流量: {} MB", snapshot.bytes_down / 1024 / 1024);
        log::info!("竞速拨号: {} (失败 {})", snapshot.races, snapshot.race_failures);

        if snapshot.races > 0 {
            let success_rate =
                (1.0 - snapshot.race_failures as f64 / snapshot.races as f64) * 100.0;
            log::info!("竞速成功率: {:.2}%", success_rate);
        }

        log::info!("证书指纹校验失败: {}", snapshot.pin_failures);
    }
}

/// 监控指标快照
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub active_connections: usize,
    pub failed_connections: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub requests: u64,
    pub hijacked: u64,
    pub bad_gateway: u64,
    pub dead_ends: u64,
    pub races: u64,
    pub race_failures: u64,
    pub pin_failures: u64,
    pub uptime: Duration,
}

/// RAII 风格的连接计数器
pub struct ConnectionGuard {
    metrics: Metrics,
}

impl ConnectionGuard {
    pub fn new(metrics: Metrics) -> Self {
        metrics.inc_total_connections();
        metrics.inc_active_connections();

        let total = metrics.get_total_connections();
        let active = metrics.get_active_connections();
        log::debug!("📊 新连接建立 | 总连接数: {} | 活跃连接: {}", total, active);

        Self { metrics }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.dec_active_connections();

        let active = self.metrics.get_active_connections();
        let total = self.metrics.get_total_connections();
        log::debug!("📊 连接关闭 | 总连接数: {} | 活跃连接: {}", total, active);
    }
}

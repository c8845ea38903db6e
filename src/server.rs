use anyhow::{Context as _, Result};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::config::ProfileConfig;
use crate::conn::ClientConn;
use crate::error::Error;
use crate::filters::FilterChain;
use crate::handler::Handler;
use crate::listener::{ListenOptions, Listener};
use crate::metrics::{ConnectionGuard, Metrics};

/// 🚀 自适应最大连接数：每核心 500 个，上限 10000
pub fn adaptive_max_connections() -> usize {
    let num_cpus = num_cpus::get();
    std::cmp::min(10000, num_cpus * 500)
}

/// 后台任务：定期打印监控指标
pub fn spawn_metrics_reporter(metrics: Metrics, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // 第一次 tick 立即返回
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics.print_summary();
        }
    })
}

/// 一个监听配置对应的代理服务器
pub struct ProxyServer {
    /// 配置名
    name: String,
    /// 监听配置
    profile: ProfileConfig,
    /// 过滤器链
    chain: Arc<FilterChain>,
    /// 最大并发连接数
    max_connections: usize,
    /// 错误页面中的软件名
    branding: Option<String>,
    listen_options: ListenOptions,
    /// 性能监控指标
    metrics: Metrics,
}

impl ProxyServer {
    pub fn new(name: impl Into<String>, profile: ProfileConfig, chain: FilterChain, metrics: Metrics) -> Self {
        let max_connections = profile
            .max_connections
            .unwrap_or_else(adaptive_max_connections)
            .max(1);

        Self {
            name: name.into(),
            profile,
            chain: Arc::new(chain),
            max_connections,
            branding: None,
            listen_options: ListenOptions::default(),
            metrics,
        }
    }

    /// 设置最大并发连接数
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn with_branding(mut self, branding: impl Into<String>) -> Self {
        self.branding = Some(branding.into());
        self
    }

    pub fn with_listen_options(mut self, opts: ListenOptions) -> Self {
        self.listen_options = opts;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// 获取监控指标
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// 绑定监听地址
    pub async fn bind(&self) -> Result<Arc<Listener>> {
        let addr: SocketAddr = self
            .profile
            .address
            .parse()
            .with_context(|| format!("[{}] 监听地址非法: {}", self.name, self.profile.address))?;
        let listener = Listener::bind(addr, self.listen_options.clone())
            .await
            .with_context(|| format!("[{}] 监听 {} 失败", self.name, addr))?;
        Ok(listener)
    }

    fn handler(&self, listener: &Arc<Listener>) -> Handler {
        let mut handler = Handler::new(Arc::clone(&self.chain), Arc::clone(listener), self.metrics.clone())
            .with_read_timeout(Duration::from_secs(self.profile.read_timeout_secs.max(1)))
            .with_keep_alive(Duration::from_secs(self.profile.keep_alive_secs));
        if let Some(branding) = &self.branding {
            handler = handler.with_branding(branding.clone());
        }
        handler
    }

    /// 启动代理服务器，直到收到关闭信号
    pub async fn run_with_shutdown(&self, listener: Arc<Listener>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!("[{}] 代理服务器启动在 {}", self.name, listener.local_addr());
        info!("[{}] 最大并发连接数: {}", self.name, self.max_connections);
        info!("[{}] 过滤器: {}", self.name, self.chain.describe());

        // 使用信号量限制并发连接数
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let handler = Arc::new(self.handler(&listener));

        loop {
            tokio::select! {
                // 监听关闭信号
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("🛑 [{}] 收到关闭信号，停止接受新连接", self.name);
                        break;
                    }
                }
                // 监听新连接
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            handle_new_connection(conn, &semaphore, &handler, &self.metrics, Instant::now()).await;
                        }
                        Err(Error::ListenerClosed) => break,
                        Err(e) => {
                            error!("[{}] 接受连接失败: {}", self.name, e);
                        }
                    }
                }
            }
        }

        self.drain(&listener).await;
        Ok(())
    }

    /// 关闭监听器并等待活跃连接完成
    async fn drain(&self, listener: &Listener) {
        listener.close();

        info!("⏳ [{}] 等待活跃连接完成...", self.name);
        let wait_start = Instant::now();

        let active = listener.active();
        if active > 0 {
            info!("⏳ [{}] 等待 {} 个活跃连接关闭...", self.name, active);
        }

        let limit = Duration::from_secs(self.profile.drain_timeout_secs);
        match tokio::time::timeout(limit, listener.wait()).await {
            Ok(()) => info!("✅ [{}] 所有连接已关闭", self.name),
            Err(_) => warn!(
                "⚠️  [{}] 超时：仍有 {} 个连接未关闭，强制退出",
                self.name,
                listener.active()
            ),
        }

        info!("⏱️  [{}] 关闭耗时: {:?}", self.name, wait_start.elapsed());
    }
}

/// 处理新连接的辅助函数
async fn handle_new_connection(
    conn: ClientConn,
    semaphore: &Arc<Semaphore>,
    handler: &Arc<Handler>,
    metrics: &Metrics,
    accept_start: Instant,
) {
    let client_addr = conn.remote_addr();

    // ⏱️ 测量获取 permit 耗时
    let permit = match Arc::clone(semaphore).acquire_owned().await {
        Ok(p) => p,
        Err(e) => {
            error!("获取连接许可失败: {}", e);
            return;
        }
    };
    let permit_elapsed = accept_start.elapsed();
    if permit_elapsed.as_millis() > 10 {
        debug!("⏱️  等待许可: {}ms (来自 {})", permit_elapsed.as_millis(), client_addr);
    }

    let handler = Arc::clone(handler);
    let metrics = metrics.clone();

    // 使用 catch_unwind 捕获 panic
    tokio::spawn(async move {
        // 持有许可直到连接处理完成
        let _permit = permit;
        let _guard = ConnectionGuard::new(metrics.clone());

        let result = std::panic::AssertUnwindSafe(handler.serve(conn))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("处理连接 {} 时出错: {}", client_addr, e);
                metrics.inc_failed_connections();
            }
            Err(panic_err) => {
                error!("❌ 连接 {} 处理任务 panic: {:?}", client_addr, panic_err);
                metrics.inc_failed_connections();
            }
        }
    });
}

use anyhow::{Context, Result};
use multipath_proxy::config::{read_json, FileStore, ProxyConfig, Store};
use multipath_proxy::filters::{FilterChain, FilterEnv, FilterRegistry};
use multipath_proxy::logger::init_logger;
use multipath_proxy::metrics::Metrics;
use multipath_proxy::resolver::{BlackList, Resolver};
use multipath_proxy::server::{spawn_metrics_reporter, ProxyServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 主配置文件名
const CONFIG_NAME: &str = "httpproxy.json";

/// 黑名单容量
const BLACKLIST_CAPACITY: usize = 8192;

/// 监控指标打印间隔
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // 配置目录（命令行参数或 ./config）
    let config_dir = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());
    let store: Arc<dyn Store> = Arc::new(FileStore::new(&config_dir));

    let config: ProxyConfig = read_json(store.as_ref(), CONFIG_NAME)
        .with_context(|| format!("无法读取配置文件: {}/{}", config_dir, CONFIG_NAME))?;

    // 初始化日志
    let log_config = config.log.to_log_config().context("日志配置无效")?;
    init_logger(log_config).map_err(|e| anyhow::anyhow!("初始化日志系统失败: {}", e))?;

    log::info!("=== {} 启动 ===", config.branding);
    log::info!("配置目录: {}", config_dir);
    log::info!("日志级别: {}", config.log.level);
    log::info!("日志输出: {}", config.log.output);

    let metrics = Metrics::new();
    let blacklist = Arc::new(BlackList::with_local_addrs(BLACKLIST_CAPACITY));
    let resolver = Arc::new(Resolver::new(config.resolver.clone(), blacklist));
    log::info!("黑名单: {} 个地址", resolver.blacklist().len());

    let env = FilterEnv {
        store: Arc::clone(&store),
        metrics: metrics.clone(),
        resolver,
    };
    let registry = FilterRegistry::builtin().context("注册过滤器失败")?;
    log::info!("可用过滤器: {}", registry.names().join(", "));

    // 先组装好所有监听配置再开始监听，任何一个出错都直接退出
    let mut servers = Vec::new();
    for (name, profile) in config.enabled_profiles() {
        let chain = FilterChain::build(
            &registry,
            &env,
            &profile.request_filters,
            &profile.round_trip_filters,
            &profile.response_filters,
        )
        .with_context(|| format!("[{}] 组装过滤器链失败", name))?;

        let server = ProxyServer::new(name.clone(), profile.clone(), chain, metrics.clone())
            .with_branding(config.branding.clone());
        let listener = server.bind().await?;
        servers.push((Arc::new(server), listener));
    }

    if servers.is_empty() {
        anyhow::bail!("{} 中没有启用的监听配置", CONFIG_NAME);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reporter = spawn_metrics_reporter(metrics.clone(), METRICS_INTERVAL);

    let mut tasks = Vec::new();
    for (server, listener) in servers {
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let name = server.name().to_string();
            if let Err(e) = server.run_with_shutdown(listener, rx).await {
                log::error!("[{}] 服务器异常退出: {:#}", name, e);
            }
        }));
    }

    log::info!("=== 服务器准备就绪 ===");

    // 等待 Ctrl-C
    tokio::signal::ctrl_c().await.context("监听退出信号失败")?;
    log::info!("🛑 收到 Ctrl-C，开始优雅关闭");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("服务器任务异常: {}", e);
        }
    }
    reporter.abort();

    metrics.print_summary();
    log::info!("=== 服务器已停止 ===");
    Ok(())
}

//! 多路径 HTTP 代理
//!
//! 每个监听配置对应一条过滤器链；出口侧按 IP 列表并发拨号，
//! 先完成握手的连接胜出，失败的地址进入黑名单或降低评分。

pub mod config;
pub mod conn;
pub mod context;
pub mod dialer;
pub mod error;
pub mod filters;
pub mod handler;
pub mod host_matcher;
pub mod http;
pub mod listener;
pub mod logger;
pub mod metrics;
pub mod proxy;
pub mod racer;
pub mod resolver;
pub mod retry;
pub mod server;
pub mod tls;
pub mod ttl_cache;

pub use config::{FileStore, ProfileConfig, ProxyConfig, Store};
pub use error::{Error, Result};
pub use filters::{Filter, FilterChain, FilterEnv, FilterRegistry};
pub use handler::Handler;
pub use listener::{ListenOptions, Listener};
pub use metrics::Metrics;
pub use resolver::{BlackList, Resolver};
pub use server::ProxyServer;

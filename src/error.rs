use std::io;
use std::time::Duration;
use thiserror::Error;

/// 代理核心的错误类型
///
/// 所有错误都以值的形式沿过滤器链向上传递，任何一条拨号/竞速失败都不会让服务任务 panic。
#[derive(Error, Debug)]
pub enum Error {
    /// 底层 I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// 单次操作超时（拨号、握手、读取请求）
    #[error("{op} 超时 ({after:?})")]
    Timeout { op: &'static str, after: Duration },

    /// TLS 握手或配置错误
    #[error("TLS 错误: {0}")]
    Tls(String),

    /// 证书公钥指纹校验失败
    #[error("证书校验失败 {addr}: {reason}")]
    PinMismatch { addr: String, reason: String },

    /// DNS 解析失败
    #[error("解析 {name} 失败: {reason}")]
    Resolve { name: String, reason: String },

    /// 解析成功但全部地址都在黑名单中
    #[error("{name} 没有可用地址")]
    NoUsableAddress { name: String },

    /// 别名不存在
    #[error("别名 {0:?} 不存在")]
    AliasNotFound(String),

    /// 竞速窗口内全部拨号失败，返回最后一个错误
    #[error("{attempts} 个候选地址全部失败, 最后错误: {last}")]
    RaceExhausted { attempts: usize, last: Box<Error> },

    /// 主机匹配规则非法（启动期致命错误）
    #[error("非法的主机规则 {0:?}")]
    InvalidHostRule(String),

    /// 过滤器重复注册（启动期致命错误）
    #[error("过滤器 {0:?} 已注册")]
    DuplicateFilter(String),

    /// 过滤器链引用了未注册的过滤器（启动期致命错误）
    #[error("未知过滤器 {0:?}")]
    UnknownFilter(String),

    /// 过滤器不具备配置中要求的阶段能力
    #[error("过滤器 {name:?} 不是 {stage}")]
    FilterCapability { name: String, stage: &'static str },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 接管客户端连接失败
    #[error("接管连接失败: {0}")]
    Hijack(String),

    /// 没有任何 RoundTrip 过滤器给出响应
    #[error("没有过滤器处理该请求 (过滤器链配置错误)")]
    DeadEnd,

    /// HTTP 协议错误
    #[error("HTTP 错误: {0}")]
    Http(String),

    /// 客户端正常关闭输入，不需要记录
    #[error("end of input")]
    EndOfInput,

    /// 不支持的网络类型
    #[error("不支持的网络类型 {0:?}")]
    UnsupportedNetwork(String),

    /// 监听器已关闭
    #[error("监听器已关闭")]
    ListenerClosed,
}

/// 使用 Error 的 Result 别名
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 创建解析错误
    pub fn resolve(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Resolve {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// 创建 HTTP 协议错误
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http(message.into())
    }

    /// 是否属于瞬时网络错误（写入分数缓存、可在同一请求内重试）
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_) | Error::Timeout { .. } | Error::Tls(_) | Error::PinMismatch { .. } => true,
            Error::RaceExhausted { last, .. } => last.is_transient(),
            _ => false,
        }
    }

    /// 是否属于启动期致命的配置错误
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::InvalidHostRule(_)
                | Error::DuplicateFilter(_)
                | Error::UnknownFilter(_)
                | Error::FilterCapability { .. }
                | Error::Config(_)
        )
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

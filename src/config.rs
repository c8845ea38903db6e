use bytes::Bytes;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::logger::{LogConfig, LogLevel};
use crate::resolver::ResolverConfig;

/// 存储对象的元信息
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// 存储对象
#[derive(Debug, Clone)]
pub struct Object {
    pub meta: ObjectMeta,
    pub body: Bytes,
}

/// 配置存储
///
/// 只在启动时读取过滤器配置，没有运行期依赖。
pub trait Store: Send + Sync {
    fn get(&self, name: &str) -> Result<Object>;
    fn head(&self, name: &str) -> Result<ObjectMeta>;
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;
    fn copy(&self, from: &str, to: &str) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> bool {
        self.head(name).is_ok()
    }
}

fn not_found(name: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::NotFound, format!("{} 不存在", name)))
}

fn is_not_found(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

/// 基于目录的存储
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 名字只能是根目录下的相对路径
    fn path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        let valid = !name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(Error::Config(format!("非法的存储路径 {:?}", name)));
        }
        Ok(self.root.join(rel))
    }
}

impl Store for FileStore {
    fn get(&self, name: &str) -> Result<Object> {
        let meta = self.head(name)?;
        let body = std::fs::read(self.path(name)?)?;
        Ok(Object {
            meta,
            body: Bytes::from(body),
        })
    }

    fn head(&self, name: &str) -> Result<ObjectMeta> {
        let path = self.path(name)?;
        let md = std::fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(name),
            _ => Error::Io(e),
        })?;
        if !md.is_file() {
            return Err(not_found(name));
        }
        Ok(ObjectMeta {
            name: name.to_string(),
            size: md.len(),
            modified: md.modified().ok(),
        })
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let src = self.path(from)?;
        let dst = self.path(to)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.path(name)?).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(name),
            _ => Error::Io(e),
        })
    }
}

/// 内存存储，适合测试和内置默认配置
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, (Bytes, SystemTime)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, data: impl Into<Bytes>) -> Self {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), (data.into(), SystemTime::now()));
        self
    }
}

impl Store for MemoryStore {
    fn get(&self, name: &str) -> Result<Object> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let (body, modified) = objects.get(name).ok_or_else(|| not_found(name))?;
        Ok(Object {
            meta: ObjectMeta {
                name: name.to_string(),
                size: body.len() as u64,
                modified: Some(*modified),
            },
            body: body.clone(),
        })
    }

    fn head(&self, name: &str) -> Result<ObjectMeta> {
        self.get(name).map(|o| o.meta)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), (Bytes::copy_from_slice(data), SystemTime::now()));
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> Result<()> {
        let object = self.get(from)?;
        self.put(to, &object.body)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }
}

/// 去掉以 `//` 开头的注释行
fn strip_comments(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 把 `overlay` 深度合并到 `base` 上，对象逐键合并，其余类型直接覆盖
fn merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// `foo.json` -> `foo.user.json`
fn user_name(name: &str) -> String {
    match name.strip_suffix(".json") {
        Some(stem) => format!("{}.user.json", stem),
        None => format!("{}.user", name),
    }
}

fn parse_json(store: &dyn Store, name: &str) -> Result<serde_json::Value> {
    let object = store.get(name)?;
    serde_json::from_str(&strip_comments(&object.body))
        .map_err(|e| Error::Config(format!("解析 {} 失败: {}", name, e)))
}

/// 读取 JSON 配置，存在 `<name>.user.json` 时合并到上面
pub fn read_json<T: DeserializeOwned>(store: &dyn Store, name: &str) -> Result<T> {
    let mut value = parse_json(store, name)?;

    let overlay = user_name(name);
    if store.exists(&overlay) {
        debug!("合并用户配置 {}", overlay);
        merge(&mut value, parse_json(store, &overlay)?);
    }

    serde_json::from_value(value).map_err(|e| Error::Config(format!("{} 格式错误: {}", name, e)))
}

/// 同 `read_json`，配置不存在时使用默认值
pub fn read_json_or_default<T: DeserializeOwned + Default>(store: &dyn Store, name: &str) -> Result<T> {
    match read_json(store, name) {
        Ok(v) => Ok(v),
        Err(e) if is_not_found(&e) => {
            info!("{} 不存在，使用默认配置", name);
            Ok(T::default())
        }
        Err(e) => Err(e),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// 日志配置段
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfigFile {
    /// 日志级别: off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 日志输出目标: stdout, file, both
    #[serde(default = "default_log_output")]
    pub output: String,
    /// 日志文件路径（当 output 为 file 或 both 时需要）
    pub file_path: Option<String>,
    /// 是否启用日志轮转
    #[serde(default)]
    pub enable_rotation: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    /// 保留的日志文件数量
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
    /// 按模块设置级别
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

impl Default for LogConfigFile {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            enable_rotation: false,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            show_timestamp: true,
            show_module: true,
            use_color: true,
            modules: BTreeMap::new(),
        }
    }
}

impl LogConfigFile {
    /// 转换为日志器配置
    pub fn to_log_config(&self) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse()?;

        let mut config = LogConfig::new(level)
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color);

        for (module, level) in &self.modules {
            let level: LogLevel = level
                .parse()
                .map_err(|e| Error::Config(format!("模块 {}: {}", module, e)))?;
            config = config.with_module_level(module.clone(), level);
        }

        let file_path = self
            .file_path
            .clone()
            .unwrap_or_else(|| "logs/multipath-proxy.log".to_string());

        config = match self.output.as_str() {
            "stdout" => return Ok(config),
            "file" => config.with_file(&file_path),
            "both" => config.with_both(&file_path),
            other => return Err(Error::Config(format!("未知日志输出 {:?}", other))),
        };
        if self.enable_rotation {
            config = config.with_rotation(self.max_size_mb * 1024 * 1024, self.max_backups);
        }
        Ok(config)
    }
}

fn default_keep_alive_secs() -> u64 {
    75
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    30
}

/// 一个监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 监听地址，如 127.0.0.1:8087
    pub address: String,

    /// 空闲连接保持时间，0 表示每个请求后关闭
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// 读取请求头超时
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// 最大并发连接数，不设置时按 CPU 核数计算
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// 关闭时等待连接结束的最长时间
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default)]
    pub request_filters: Vec<String>,

    #[serde(default)]
    pub round_trip_filters: Vec<String>,

    #[serde(default)]
    pub response_filters: Vec<String>,
}

fn default_branding() -> String {
    format!("multipath-proxy/{}", env!("CARGO_PKG_VERSION"))
}

/// 主配置 httpproxy.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// 出现在错误响应中的软件名
    #[serde(default = "default_branding")]
    pub branding: String,

    #[serde(default)]
    pub log: LogConfigFile,

    /// 所有过滤器共用的解析器配置
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// 配置名 -> 监听配置
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            branding: default_branding(),
            log: LogConfigFile::default(),
            resolver: ResolverConfig::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl ProxyConfig {
    /// 启用的监听配置
    pub fn enabled_profiles(&self) -> impl Iterator<Item = (&String, &ProfileConfig)> {
        self.profiles.iter().filter(|(_, p)| p.enabled)
    }
}

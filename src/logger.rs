//! 日志
//!
//! `log` 门面之上的自定义日志器：标准输出和文件可以同时开启，文件可按大小轮转，
//! 支持按模块覆盖级别。

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let level = match s.to_ascii_lowercase().as_str() {
            "off" => LogLevel::Off,
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => return Err(Error::Config(format!("未知日志级别 {:?}", s))),
        };
        Ok(level)
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// 按大小轮转：`x.log` 写满后依次改名为 `x.log.1 .. x.log.N`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub max_size: u64,
    pub max_backups: usize,
}

/// 日志文件
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub rotation: Option<Rotation>,
}

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对标准输出生效，文件里永远不带颜色
    pub use_color: bool,
    pub stdout: bool,
    pub file: Option<LogFile>,
    /// 按模块覆盖的级别，最长前缀在前
    pub module_levels: Vec<(String, LogLevel)>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            stdout: true,
            file: None,
            module_levels: Vec::new(),
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    /// 为某个模块及其子模块单独设置级别
    pub fn with_module_level(mut self, module: impl Into<String>, level: LogLevel) -> Self {
        self.module_levels.push((module.into(), level));
        self.module_levels
            .sort_by_key(|(module, _)| std::cmp::Reverse(module.len()));
        self
    }

    /// 只写文件
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdout = false;
        self.file = Some(LogFile {
            path: path.as_ref().to_path_buf(),
            rotation: None,
        });
        self
    }

    /// 标准输出和文件都写
    pub fn with_both<P: AsRef<Path>>(self, path: P) -> Self {
        let mut config = self.with_file(path);
        config.stdout = true;
        config
    }

    /// 给已配置的日志文件开启轮转，没有文件时无效
    pub fn with_rotation(mut self, max_size: u64, max_backups: usize) -> Self {
        if let Some(file) = &mut self.file {
            file.rotation = Some(Rotation {
                max_size: max_size.max(1),
                max_backups,
            });
        }
        self
    }

    fn level_for(&self, target: &str) -> LevelFilter {
        let matched = self.module_levels.iter().find(|(module, _)| {
            target
                .strip_prefix(module.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        });
        match matched {
            Some((_, level)) => (*level).into(),
            None => self.level.into(),
        }
    }

    fn max_level(&self) -> LevelFilter {
        self.module_levels
            .iter()
            .map(|(_, level)| LevelFilter::from(*level))
            .fold(self.level.into(), Ord::max)
    }
}

/// 可轮转的日志文件写入器
struct RollingFile {
    path: PathBuf,
    rotation: Option<Rotation>,
    file: File,
    written: u64,
}

impl RollingFile {
    fn open(log_file: &LogFile) -> io::Result<Self> {
        if let Some(dir) = log_file.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = open_append(&log_file.path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: log_file.path.clone(),
            rotation: log_file.rotation,
            file,
            written,
        })
    }

    fn backup(&self, n: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        if let Some(rotation) = self.rotation {
            if self.written > 0 && self.written + line.len() as u64 > rotation.max_size {
                self.roll(rotation.max_backups)?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.written += line.len() as u64;
        Ok(())
    }

    fn roll(&mut self, max_backups: usize) -> io::Result<()> {
        self.file.flush()?;
        if max_backups == 0 {
            // 不保留备份，直接清空
            self.file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        } else {
            let _ = fs::remove_file(self.backup(max_backups));
            for n in (1..max_backups).rev() {
                let from = self.backup(n);
                if from.exists() {
                    fs::rename(&from, self.backup(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup(1))?;
            self.file = open_append(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

struct ProxyLogger {
    config: LogConfig,
    file: Option<Mutex<RollingFile>>,
}

fn level_label(level: Level, color: bool) -> &'static str {
    match (level, color) {
        (Level::Error, true) => "\x1b[31mERROR\x1b[0m",
        (Level::Warn, true) => "\x1b[33mWARN \x1b[0m",
        (Level::Info, true) => "\x1b[32mINFO \x1b[0m",
        (Level::Debug, true) => "\x1b[36mDEBUG\x1b[0m",
        (Level::Trace, true) => "\x1b[35mTRACE\x1b[0m",
        (Level::Error, false) => "ERROR",
        (Level::Warn, false) => "WARN ",
        (Level::Info, false) => "INFO ",
        (Level::Debug, false) => "DEBUG",
        (Level::Trace, false) => "TRACE",
    }
}

impl ProxyLogger {
    fn render(&self, record: &Record, color: bool) -> String {
        let mut line = String::with_capacity(128);
        if self.config.show_timestamp {
            let _ = write!(line, "[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));
        }
        line.push_str(level_label(record.level(), color));
        line.push(' ');
        if self.config.show_module {
            if let Some(module) = record.module_path() {
                let _ = write!(line, "[{}] ", module);
            }
        }
        let _ = write!(line, "{}", record.args());
        line
    }
}

impl Log for ProxyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level_for(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.config.stdout {
            let line = self.render(record, self.config.use_color);
            let _ = writeln!(io::stdout().lock(), "{}", line);
        }

        if let Some(file) = &self.file {
            let mut line = self.render(record, false);
            line.push('\n');
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = file.append(&line);
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            let _ = file.file.flush();
        }
    }
}

/// 安装日志器
///
/// ```no_run
/// use multipath_proxy::logger::{init_logger, LogConfig, LogLevel};
///
/// // 同时写标准输出和文件，10MB 轮转保留 5 个，竞速模块打开调试日志
/// let config = LogConfig::new(LogLevel::Info)
///     .with_both("logs/proxy.log")
///     .with_rotation(10 * 1024 * 1024, 5)
///     .with_module_level("multipath_proxy::racer", LogLevel::Debug);
/// init_logger(config).unwrap();
/// ```
pub fn init_logger(config: LogConfig) -> Result<()> {
    let file = match &config.file {
        Some(log_file) => {
            let file = RollingFile::open(log_file).map_err(|e| {
                Error::Config(format!("无法创建日志文件 {}: {}", log_file.path.display(), e))
            })?;
            Some(Mutex::new(file))
        }
        None => None,
    };

    let max_level = config.max_level();
    log::set_boxed_logger(Box::new(ProxyLogger { config, file }))
        .map_err(|e| Error::Config(format!("设置日志器失败: {}", e)))?;
    log::set_max_level(max_level);
    Ok(())
}

/// 交给 env_logger，读取 RUST_LOG，未设置时为 info
///
/// ```bash
/// RUST_LOG=info,multipath_proxy::racer=debug ./multipath-proxy
/// ```
pub fn init_from_env() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init()
        .map_err(|e| Error::Config(format!("设置日志器失败: {}", e)))
}

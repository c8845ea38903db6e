use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::conn::ClientConn;
use crate::error::{Error, Result};
use crate::listener::Listener;

/// 过滤器之间传递的值
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Map(HashMap<String, String>),
}

/// 单个请求的上下文
///
/// 每个请求创建一个，持有所属监听器、客户端连接、过滤器间共享的键值、
/// 接管标记以及给出响应的 RoundTrip 过滤器名。
#[derive(Default)]
pub struct Context {
    listener: Option<Arc<Listener>>,
    conn: Option<ClientConn>,
    remote_addr: Option<SocketAddr>,
    tls_server_name: Option<String>,
    values: HashMap<String, Value>,
    hijacked: bool,
    round_trip_filter: Option<&'static str>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: Arc<Listener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_conn(mut self, conn: ClientConn) -> Self {
        self.remote_addr = Some(conn.remote_addr());
        self.tls_server_name = conn.tls_server_name().map(str::to_string);
        self.conn = Some(conn);
        self
    }

    pub fn listener(&self) -> Option<&Arc<Listener>> {
        self.listener.as_ref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    /// 接管客户端连接，之后处理器不会再写这条连接
    pub fn hijack(&mut self) -> Result<ClientConn> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Hijack("连接已被接管或不可接管".to_string()))?;
        self.hijacked = true;
        Ok(conn)
    }

    pub fn set_hijacked(&mut self, hijacked: bool) {
        self.hijacked = hijacked;
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// 取回客户端连接（处理器写响应时使用）
    pub fn take_conn(&mut self) -> Option<ClientConn> {
        self.conn.take()
    }

    pub fn set_round_trip_filter(&mut self, name: &'static str) {
        self.round_trip_filter = Some(name);
    }

    pub fn round_trip_filter(&self) -> Option<&'static str> {
        self.round_trip_filter
    }

    pub fn put_string(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), Value::Str(value.into()));
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.values.insert(key.to_string(), Value::Bool(value));
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn put_int(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), Value::Int(value));
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn put_map(&mut self, key: &str, value: HashMap<String, String>) {
        self.values.insert(key.to_string(), Value::Map(value));
    }

    pub fn get_map(&self, key: &str) -> Option<&HashMap<String, String>> {
        match self.values.get(key) {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_values() {
        let mut ctx = Context::new();
        assert_eq!(ctx.get_string("a"), None);

        ctx.put_string("a", "x");
        ctx.put_bool("b", true);
        ctx.put_int("c", -3);
        ctx.put_map("d", HashMap::from([("k".to_string(), "v".to_string())]));

        assert_eq!(ctx.get_string("a"), Some("x"));
        assert_eq!(ctx.get_bool("b"), Some(true));
        assert_eq!(ctx.get_int("c"), Some(-3));
        assert_eq!(ctx.get_map("d").unwrap()["k"], "v");

        // 类型不符视为不存在
        assert_eq!(ctx.get_int("a"), None);
        assert_eq!(ctx.get_bool("c"), None);

        ctx.put_int("a", 1);
        assert_eq!(ctx.get_string("a"), None);
        assert_eq!(ctx.get_int("a"), Some(1));
    }

    #[test]
    fn test_hijack() {
        let (stream, _peer) = tokio::io::duplex(64);
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();
        let conn = ClientConn::new(Box::new(stream), addr).with_tls_server_name("example.com");

        let mut ctx = Context::new().with_conn(conn);
        assert_eq!(ctx.remote_addr(), Some(addr));
        assert_eq!(ctx.tls_server_name(), Some("example.com"));
        assert!(!ctx.is_hijacked());

        let taken = ctx.hijack().unwrap();
        assert_eq!(taken.remote_addr(), addr);
        assert!(ctx.is_hijacked());
        assert!(ctx.take_conn().is_none());
        assert!(matches!(ctx.hijack(), Err(Error::Hijack(_))));
        // 接管后仍然可以查询客户端地址
        assert_eq!(ctx.remote_addr(), Some(addr));
    }
}

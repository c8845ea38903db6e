use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{self, AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// 能报告对端地址的连接
///
/// 各层包装类型（TLS、预读缓冲、Box）都把查询转发给内层，
/// 日志和错误页面通过它拿到真实的远端地址。
pub trait PeerAddr {
    fn peer(&self) -> Option<SocketAddr>;
}

impl PeerAddr for TcpStream {
    fn peer(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl<S: PeerAddr> PeerAddr for tokio_rustls::client::TlsStream<S> {
    fn peer(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer()
    }
}

impl<S: PeerAddr> PeerAddr for tokio_rustls::server::TlsStream<S> {
    fn peer(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer()
    }
}

impl<T: PeerAddr + ?Sized> PeerAddr for Box<T> {
    fn peer(&self) -> Option<SocketAddr> {
        (**self).peer()
    }
}

impl PeerAddr for io::DuplexStream {
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

/// 代理内部流转的双向字节流
pub trait ProxyStream: AsyncRead + AsyncWrite + PeerAddr + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + PeerAddr + Send + Unpin> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// 初始缓冲容量
const INITIAL_CAPACITY: usize = 4 * 1024;

/// 可手动预读的流包装
///
/// 先把数据读入内部缓冲供解析，未消费的部分在之后的普通读取中原样返回。写入直接透传。
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_len,
        }
    }

    /// 未消费的缓冲数据
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// 丢弃缓冲区开头的 `n` 个字节
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// 从缓冲区开头取出 `n` 个字节
    pub fn take_buffered(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// 从内层继续读入缓冲区，返回 0 表示 EOF 或缓冲区已满
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// 拆出缓冲数据和内层流
    pub fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncBufRead for Prebuffered<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.buf.is_empty() {
            let mut chunk = [0u8; 8 * 1024];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            this.buf.extend_from_slice(read.filled());
        }
        Poll::Ready(Ok(&this.buf[..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        self.get_mut().discard(amt);
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for Prebuffered<R> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<R: PeerAddr> PeerAddr for Prebuffered<R> {
    fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer()
    }
}

/// 在途连接计数，用于优雅关闭时等待连接排空
#[derive(Debug, Default)]
pub struct ConnTracker {
    active: AtomicUsize,
    notify: Notify,
}

impl ConnTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记一条连接，守卫被丢弃时自动注销
    pub fn track(self: &Arc<Self>) -> TrackGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        TrackGuard(Arc::clone(self))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 等待所有登记的连接关闭
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 先注册再检查计数，避免错过唤醒
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// 连接登记守卫
#[derive(Debug)]
pub struct TrackGuard(Arc<ConnTracker>);

impl Drop for TrackGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

/// 客户端连接读取请求头时的最大预读长度
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// 一条客户端连接
///
/// 可能来自监听套接字，也可能是过滤器终结 TLS 之后通过 `Listener::add` 注入的明文连接。
pub struct ClientConn {
    stream: Prebuffered<BoxedStream>,
    remote_addr: SocketAddr,
    tls_server_name: Option<String>,
    tracker: Option<TrackGuard>,
}

impl ClientConn {
    pub fn new(stream: BoxedStream, remote_addr: SocketAddr) -> Self {
        Self {
            stream: Prebuffered::new(stream, MAX_HEADER_BYTES),
            remote_addr,
            tls_server_name: None,
            tracker: None,
        }
    }

    /// 标记为 TLS 终结后的连接，请求 URL 将按 https 补全
    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn with_tracker(mut self, guard: TrackGuard) -> Self {
        self.tracker = Some(guard);
        self
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls_server_name.as_deref()
    }

    pub fn is_tracked(&self) -> bool {
        self.tracker.is_some()
    }

    pub fn stream_mut(&mut self) -> &mut Prebuffered<BoxedStream> {
        &mut self.stream
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, out)
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl PeerAddr for ClientConn {
    fn peer(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }
}

use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::conn::{ClientConn, ConnTracker};
use crate::error::{Error, Result};
use crate::retry::Backoff;

/// 继承监听套接字的环境变量前缀，完整名字为 `LISTEN_FD_<端口>`
pub const LISTEN_FD_PREFIX: &str = "LISTEN_FD_";

/// 监听选项
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// 已接受连接的 TCP keepalive 间隔
    pub keep_alive: Option<Duration>,
    /// listen backlog
    pub backlog: i32,
    /// 内部连接队列长度
    pub lane_size: usize,
    /// 是否尝试从环境变量继承监听套接字
    pub inherit: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            keep_alive: Some(Duration::from_secs(60)),
            backlog: 4096,
            lane_size: 1000,
            inherit: true,
        }
    }
}

/// 监听器
///
/// 后台任务不断 accept 并把连接放入内部队列；过滤器也可以通过 `add` 把自己建立的连接
/// （例如终结 TLS 后的明文连接）放入同一个队列，`accept` 对两者一视同仁。
/// 所有经过监听器的连接都会被跟踪，`wait` 等待它们全部关闭。
/// accept 遇到不可恢复的错误时，错误先交给 `accept` 的调用方，之后监听器视为已关闭。
pub struct Listener {
    local_addr: SocketAddr,
    lane_tx: mpsc::Sender<Result<ClientConn>>,
    lane_rx: Mutex<mpsc::Receiver<Result<ClientConn>>>,
    tracker: Arc<ConnTracker>,
    closed_tx: Arc<watch::Sender<bool>>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// 绑定地址并启动 accept 任务
    pub async fn bind(addr: SocketAddr, opts: ListenOptions) -> Result<Arc<Self>> {
        let std_listener = match opts.inherit.then(|| inherited_listener(addr.port())).flatten() {
            Some(l) => {
                info!("♻️  继承监听套接字 {}", addr);
                l
            }
            None => bind_socket(addr, opts.backlog)?,
        };
        std_listener.set_nonblocking(true)?;
        let listener = Arc::new(TcpListener::from_std(std_listener)?);
        let local_addr = listener.local_addr()?;

        let keep_alive = opts.keep_alive;
        let next = move || {
            let listener = Arc::clone(&listener);
            async move {
                let (stream, addr) = listener.accept().await?;
                configure_accepted(&stream, keep_alive);
                Ok::<_, io::Error>(ClientConn::new(Box::new(stream), addr))
            }
        };

        info!("✅ 监听 {} (backlog {})", local_addr, opts.backlog);
        Ok(Self::start(local_addr, opts.lane_size, next))
    }

    /// 创建队列并在后台运行 accept 循环，`next` 每次产出一条新连接
    fn start<F, Fut>(local_addr: SocketAddr, lane_size: usize, next: F) -> Arc<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<ClientConn>> + Send + 'static,
    {
        let (lane_tx, lane_rx) = mpsc::channel(lane_size.max(1));
        let closed_tx = Arc::new(watch::channel(false).0);
        let tracker = ConnTracker::new();

        let task = tokio::spawn(accept_loop(
            next,
            lane_tx.clone(),
            Arc::clone(&tracker),
            Arc::clone(&closed_tx),
            local_addr,
        ));

        Arc::new(Self {
            local_addr,
            lane_tx,
            lane_rx: Mutex::new(lane_rx),
            tracker,
            closed_tx,
            accept_task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 取下一条连接
    ///
    /// 关闭前已经排队的连接和错误仍会依次返回，队列取空后返回 `ListenerClosed`。
    pub async fn accept(&self) -> Result<ClientConn> {
        let mut closed = self.closed_tx.subscribe();
        let mut rx = self.lane_rx.lock().await;
        tokio::select! {
            biased;
            item = rx.recv() => item.unwrap_or(Err(Error::ListenerClosed)),
            _ = closed.wait_for(|c| *c) => Err(Error::ListenerClosed),
        }
    }

    /// 把外部建立的连接放入队列
    pub async fn add(&self, conn: ClientConn) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }
        let conn = conn.with_tracker(self.tracker.track());
        debug!("注入连接 {} -> {}", conn.remote_addr(), self.local_addr);
        self.lane_tx
            .send(Ok(conn))
            .await
            .map_err(|_| Error::ListenerClosed)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// 停止接受新连接，已接受的连接不受影响
    pub fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        info!("🛑 监听器 {} 已关闭", self.local_addr);
    }

    /// 仍在使用中的连接数
    pub fn active(&self) -> usize {
        self.tracker.active()
    }

    /// 等待所有经过本监听器的连接关闭
    pub async fn wait(&self) {
        self.tracker.wait().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self
            .accept_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// 创建监听套接字（地址重用 + 大 backlog）
fn bind_socket(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).ok();
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// 从 `LISTEN_FD_<port>` 继承的监听套接字
#[cfg(unix)]
fn inherited_listener(port: u16) -> Option<std::net::TcpListener> {
    use std::os::unix::io::{FromRawFd, RawFd};

    let key = format!("{}{}", LISTEN_FD_PREFIX, port);
    let fd: RawFd = std::env::var(&key).ok()?.trim().parse().ok()?;
    if fd < 0 {
        return None;
    }

    // SAFETY: fd 来自父进程交接的监听套接字，这里取得其唯一所有权；
    // 先用 fcntl 确认它是有效的描述符
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        warn!("{}={} 不是有效的文件描述符", key, fd);
        return None;
    }
    std::env::remove_var(&key);
    Some(unsafe { std::net::TcpListener::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn inherited_listener(_port: u16) -> Option<std::net::TcpListener> {
    None
}

/// accept 错误是否可以重试
pub fn is_temporary(err: &io::Error) -> bool {
    use io::ErrorKind::*;
    if matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(
                code,
                libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO
            );
        }
    }
    false
}

fn configure_accepted(stream: &TcpStream, keep_alive: Option<Duration>) {
    let _ = stream.set_nodelay(true);
    if let Some(idle) = keep_alive {
        let keepalive = socket2::TcpKeepalive::new().with_time(idle);
        let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive);
    }
}

async fn accept_loop<F, Fut>(
    mut next: F,
    lane: mpsc::Sender<Result<ClientConn>>,
    tracker: Arc<ConnTracker>,
    closed_tx: Arc<watch::Sender<bool>>,
    local_addr: SocketAddr,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<ClientConn>>,
{
    let mut closed = closed_tx.subscribe();
    let mut backoff = Backoff::default();
    loop {
        let accepted = tokio::select! {
            res = next() => res,
            _ = closed.wait_for(|c| *c) => return,
        };

        match accepted {
            Ok(conn) => {
                backoff.reset();
                let conn = conn.with_tracker(tracker.track());
                if lane.send(Ok(conn)).await.is_err() {
                    return;
                }
            }
            Err(e) if is_temporary(&e) => {
                let delay = backoff.next_delay();
                warn!("accept 错误: {}; {:?} 后重试", e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("❌ {} accept 失败，停止监听: {}", local_addr, e);
                let _ = lane.send(Err(Error::Io(e))).await;
                closed_tx.send_replace(true);
                return;
            }
        }
    }
}

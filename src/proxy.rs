use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::metrics::Metrics;

/// 隧道缓冲区大小
const TUNNEL_BUF: usize = 64 * 1024;

/// 双向转发数据（CONNECT 隧道）
///
/// 任一方向结束后另一方向也随之结束，返回 (上行字节数, 下行字节数)。
pub async fn tunnel<C, R>(client: C, remote: R, metrics: &Metrics) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let metrics_up = metrics.clone();
    let client_to_remote = async move {
        let mut buf = vec![0u8; TUNNEL_BUF];
        let mut total = 0u64;
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("客户端到远端的数据传输结束: {}", e);
                    break;
                }
            };
            if let Err(e) = remote_write.write_all(&buf[..n]).await {
                debug!("写入远端失败: {}", e);
                break;
            }
            total += n as u64;
            metrics_up.add_bytes_up(n as u64);
        }
        let _ = remote_write.shutdown().await;
        total
    };

    let metrics_down = metrics.clone();
    let remote_to_client = async move {
        let mut buf = vec![0u8; TUNNEL_BUF];
        let mut total = 0u64;
        loop {
            let n = match remote_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("远端到客户端的数据传输结束: {}", e);
                    break;
                }
            };
            if let Err(e) = client_write.write_all(&buf[..n]).await {
                debug!("写入客户端失败: {}", e);
                break;
            }
            total += n as u64;
            metrics_down.add_bytes_down(n as u64);
        }
        let _ = client_write.shutdown().await;
        total
    };

    tokio::pin!(client_to_remote);
    tokio::pin!(remote_to_client);

    // 一个方向结束后给另一方向一点时间把剩余数据送完
    tokio::select! {
        up = &mut client_to_remote => {
            let down = tokio::time::timeout(LINGER, &mut remote_to_client).await.unwrap_or(0);
            (up, down)
        }
        down = &mut remote_to_client => {
            let up = tokio::time::timeout(LINGER, &mut client_to_remote).await.unwrap_or(0);
            (up, down)
        }
    }
}

/// 半关闭后等待另一方向的时间
const LINGER: std::time::Duration = std::time::Duration::from_secs(2);

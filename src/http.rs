use crate::conn::{BoxedStream, PeerAddr, Prebuffered, MAX_HEADER_BYTES};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use log::trace;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 请求体在读取时完整缓冲（重试时需要重放）
pub type Request = http::Request<Bytes>;
pub type Response = http::Response<Body>;

/// 单个请求/响应头的最大数量
const MAX_HEADERS: usize = 100;
/// 请求体上限
pub const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;
/// 分块长度行的上限
const MAX_LINE: u64 = 4096;

/// 响应附带的上游对端地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// 响应体
pub enum Body {
    Empty,
    Full(Bytes),
    /// 流式响应体，`length` 为 None 时长度未知
    Stream {
        stream: BoxStream<'static, io::Result<Bytes>>,
        length: Option<u64>,
    },
}

impl Body {
    pub fn full(data: impl Into<Bytes>) -> Self {
        Body::Full(data.into())
    }

    pub fn stream(stream: BoxStream<'static, io::Result<Bytes>>, length: Option<u64>) -> Self {
        Body::Stream { stream, length }
    }

    /// 已知长度
    pub fn length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(data) => Some(data.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }

    /// 转换为数据块流
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            Body::Empty => stream::empty().boxed(),
            Body::Full(data) => stream::once(futures::future::ready(Ok::<_, io::Error>(data))).boxed(),
            Body::Stream { stream, .. } => stream,
        }
    }

    /// 读完整个响应体
    pub async fn collect(self, limit: usize) -> Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(data) => Ok(data),
            Body::Stream { mut stream, .. } => {
                let mut out = BytesMut::new();
                while let Some(chunk) = stream.try_next().await? {
                    if out.len() + chunk.len() > limit {
                        return Err(Error::http("响应体过大"));
                    }
                    out.extend_from_slice(&chunk);
                }
                Ok(out.freeze())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(data) => write!(f, "Body::Full({} bytes)", data.len()),
            Body::Stream { length, .. } => write!(f, "Body::Stream(length={:?})", length),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Body::Full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Body::Full(Bytes::from(data))
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Body::Full(Bytes::from_static(data.as_bytes()))
    }
}

/// 构造一个简单的响应
pub fn simple_response(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

/// 从客户端连接读取一个请求
///
/// 连接在请求之间正常关闭时返回 `EndOfInput`。
pub async fn read_request<R: AsyncRead + Unpin>(conn: &mut Prebuffered<R>) -> Result<Request> {
    let (mut parts, consumed) = loop {
        if let Some(parsed) = parse_request_head(conn.buffer())? {
            break parsed;
        }
        if conn.is_full() {
            return Err(Error::http("请求头过大"));
        }
        if conn.buffer_more().await? == 0 {
            return Err(if conn.buffer().iter().all(|b| b.is_ascii_whitespace()) {
                Error::EndOfInput
            } else {
                Error::http("请求头不完整")
            });
        }
    };
    conn.discard(consumed);

    let body = if parts.method == Method::CONNECT {
        Bytes::new()
    } else if is_chunked(&parts.headers) {
        let body = read_chunked(conn, MAX_REQUEST_BODY).await?;
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        body
    } else if let Some(len) = content_length(&parts.headers)? {
        if len > MAX_REQUEST_BODY as u64 {
            return Err(Error::http(format!("请求体过大: {}", len)));
        }
        let mut body = vec![0u8; len as usize];
        conn.read_exact(&mut body).await?;
        Bytes::from(body)
    } else {
        Bytes::new()
    };

    Ok(Request::from_parts(parts, body))
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(http::request::Parts, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let consumed = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method = Method::from_bytes(req.method.unwrap_or("GET").as_bytes())
        .map_err(|e| Error::http(e.to_string()))?;
    let uri: Uri = req
        .path
        .unwrap_or("/")
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::http(e.to_string()))?;

    let mut builder = http::Request::builder()
        .method(method)
        .uri(uri)
        .version(version_of(req.version));
    for h in req.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok(Some((parts, consumed)))
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(http::response::Parts, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let consumed = match resp.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let mut builder = http::Response::builder()
        .status(resp.code.unwrap_or(502))
        .version(version_of(resp.version));
    for h in resp.headers.iter() {
        builder = builder.header(h.name, h.value);
    }
    let (parts, ()) = builder.body(())?.into_parts();
    Ok(Some((parts, consumed)))
}

fn version_of(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

async fn read_response_head<R: AsyncRead + Unpin>(
    upstream: &mut Prebuffered<R>,
) -> Result<http::response::Parts> {
    loop {
        if let Some((parts, consumed)) = parse_response_head(upstream.buffer())? {
            upstream.discard(consumed);
            return Ok(parts);
        }
        if upstream.is_full() {
            return Err(Error::http("响应头过大"));
        }
        if upstream.buffer_more().await? == 0 {
            return Err(Error::http("上游在响应头之前关闭连接"));
        }
    }
}

/// Content-Length 的值
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| Error::http(format!("非法的 Content-Length: {:?}", value))),
    }
}

/// 是否使用分块传输编码
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map_or(false, |v| v.trim().eq_ignore_ascii_case("chunked"))
}

/// 逐跳头部，不转发
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::TE
        || name == header::TRAILER
        || name == header::UPGRADE
        || name == header::PROXY_AUTHORIZATION
        || name == header::PROXY_AUTHENTICATE
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}

/// 客户端是否希望保持连接
pub fn wants_keep_alive(req: &Request) -> bool {
    let tokens = |name: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect::<Vec<_>>()
    };
    let mut conn_tokens = tokens("connection");
    conn_tokens.extend(tokens("proxy-connection"));

    match req.version() {
        Version::HTTP_10 => conn_tokens.iter().any(|t| t == "keep-alive"),
        _ => !conn_tokens.iter().any(|t| t == "close"),
    }
}

/// 请求的目标主机和端口
///
/// CONNECT 取请求目标，其余请求优先取绝对 URI，然后是 Host 头。
pub fn target_host_port(req: &Request) -> Option<(String, u16)> {
    let uri = req.uri();
    let default_port = if req.method() == Method::CONNECT || uri.scheme() == Some(&http::uri::Scheme::HTTPS) {
        443
    } else {
        80
    };

    if let Some(authority) = uri.authority() {
        let host = authority.host().trim_matches(|c| c == '[' || c == ']');
        return Some((host.to_string(), authority.port_u16().unwrap_or(default_port)));
    }

    let host = req.headers().get(header::HOST)?.to_str().ok()?;
    let authority: http::uri::Authority = host.parse().ok()?;
    Some((
        authority.host().trim_matches(|c| c == '[' || c == ']').to_string(),
        authority.port_u16().unwrap_or(default_port),
    ))
}

/// 拼接 host:port（IPv6 加方括号）
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// CONNECT 隧道建立成功的响应
pub async fn write_tunnel_established<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
    w.flush().await?;
    Ok(())
}

/// 写响应时的选项
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// 对应请求是 HEAD，只写头部
    pub head_only: bool,
    /// 客户端是 HTTP/1.0，不能使用分块编码
    pub http10: bool,
    pub keep_alive: bool,
}

/// 写出响应的结果
#[derive(Debug, Clone, Copy)]
pub struct Written {
    pub body_bytes: u64,
    /// 连接是否还能继续使用
    pub keep_alive: bool,
}

/// 把响应写给客户端
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    resp: Response,
    opts: WriteOptions,
) -> Result<Written> {
    let (parts, body) = resp.into_parts();
    let status = parts.status;
    let no_body = opts.head_only
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let length = body.length();
    let chunked = !no_body && length.is_none() && !opts.http10;
    // 长度未知又不能分块时只能靠关闭连接来结束响应体
    let keep_alive = opts.keep_alive && (no_body || length.is_some() || chunked);

    let mut head = BytesMut::with_capacity(512);
    head.put_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop(name) || (name == header::CONTENT_LENGTH && !opts.head_only) {
            continue;
        }
        put_header(&mut head, name.as_str(), value.as_bytes());
    }
    if !no_body {
        match length {
            Some(n) => put_header(&mut head, "Content-Length", n.to_string().as_bytes()),
            None if chunked => put_header(&mut head, "Transfer-Encoding", b"chunked"),
            None => {}
        }
    }
    put_header(
        &mut head,
        "Connection",
        if keep_alive { &b"keep-alive"[..] } else { &b"close"[..] },
    );
    head.put_slice(b"\r\n");
    w.write_all(&head).await?;

    let mut body_bytes = 0u64;
    if !no_body {
        let mut stream = body.into_stream();
        while let Some(chunk) = stream.try_next().await? {
            if chunk.is_empty() {
                continue;
            }
            if chunked {
                w.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                w.write_all(&chunk).await?;
                w.write_all(b"\r\n").await?;
            } else {
                w.write_all(&chunk).await?;
            }
            body_bytes += chunk.len() as u64;
        }
        if chunked {
            w.write_all(b"0\r\n\r\n").await?;
        }
    }
    w.flush().await?;

    Ok(Written {
        body_bytes,
        keep_alive,
    })
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// 编码发往上游的请求头（origin-form，短连接）
fn encode_request_head(req: &Request) -> BytesMut {
    let uri = req.uri();
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());

    let mut head = BytesMut::with_capacity(512);
    head.put_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());

    if !req.headers().contains_key(header::HOST) {
        if let Some(authority) = uri.authority() {
            put_header(&mut head, "Host", authority.as_str().as_bytes());
        }
    }

    // Connection 头中列出的字段同样是逐跳的
    let listed: Vec<String> = req
        .headers()
        .get_all(header::CONNECTION)
        .iter()
        .chain(req.headers().get_all("proxy-connection").iter())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in req.headers().iter() {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        put_header(&mut head, name.as_str(), value.as_bytes());
    }

    let body_len = req.body().len();
    if body_len > 0 || [Method::POST, Method::PUT, Method::PATCH].contains(req.method()) {
        put_header(&mut head, "Content-Length", body_len.to_string().as_bytes());
    }
    put_header(&mut head, "Connection", b"close");
    head.put_slice(b"\r\n");
    head
}

/// 通过已建立的上游连接发送请求并读取响应头
///
/// 响应体以流的形式返回，读取时才从上游拉取数据。响应扩展中带有 `RemoteAddr`。
pub async fn send_request(stream: BoxedStream, req: &Request) -> Result<Response> {
    let peer = stream.peer();
    let mut upstream = Prebuffered::new(stream, MAX_HEADER_BYTES);

    upstream.write_all(&encode_request_head(req)).await?;
    if !req.body().is_empty() {
        upstream.write_all(req.body()).await?;
    }
    upstream.flush().await?;

    let mut parts = loop {
        let parts = read_response_head(&mut upstream).await?;
        if parts.status.is_informational() && parts.status != StatusCode::SWITCHING_PROTOCOLS {
            trace!("跳过 {} 临时响应", parts.status);
            continue;
        }
        break parts;
    };

    let body = response_body(req.method(), &mut parts, upstream);
    let mut resp = Response::from_parts(parts, body);
    if let Some(peer) = peer {
        resp.extensions_mut().insert(RemoteAddr(peer));
    }
    Ok(resp)
}

fn response_body(
    method: &Method,
    parts: &mut http::response::Parts,
    upstream: Prebuffered<BoxedStream>,
) -> Body {
    let status = parts.status;
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Body::Empty;
    }

    if is_chunked(&parts.headers) {
        parts.headers.remove(header::TRANSFER_ENCODING);
        return Body::stream(chunked_stream(upstream), None);
    }

    match content_length(&parts.headers) {
        Ok(Some(0)) => Body::Empty,
        Ok(Some(n)) => Body::stream(sized_stream(upstream, Some(n)), Some(n)),
        _ => Body::stream(sized_stream(upstream, None), None),
    }
}

/// 从缓冲读取器取出最多 `max` 字节，EOF 时返回空
async fn read_some<R: AsyncBufRead + Unpin>(reader: &mut R, max: u64) -> io::Result<Bytes> {
    let buf = reader.fill_buf().await?;
    let n = buf.len().min(usize::try_from(max).unwrap_or(usize::MAX));
    let chunk = Bytes::copy_from_slice(&buf[..n]);
    reader.consume(n);
    Ok(chunk)
}

/// 定长（或读到 EOF）的响应体流
fn sized_stream<R>(reader: R, length: Option<u64>) -> BoxStream<'static, io::Result<Bytes>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    stream::try_unfold((reader, length), |(reader, remaining)| next_sized(reader, remaining)).boxed()
}

async fn next_sized<R: AsyncBufRead + Unpin>(
    mut reader: R,
    remaining: Option<u64>,
) -> io::Result<Option<(Bytes, (R, Option<u64>))>> {
    let want = match remaining {
        Some(0) => return Ok(None),
        Some(n) => n,
        None => u64::MAX,
    };
    let chunk = read_some(&mut reader, want).await?;
    if chunk.is_empty() {
        return match remaining {
            None => Ok(None),
            Some(n) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("响应体提前结束，缺少 {} 字节", n),
            )),
        };
    }
    let remaining = remaining.map(|n| n - chunk.len() as u64);
    Ok(Some((chunk, (reader, remaining))))
}

/// 解码分块编码的响应体流
fn chunked_stream<R>(reader: R) -> BoxStream<'static, io::Result<Bytes>>
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    stream::try_unfold((reader, 0u64), |(reader, remaining)| next_chunk(reader, remaining)).boxed()
}

/// `remaining` 为当前分块尚未读取的字节数
async fn next_chunk<R: AsyncBufRead + Unpin>(
    mut reader: R,
    mut remaining: u64,
) -> io::Result<Option<(Bytes, (R, u64))>> {
    if remaining == 0 {
        remaining = read_chunk_size(&mut reader).await?;
        if remaining == 0 {
            skip_trailers(&mut reader).await?;
            return Ok(None);
        }
    }
    let chunk = read_some(&mut reader, remaining).await?;
    if chunk.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "分块数据提前结束"));
    }
    remaining -= chunk.len() as u64;
    if remaining == 0 {
        read_crlf(&mut reader).await?;
    }
    Ok(Some((chunk, (reader, remaining))))
}

/// 读取完整的分块编码请求体
async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R, limit: usize) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let size = read_chunk_size(reader).await?;
        if size == 0 {
            skip_trailers(reader).await?;
            return Ok(body.freeze());
        }
        let room = limit.saturating_sub(body.len()) as u64;
        if size > room {
            return Err(Error::http("请求体过大"));
        }
        let start = body.len();
        body.resize(start + size as usize, 0);
        reader.read_exact(&mut body[start..]).await?;
        read_crlf(reader).await?;
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut line = String::new();
    let n = reader.take(MAX_LINE).read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "分块编码提前结束"));
    }
    if !line.ends_with('\n') {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "分块编码行过长"));
    }
    Ok(line)
}

async fn read_chunk_size<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let line = read_line(reader).await?;
    let size = line.trim().split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("非法的分块长度 {:?}", size)))
}

async fn read_crlf<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    let line = read_line(reader).await?;
    if line.trim().is_empty() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidData, "分块数据后缺少 CRLF"))
    }
}

async fn skip_trailers<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let line = read_line(reader).await?;
        if line.trim().is_empty() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn client(data: &'static [u8]) -> Prebuffered<&'static [u8]> {
        Prebuffered::new(data, MAX_HEADER_BYTES)
    }

    #[tokio::test]
    async fn test_read_request_with_body() {
        let mut conn = client(
            b"POST http://example.com/submit?x=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\nHost: b.com\r\n\r\n",
        );

        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri().host(), Some("example.com"));
        assert_eq!(&req.body()[..], b"hello");
        assert_eq!(target_host_port(&req), Some(("example.com".to_string(), 80)));

        // 同一连接上的第二个请求
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.uri().path(), "/");
        assert_eq!(target_host_port(&req), Some(("b.com".to_string(), 80)));

        assert!(matches!(read_request(&mut conn).await, Err(Error::EndOfInput)));
    }

    #[tokio::test]
    async fn test_read_chunked_request() {
        let mut conn = client(
            b"PUT /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n",
        );
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(&req.body()[..], b"Wikipedia");
        assert!(!req.headers().contains_key(header::TRANSFER_ENCODING));
        assert_eq!(req.headers()[header::CONTENT_LENGTH], "9");
    }

    #[tokio::test]
    async fn test_read_chunked_request_with_huge_chunk_size() {
        let mut conn = client(
            b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\nffffffffffffffff\r\n",
        );
        assert!(matches!(read_request(&mut conn).await, Err(Error::Http(_))));
    }

    #[tokio::test]
    async fn test_read_connect_request() {
        let mut conn = client(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n");
        let req = read_request(&mut conn).await.unwrap();
        assert_eq!(req.method(), Method::CONNECT);
        assert_eq!(target_host_port(&req), Some(("example.com".to_string(), 8443)));
    }

    #[tokio::test]
    async fn test_read_request_errors() {
        let mut conn = client(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert!(matches!(read_request(&mut conn).await, Err(Error::Http(_))));

        let mut conn = client(b"\x00\x01 garbage\r\n\r\n");
        assert!(read_request(&mut conn).await.is_err());
    }

    #[test]
    fn test_keep_alive_rules() {
        let req = |version, conn: Option<&str>| {
            let mut b = http::Request::builder().uri("/").version(version);
            if let Some(c) = conn {
                b = b.header("Connection", c);
            }
            b.body(Bytes::new()).unwrap()
        };
        assert!(wants_keep_alive(&req(Version::HTTP_11, None)));
        assert!(!wants_keep_alive(&req(Version::HTTP_11, Some("close"))));
        assert!(!wants_keep_alive(&req(Version::HTTP_10, None)));
        assert!(wants_keep_alive(&req(Version::HTTP_10, Some("Keep-Alive"))));
    }

    async fn written(resp: Response, opts: WriteOptions) -> (String, Written) {
        let mut out = Vec::new();
        let w = write_response(&mut out, resp, opts).await.unwrap();
        (String::from_utf8(out).unwrap(), w)
    }

    const KEEP: WriteOptions = WriteOptions {
        head_only: false,
        http10: false,
        keep_alive: true,
    };

    #[tokio::test]
    async fn test_write_response_framing() {
        let (text, w) = written(simple_response(StatusCode::OK, "text/plain", "hi"), KEEP).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
        assert_eq!(w.body_bytes, 2);

        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cde"))]).boxed();
        let resp = Response::new(Body::stream(chunks, None));
        let (text, w) = written(resp, KEEP).await;
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n2\r\nab\r\n3\r\ncde\r\n0\r\n\r\n"));
        assert!(w.keep_alive);

        // HTTP/1.0 客户端只能靠关闭连接结束
        let chunks = stream::iter(vec![Ok(Bytes::from_static(b"ab"))]).boxed();
        let resp = Response::new(Body::stream(chunks, None));
        let (text, w) = written(resp, WriteOptions { http10: true, ..KEEP }).await;
        assert!(text.ends_with("Connection: close\r\n\r\nab"));
        assert!(!w.keep_alive);
    }

    #[tokio::test]
    async fn test_write_head_response_keeps_length() {
        let mut resp = Response::new(Body::Empty);
        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("1234"));
        let (text, w) = written(resp, WriteOptions { head_only: true, ..KEEP }).await;
        assert!(text.contains("content-length: 1234\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(w.body_bytes, 0);
    }

    /// 启动一个只回复固定内容的上游，返回客户端一端
    fn upstream(reply: &'static [u8]) -> (BoxedStream, tokio::task::JoinHandle<Request>) {
        let (client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let mut server = Prebuffered::new(server, MAX_HEADER_BYTES);
            let req = read_request(&mut server).await.unwrap();
            server.write_all(reply).await.unwrap();
            server.shutdown().await.unwrap();
            req
        });
        (Box::new(client), handle)
    }

    fn proxy_request(method: Method, body: &'static [u8]) -> Request {
        http::Request::builder()
            .method(method)
            .uri("http://example.com/path?q=1")
            .header("Proxy-Connection", "keep-alive")
            .header("Proxy-Authorization", "Basic Zm9vOmJhcg==")
            .header("Connection", "X-Secret")
            .header("X-Secret", "1")
            .header("Accept", "*/*")
            .body(Bytes::from_static(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_request_content_length() {
        let (stream, server) = upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Up: yes\r\n\r\nworld");
        let resp = send_request(stream, &proxy_request(Method::POST, b"ping")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-up"], "yes");
        assert_eq!(resp.body().length(), Some(5));
        assert_eq!(&resp.into_body().collect(1024).await.unwrap()[..], b"world");

        let seen = server.await.unwrap();
        assert_eq!(seen.uri(), "/path?q=1");
        assert_eq!(seen.headers()["host"], "example.com");
        assert_eq!(seen.headers()["connection"], "close");
        assert_eq!(seen.headers()["accept"], "*/*");
        assert!(!seen.headers().contains_key("proxy-authorization"));
        assert!(!seen.headers().contains_key("proxy-connection"));
        assert!(!seen.headers().contains_key("x-secret"));
        assert_eq!(&seen.body()[..], b"ping");
    }

    #[tokio::test]
    async fn test_send_request_chunked_and_continue() {
        let (stream, _server) = upstream(
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
        );
        let resp = send_request(stream, &proxy_request(Method::GET, b"")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key(header::TRANSFER_ENCODING));
        assert_eq!(resp.body().length(), None);
        assert_eq!(&resp.into_body().collect(1024).await.unwrap()[..], b"abcde");
    }

    #[tokio::test]
    async fn test_send_request_until_close_and_truncated() {
        let (stream, _server) = upstream(b"HTTP/1.0 200 OK\r\n\r\nall of it");
        let resp = send_request(stream, &proxy_request(Method::GET, b"")).await.unwrap();
        assert_eq!(&resp.into_body().collect(1024).await.unwrap()[..], b"all of it");

        let (stream, _server) = upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        let resp = send_request(stream, &proxy_request(Method::GET, b"")).await.unwrap();
        assert!(resp.into_body().collect(1024).await.is_err());

        let (stream, _server) = upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n");
        let resp = send_request(stream, &proxy_request(Method::HEAD, b"")).await.unwrap();
        assert_eq!(resp.body().length(), Some(0));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
    }
}

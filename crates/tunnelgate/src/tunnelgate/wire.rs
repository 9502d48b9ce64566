use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    #[error("connection closed before the request head was complete")]
    Closed,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An HTTP/1 request head as it came off the wire.
///
/// Header names keep their original case and order so the head can be
/// replayed byte for byte.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version: `HTTP/1.<version>`.
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
    /// Length of the head in the read buffer, blank line included.
    pub len: usize,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
    }

    /// `Upgrade` present and `Connection` carries the `upgrade` token.
    pub fn is_upgrade(&self) -> bool {
        if self.header("upgrade").is_none() {
            return false;
        }
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("connection"))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    }

    /// Recreates the head: request line, every header as received, blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len.max(64));
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Parses a complete request head out of `buf`, if one is there.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    Ok(Some(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or("/").to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
        len,
    }))
}

/// Reads until a full request head is buffered.
///
/// The returned buffer holds everything read so far: the head followed by
/// whatever body bytes arrived with it.
pub async fn read_head<R>(reader: &mut R, max: usize) -> Result<(RequestHead, BytesMut), HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if !buf.is_empty() {
            if let Some(head) = parse_head(&buf)? {
                return Ok((head, buf));
            }
        }
        if buf.len() >= max {
            return Err(HeadError::TooLarge(max));
        }
        if buf.capacity() - buf.len() < 1024 {
            buf.reserve(4096);
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HeadError::Closed);
        }
    }
}

pin_project! {
    /// Replays bytes that were already read off `inner` before reading from
    /// it again. Writes go straight through.
    #[derive(Debug)]
    pub struct Prefixed<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> Prefixed<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt;

    #[test]
    fn parse_head_keeps_raw_header_case_and_order() {
        let raw = b"GET /chat?room=1 HTTP/1.1\r\nHost: abc.example.com\r\nX-Custom-HEADER: One\r\nupgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\nextra";
        let head = parse_head(raw).unwrap().expect("complete");

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/chat?room=1");
        assert_eq!(head.version, 1);
        assert_eq!(head.len, raw.len() - b"extra".len());
        let names: Vec<_> = head.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["Host", "X-Custom-HEADER", "upgrade", "Connection"]);
        assert_eq!(head.host(), Some("abc.example.com"));
        assert!(head.is_upgrade());
    }

    #[test]
    fn encode_recreates_head() {
        let raw = b"GET /socket HTTP/1.1\r\nHost: abc.localhost:9000\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
        let head = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.encode(), raw.to_vec());
    }

    #[test]
    fn partial_head_is_not_an_error() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nHost: a").unwrap().is_none());
        assert!(parse_head(b"\x00\x01 nonsense\r\n\r\n").is_err());
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let head = parse_head(b"GET / HTTP/1.1\r\nHost: a\r\nUpgrade: h2c\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.is_upgrade());
    }

    #[tokio::test]
    async fn read_head_across_chunks_keeps_leftover() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(b"POST /x HTTP/1.1\r\nHo").await.unwrap();
            tokio::task::yield_now().await;
            client
                .write_all(b"st: a\r\nContent-Length: 3\r\n\r\nabc")
                .await
                .unwrap();
            client
        });

        let (head, buf) = read_head(&mut server, 1024).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.host(), Some("a"));
        let _client = writer.await.unwrap();
        if buf.len() > head.len {
            assert_eq!(&buf[head.len..], b"abc");
        }
    }

    #[tokio::test]
    async fn read_head_limits() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap();
        let err = read_head(&mut server, 32).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge(32)));

        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        let err = read_head(&mut server, 32).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed));
    }

    #[tokio::test]
    async fn prefixed_replays_before_reading() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut io = Prefixed::new(Bytes::from_static(b"hello"), server);
        let mut out = String::new();
        io.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }
}

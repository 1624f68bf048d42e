use crate::{
    errors::ErrorKind,
    fs::{
        registry::PeerLookup,
        sandbox::{Resolution, Sandbox},
    },
    http::{
        buffer::FrameBuffer,
        request::{ParserRules, Request},
        response::Response,
        types::{Method, StatusCode},
    },
    limits::{ConnLimits, RespLimits},
    server::server_impl::AllLimits,
};
use std::{io, sync::Arc};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite},
};

/// State shared by every connection of a server.
#[derive(Debug)]
pub(crate) struct Service<L: PeerLookup> {
    pub(crate) rules: ParserRules,
    pub(crate) sandbox: Sandbox,
    pub(crate) lookup: L,
}

/// What a well-formed request resolved to.
#[derive(Debug)]
enum Outcome {
    File { file: File, len: u64 },
    Redirect(String),
    ReachOut,
    NotFound,
    NotImplemented,
}

impl Outcome {
    #[inline]
    const fn status(&self) -> StatusCode {
        match self {
            Outcome::File { .. } => StatusCode::Ok,
            Outcome::Redirect(_) => StatusCode::Found,
            Outcome::ReachOut | Outcome::NotFound => StatusCode::NotFound,
            Outcome::NotImplemented => StatusCode::NotImplemented,
        }
    }
}

/// Per-worker connection state, reused from one connection to the next.
pub(crate) struct HttpConnection<L: PeerLookup> {
    service: Arc<Service<L>>,

    buffer: FrameBuffer,
    response: Response,
    file_chunk: Vec<u8>,
    // Set once any byte of the current response went to the transport.
    response_started: bool,

    conn_limits: ConnLimits,
    resp_limits: RespLimits,
}

impl<L: PeerLookup> HttpConnection<L> {
    #[inline]
    pub(crate) fn new(service: Arc<Service<L>>, limits: &AllLimits) -> Self {
        let (_, conn_limits, buffer_limits, resp_limits) = limits.clone();

        Self {
            service,

            buffer: FrameBuffer::new(&buffer_limits),
            response: Response::new(&resp_limits),
            file_chunk: vec![0; resp_limits.file_chunk_size.max(1)],
            response_started: false,

            conn_limits,
            resp_limits,
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.buffer.reset();
        self.reset_response();
    }

    #[inline]
    fn reset_response(&mut self) {
        self.response.reset(&self.resp_limits);
        self.response_started = false;
    }
}

impl<L: PeerLookup> HttpConnection<L> {
    /// Serves one connection until it closes.
    ///
    /// A failure that leaves the current response untouched is answered
    /// with its error frame (400, 431 or 500) before closing. Timeouts and
    /// failures after the first byte of a response close silently.
    pub(crate) async fn run<S>(&mut self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.reset();

        let err = match self.impl_run(stream).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.is_malformed() {
            tracing::warn!(error = %err, "Malformed request");
        } else if let ErrorKind::Io(_) = err {
            tracing::error!(error = %err, "Connection failed");
        } else {
            tracing::debug!(error = %err, "Connection dropped");
        }

        match err.as_http() {
            Some(frame) if !self.response_started => {
                writer::write_bytes(stream, frame, &self.conn_limits).await?;
                Err(err.into())
            }
            _ => Err(err.into()),
        }
    }

    async fn impl_run<S>(&mut self, stream: &mut S) -> Result<(), ErrorKind>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            self.reset_response();

            if !self
                .buffer
                .read_frame(stream, self.conn_limits.socket_read_timeout)
                .await?
            {
                return Ok(());
            }

            let request = self.service.rules.parse(self.buffer.frame())?;
            if request.is_connection_close() {
                self.response.close();
            }

            let outcome = self.resolve(&request).await?;

            tracing::debug!(
                method = ?request.method(),
                path = %String::from_utf8_lossy(request.target()),
                status = outcome.status().as_u16(),
                "Request"
            );
            if let Outcome::ReachOut = outcome {
                tracing::warn!(
                    path = %String::from_utf8_lossy(request.target()),
                    "Request escapes the document root"
                );
            }

            self.respond(stream, request.method(), request.target(), outcome)
                .await?;

            self.buffer.consume_frame();
            if !self.response.keep_alive {
                return Ok(());
            }
        }
    }

    async fn resolve(&self, request: &Request) -> Result<Outcome, ErrorKind> {
        if request.method() == Method::Other {
            return Ok(Outcome::NotImplemented);
        }

        let target = match request.target_str() {
            Some(target) if request.is_target_well_formed() => target,
            _ => return Ok(Outcome::NotFound),
        };

        Ok(match self.service.sandbox.resolve(target).await? {
            Resolution::Found { file, len } => Outcome::File { file, len },
            Resolution::ReachOut => Outcome::ReachOut,
            Resolution::NotFound => match self.service.lookup.lookup(target).await? {
                Some(peer) => Outcome::Redirect(peer),
                None => Outcome::NotFound,
            },
        })
    }

    async fn respond<S>(
        &mut self,
        stream: &mut S,
        method: Method,
        target: &[u8],
        outcome: Outcome,
    ) -> Result<(), ErrorKind>
    where
        S: AsyncWrite + Unpin,
    {
        let head = match &outcome {
            Outcome::File { len, .. } => self.response.file(*len),
            Outcome::Redirect(peer) => self.response.found(peer, target),
            Outcome::ReachOut | Outcome::NotFound => self.response.not_found(),
            Outcome::NotImplemented => self.response.not_implemented(),
        };

        writer::write_head(stream, head, &mut self.response_started, &self.conn_limits).await?;

        match outcome {
            Outcome::File { file, len } if method.has_body() => {
                writer::write_file(stream, file, len, &mut self.file_chunk, &self.conn_limits).await
            }
            _ => Ok(()),
        }
    }
}

pub(crate) mod writer {
    use crate::{errors::ErrorKind, limits::ConnLimits};
    use std::io;
    use tokio::{
        fs::File,
        io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
        time::timeout,
    };

    #[inline]
    pub(crate) async fn write_bytes<W>(
        stream: &mut W,
        bytes: &[u8],
        limits: &ConnLimits,
    ) -> Result<(), ErrorKind>
    where
        W: AsyncWrite + Unpin,
    {
        match timeout(limits.socket_write_timeout, stream.write_all(bytes)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ErrorKind::Timeout),
        }
    }

    /// Writes a response head, setting `started` as soon as the transport
    /// has accepted any of it.
    pub(crate) async fn write_head<W>(
        stream: &mut W,
        head: &[u8],
        started: &mut bool,
        limits: &ConnLimits,
    ) -> Result<(), ErrorKind>
    where
        W: AsyncWrite + Unpin,
    {
        let mut rest = head;

        while !rest.is_empty() {
            let n = match timeout(limits.socket_write_timeout, stream.write(rest)).await {
                Ok(result) => result?,
                Err(_) => return Err(ErrorKind::Timeout),
            };
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }

            *started = true;
            rest = &rest[n..];
        }

        Ok(())
    }

    /// Streams exactly `len` bytes of `file`, one chunk at a time.
    pub(crate) async fn write_file<W>(
        stream: &mut W,
        mut file: File,
        len: u64,
        chunk: &mut [u8],
        limits: &ConnLimits,
    ) -> Result<(), ErrorKind>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = len;

        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                // Truncated while being served.
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }

            write_bytes(stream, &chunk[..n], limits).await?;
            remaining -= n as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::buffer::test_io::{Scripted, Trickle},
        limits::{BufferLimits, ServerLimits},
        tools::*,
    };
    use std::{path::Path, time::Duration};
    use tempfile::TempDir;

    const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\n\r\n";
    const NOT_IMPLEMENTED: &str = "HTTP/1.1 501 Not Implemented\r\n\r\n";
    const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";
    const INTERNAL: &str = "HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\n";

    enum Peers {
        Table(&'static [(&'static str, &'static str)]),
        Broken,
    }

    impl PeerLookup for Peers {
        async fn lookup(&self, key: &str) -> io::Result<Option<String>> {
            match self {
                Peers::Table(table) => Ok(table
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, peer)| peer.to_string())),
                Peers::Broken => Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied")),
            }
        }
    }

    const PEERS: Peers = Peers::Table(&[("/remote.txt", "10.0.0.5:9090"), ("/a/far", "1.2.3.4:80")]);

    fn limits(file_chunk_size: usize) -> AllLimits {
        (
            ServerLimits::default(),
            ConnLimits {
                socket_read_timeout: Duration::from_secs(5),
                socket_write_timeout: Duration::from_secs(5),
            },
            BufferLimits::default(),
            RespLimits {
                file_chunk_size,
                ..RespLimits::default()
            },
        )
    }

    fn connection(root: &Path, peers: Peers, limits: &AllLimits) -> HttpConnection<Peers> {
        let service = Service {
            rules: ParserRules::new(),
            sandbox: Sandbox::new(root),
            lookup: peers,
        };
        HttpConnection::new(Arc::new(service), limits)
    }

    async fn root() -> TempDir {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir(dir.path().join("a")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();
        tokio::fs::write(dir.path().join("a/big.bin"), big_body()).await.unwrap();
        dir
    }

    fn big_body() -> Vec<u8> {
        (0..200_000u32).map(|i| (i % 251) as u8).collect()
    }

    fn ok_head(len: usize) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {len}\r\n\r\n"
        )
    }

    async fn exchange(root: &Path, peers: Peers, input: &str) -> (String, io::Result<()>) {
        let mut conn = connection(root, peers, &limits(64 * 1024));
        let mut stream = Scripted::new(Trickle::new(input, 4096));

        let result = conn.run(&mut stream).await;
        (String::from_utf8(stream.output).unwrap(), result)
    }

    #[tokio::test]
    async fn outcomes() {
        let dir = root().await;

        #[rustfmt::skip]
        let cases = [
            ("GET /a.txt HTTP/1.1\r\n\r\n",        format!("{}hello", ok_head(5))),
            ("HEAD /a.txt HTTP/1.1\r\n\r\n",       ok_head(5)),
            (
                "GET /remote.txt HTTP/1.1\r\n\r\n",
                "HTTP/1.1 302 Found\r\nLocation: http://10.0.0.5:9090/remote.txt\r\n\r\n".to_string(),
            ),
            (
                "HEAD /a/far HTTP/1.1\r\n\r\n",
                "HTTP/1.1 302 Found\r\nLocation: http://1.2.3.4:80/a/far\r\n\r\n".to_string(),
            ),
            ("GET /missing.txt HTTP/1.1\r\n\r\n",  NOT_FOUND.to_string()),
            ("GET /a HTTP/1.1\r\n\r\n",            NOT_FOUND.to_string()),
            ("GET /a_b HTTP/1.1\r\n\r\n",          NOT_FOUND.to_string()),
            ("GET /remote.txt?x HTTP/1.1\r\n\r\n", NOT_FOUND.to_string()),
            ("GET /../a.txt HTTP/1.1\r\n\r\n",     NOT_FOUND.to_string()),
            ("POST /a.txt HTTP/1.1\r\n\r\n",       NOT_IMPLEMENTED.to_string()),
            ("DELETE /../x HTTP/1.1\r\n\r\n",      NOT_IMPLEMENTED.to_string()),
        ];

        for (input, expected) in cases {
            let (output, result) = exchange(dir.path(), PEERS, input).await;
            assert_eq!(output, expected, "{input:?}");
            assert!(result.is_ok());
        }
    }

    #[tokio::test]
    async fn malformed_requests_close() {
        let dir = root().await;

        #[rustfmt::skip]
        let cases = [
            "GET / HTTP/1.0\r\n\r\n",
            "GET /a.txt HTTP/1.1\r\nBroken header\r\n\r\n",
            "GET /a.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
            "GET /a.txt HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n",
            "GET /a.txt HTTP/1.1\r\nConnection: a\r\nConnection: b\r\n\r\n",
        ];

        for input in cases {
            // The trailing request must never be answered.
            let input = format!("{input}GET /a.txt HTTP/1.1\r\n\r\n");
            let (output, result) = exchange(dir.path(), PEERS, &input).await;

            assert_eq!(output, BAD_REQUEST, "{input:?}");
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn pipelining() {
        let dir = root().await;
        let input = "GET /a.txt HTTP/1.1\r\n\r\nHEAD /a.txt HTTP/1.1\r\n\r\nBREW / HTTP/1.1\r\n\r\nGET /nope HTTP/1.1\r\n\r\n";

        let (output, result) = exchange(dir.path(), PEERS, input).await;
        assert_eq!(
            output,
            format!("{}hello{}{NOT_IMPLEMENTED}{NOT_FOUND}", ok_head(5), ok_head(5))
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn connection_close_stops_reading() {
        let dir = root().await;
        let first = "GET /a.txt HTTP/1.1\r\n\r\n";
        let second = "HEAD /a.txt HTTP/1.1\r\nConnection: close\r\n\r\n";
        let input = format!("{first}{second}GET /a.txt HTTP/1.1\r\n\r\n");

        let mut conn = connection(dir.path(), PEERS, &limits(1024));
        let mut stream = Scripted::new(Trickle::new(&input, first.len() + second.len()));

        conn.run(&mut stream).await.unwrap();
        assert_eq!(str_op(&stream.output), format!("{}hello{}", ok_head(5), ok_head(5)));
        assert_eq!(stream.input.reads, 1);
    }

    #[tokio::test]
    async fn body_streamed_in_chunks() {
        let dir = root().await;
        let body = big_body();

        for chunk in [1000, 4096, 64 * 1024, 1 << 20] {
            let mut conn = connection(dir.path(), PEERS, &limits(chunk));
            let mut stream = Scripted::new(Trickle::new("GET /a/big.bin HTTP/1.1\r\n\r\n", 64));

            conn.run(&mut stream).await.unwrap();

            let head = ok_head(body.len());
            assert_eq!(str_op(&stream.output[..head.len()]), head);
            assert!(stream.output[head.len()..] == body[..], "chunk = {chunk}");
        }
    }

    #[tokio::test]
    async fn registry_failure_is_internal() {
        let dir = root().await;
        let input = "GET /a.txt HTTP/1.1\r\n\r\nGET /remote.txt HTTP/1.1\r\n\r\nGET /a.txt HTTP/1.1\r\n\r\n";

        let (output, result) = exchange(dir.path(), Peers::Broken, input).await;
        assert_eq!(output, format!("{}hello{INTERNAL}", ok_head(5)));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn read_failure_is_internal() {
        let dir = root().await;
        let mut conn = connection(dir.path(), PEERS, &limits(1024));

        let mut stream = Scripted::new(Trickle::failing("GET /a.txt HTTP/1.1\r\n\r\nGET /a", 4096));
        assert!(conn.run(&mut stream).await.is_err());
        assert_eq!(str_op(&stream.output), format!("{}hello{INTERNAL}", ok_head(5)));
    }

    #[tokio::test]
    async fn write_failure_closes() {
        let dir = root().await;
        let mut conn = connection(dir.path(), PEERS, &limits(1024));

        let input = "GET /a.txt HTTP/1.1\r\n\r\nGET /a.txt HTTP/1.1\r\n\r\n";
        let mut stream = Scripted::failing_writes(Trickle::new(input, 4096));

        let err = conn.run(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(stream.output.is_empty());
    }

    #[tokio::test]
    async fn unsent_head_gets_internal() {
        let dir = root().await;
        let mut conn = connection(dir.path(), PEERS, &limits(1024));

        let input = "GET /a.txt HTTP/1.1\r\n\r\nGET /a.txt HTTP/1.1\r\n\r\n";
        let mut stream = Scripted::failing_once(Trickle::new(input, 4096));

        let err = conn.run(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(str_op(&stream.output), INTERNAL);
    }

    #[tokio::test]
    async fn partly_sent_head_closes_silently() {
        let dir = root().await;
        let mut conn = connection(dir.path(), PEERS, &limits(1024));

        let mut stream = Scripted::failing_after(Trickle::new("GET /a.txt HTTP/1.1\r\n\r\n", 4096), 10);

        let err = conn.run(&mut stream).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(str_op(&stream.output), &ok_head(5)[..10]);
    }

    #[tokio::test]
    async fn oversized_head() {
        let dir = root().await;
        let mut all = limits(1024);
        all.2 = BufferLimits {
            base_capacity: 4096,
            max_capacity: 8192,
        };
        let mut conn = connection(dir.path(), PEERS, &all);

        let input = format!("GET /a.txt HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(9000));
        let mut stream = Scripted::new(Trickle::new(&input, 4096));

        assert!(conn.run(&mut stream).await.is_err());
        assert_eq!(
            str_op(&stream.output),
            "HTTP/1.1 431 Request Header Fields Too Large\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn idle_timeout_is_silent() {
        let dir = root().await;
        let mut all = limits(1024);
        all.1.socket_read_timeout = Duration::from_millis(20);
        let mut conn = connection(dir.path(), PEERS, &all);

        let (mut client, mut server) = tokio::io::duplex(1024);
        let err = conn.run(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        drop(server);
        let mut output = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut output)
            .await
            .unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn state_is_reset_between_connections() {
        let dir = root().await;
        let mut conn = connection(dir.path(), PEERS, &limits(1024));

        let big = format!("GET /a.txt HTTP/1.1\r\nX-Big: {}\r\nConnection: close\r\n\r\n", "a".repeat(9000));
        let mut stream = Scripted::new(Trickle::new(&big, 4096));
        conn.run(&mut stream).await.unwrap();
        assert_eq!(conn.buffer.capacity(), 16384);

        let mut stream = Scripted::new(Trickle::new("HEAD /a.txt HTTP/1.1\r\n\r\n", 4096));
        conn.run(&mut stream).await.unwrap();
        assert_eq!(str_op(&stream.output), ok_head(5));
        assert_eq!(conn.buffer.capacity(), 4096);
    }
}

use crate::{
    errors::{Error, ErrorKind},
    fs::{registry::PeerLookup, sandbox::Sandbox},
    http::request::ParserRules,
    limits::{BufferLimits, ConnLimits, RespLimits, ServerLimits, WaitStrategy},
    server::connection::{writer, HttpConnection, Service},
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};

/// A static file server with a peer-registry fallback.
///
/// Every request is answered from the document root when the target names a
/// regular file inside it. Otherwise the configured [`PeerLookup`] is asked
/// for a peer to redirect to.
///
/// # Examples
///
/// ```no_run
/// use sandbox_httpd::{PeerRegistry, Server};
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .root("/srv/www")
///         .lookup(PeerRegistry::new("/srv/peers.txt"))
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder<L: PeerLookup>() -> ServerBuilder<L> {
        ServerBuilder {
            listener: None,
            root: None,
            lookup: None,

            server_limits: None,
            connection_limits: None,
            buffer_limits: None,
            response_limits: None,
        }
    }

    /// Address the server accepts connections on.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts accepting connections. Never returns.
    ///
    /// Accepted connections wait in a queue for a free worker. Once the queue
    /// holds [`max_pending_connections`](ServerLimits::max_pending_connections),
    /// new connections go to the `503` handlers instead.
    #[inline]
    pub async fn launch(self) {
        loop {
            let value = match self.listener.accept().await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept connection");
                    continue;
                }
            };

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push(value),
                false => self.error_queue.push(value),
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

/// Binds a listener with `SO_REUSEADDR` set, so a restarted server can take
/// over its port while old connections linger in `TIME_WAIT`.
///
/// Must be called from within a Tokio runtime.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    let bind = || -> io::Result<TcpListener> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        TcpListener::from_std(socket.into())
    };

    bind().map_err(|source| Error::Bind { addr, source })
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// [`listener`](Self::listener), [`root`](Self::root) and
/// [`lookup`](Self::lookup) are required. Every limit has a default.
pub struct ServerBuilder<L: PeerLookup> {
    listener: Option<TcpListener>,
    root: Option<PathBuf>,
    lookup: Option<L>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    buffer_limits: Option<BufferLimits>,
    response_limits: Option<RespLimits>,
}

impl<L: PeerLookup> ServerBuilder<L> {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the document root. Request targets are appended to it verbatim,
    /// so it should not end with a separator.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Sets where files missing from the root are looked up.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn lookup(mut self, lookup: L) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Configures worker count and admission queueing.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # #[tokio::main]
    /// # async fn main() {
    /// use sandbox_httpd::{limits::ServerLimits, PeerRegistry, Server};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .root("/srv/www")
    ///     .lookup(PeerRegistry::new("/srv/peers.txt"))
    ///     .server_limits(ServerLimits {
    ///         max_connections: 16,
    ///         max_pending_connections: 64,
    ///         ..ServerLimits::default()
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures socket timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures receive buffer sizing.
    #[inline(always)]
    pub fn buffer_limits(mut self, limits: BufferLimits) -> Self {
        self.buffer_limits = Some(limits);
        self
    }

    /// Configures response buffering and file streaming.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Finalizes the builder and spawns the workers.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` method must be called to create``
    /// - ``The `root` method must be called to create``
    /// - ``The `lookup` method must be called to create``
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, service, limits) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..limits.0.max_connections {
            Self::spawn_worker(&stream_queue, &limits, &service);
        }
        if limits.0.count_503_handlers != 0 {
            for _ in 0..limits.0.count_503_handlers {
                Self::spawn_alarmist(&error_queue, &limits);
            }
        } else {
            Self::spawn_quiet_alarmist(&error_queue, &limits);
        }

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            root = ?service.sandbox.root(),
            workers = limits.0.max_connections,
            "Server ready"
        );

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: limits.0,
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, limits: &AllLimits, service: &Arc<Service<L>>) {
        let queue = queue.clone();
        let wait = limits.0.wait_strategy.clone();
        let mut conn = HttpConnection::new(service.clone(), limits);

        tokio::spawn(async move {
            loop {
                let (mut stream, addr) = Server::get_stream(&queue, &wait).await;

                tracing::debug!(peer = %addr, "Connection opened");
                let _ = conn.run(&mut stream).await;
                tracing::debug!(peer = %addr, "Connection closed");
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let (server_limits, conn_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (mut stream, addr) =
                    Server::get_stream(&queue, &server_limits.wait_strategy).await;

                tracing::warn!(peer = %addr, "Pending queue full, answering 503");
                if let Some(frame) = ErrorKind::ServiceUnavailable.as_http() {
                    let _ = writer::write_bytes(&mut stream, frame, &conn_limits).await;
                }
            }
        });
    }

    #[inline]
    fn spawn_quiet_alarmist(queue: &TcpQueue, limits: &AllLimits) {
        let queue = queue.clone();
        let (server_limits, ..) = limits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = Server::get_stream(&queue, &server_limits.wait_strategy).await;

                drop(stream);
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<Service<L>>, AllLimits) {
        let service = Service {
            rules: ParserRules::new(),
            sandbox: Sandbox::new(
                self.root
                    .expect("The `root` method must be called to create"),
            ),
            lookup: self
                .lookup
                .expect("The `lookup` method must be called to create"),
        };

        (
            self.listener
                .expect("The `listener` method must be called to create"),
            Arc::new(service),
            (
                self.server_limits.unwrap_or_default(),
                self.connection_limits.unwrap_or_default(),
                self.buffer_limits.unwrap_or_default(),
                self.response_limits.unwrap_or_default(),
            ),
        )
    }
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
pub(crate) type AllLimits = (ServerLimits, ConnLimits, BufferLimits, RespLimits);

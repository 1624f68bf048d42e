//! Server configuration limits and timeouts
//!
//! # Memory Consumption
//!
//! Each worker holds one connection state, which consumes:
//!
//! `Total` = [`Frame Buffer`](crate::limits::BufferLimits#growth-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits) +
//!           `File Chunk` + `Runtime Overhead`
//!
//! # Examples
//!
//! ```no_run
//! use sandbox_httpd::{limits::{BufferLimits, ConnLimits, ServerLimits}, PeerRegistry, Server};
//! use tokio::net::TcpListener;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .root("/srv/www")
//!         .lookup(PeerRegistry::new("/srv/peers.txt"))
//!         .server_limits(ServerLimits {
//!             max_connections: 500,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .buffer_limits(BufferLimits {
//!             max_capacity: 64 * 1024,
//!             ..BufferLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::time::Duration;

/// Controls server-level concurrency and queueing.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   Yes   /----------------\   No   [-------------]
/// [ Add to queue ] <====== | Queue has room? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /--------------------------\   No   [------]
/// [ Worker ] <====== | Is there a free worker?  | =====> [ Wait ]
/// [--------]         \--------------------------/        [------]
/// ```
///
/// A worker is a task spawned once when the server is built. It owns one
/// connection state and serves queued connections one after another, each
/// from its first byte to its close.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of workers, i.e. connections served concurrently (default: `100`).
    pub max_connections: usize,

    /// Maximum number of accepted connections waiting for a worker (default: `250`).
    ///
    /// Connections accepted while the queue is full receive an immediate
    /// `503 Service Unavailable`.
    pub max_pending_connections: usize,

    /// How idle workers wait for the queue to refill (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Tasks dedicated to answering overflow connections with `503` (default: `1`).
    ///
    /// Set to 0 to drop overflow connections without a response.
    pub count_503_handlers: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_pending_connections: 250,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            count_503_handlers: 1,
        }
    }
}

/// Strategy for worker task waiting when no connections are queued
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]. Burns a core.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// Connection-level timeouts
///
/// Deadlines apply to each individual socket operation. They never change
/// how frames are delimited: a timed out read simply closes the connection.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum wait for the next chunk of a request (default: `30 seconds`)
    ///
    /// Also bounds how long an idle persistent connection is kept.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single response write (default: `30 seconds`)
    pub socket_write_timeout: Duration,
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(30),
        }
    }
}

/// Receive buffer sizing.
///
/// # Growth strategy
///
/// Every connection starts with `base_capacity` bytes. When a request head
/// does not fit, the capacity doubles (keeping every byte already read) until
/// the `CRLF CRLF` terminator is found. The capacity is therefore always
/// `base_capacity * 2^n`. It never shrinks while the connection is open and
/// returns to `base_capacity` when the worker picks up the next connection.
///
/// A request head that would need more than `max_capacity` is rejected with
/// `431 Request Header Fields Too Large`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferLimits {
    /// Initial capacity (default: `4096 B`)
    pub base_capacity: usize,
    /// Hard ceiling for growth (default: `1 MiB`)
    pub max_capacity: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            base_capacity: 4096,
            max_capacity: 1024 * 1024,
        }
    }
}

impl BufferLimits {
    // Base rounded up to a power-of-two multiple of 4096, ceiling never below it.
    #[inline]
    pub(crate) fn normalize(mut self) -> Self {
        let units = self.base_capacity.div_ceil(4096).max(1).next_power_of_two();
        self.base_capacity = units * 4096;
        self.max_capacity = self.max_capacity.max(self.base_capacity);
        self
    }
}

/// Response buffer and file streaming sizes.
///
/// Response heads are rendered into a reusable buffer:
/// ```rust
/// # use sandbox_httpd::limits::RespLimits;
/// # let limits = RespLimits::default();
/// # let mut buffer: Vec<u8> = Vec::with_capacity(limits.default_capacity);
/// #
/// if buffer.capacity() > limits.max_capacity {
///     buffer = Vec::with_capacity(limits.default_capacity);
/// } else {
///     buffer.clear();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the response head buffer (default: `512 B`)
    pub default_capacity: usize,
    /// Capacity above which the head buffer is reallocated on reset (default: `4096 B`)
    pub max_capacity: usize,
    /// Size of each read from a served file (default: `64 KiB`)
    pub file_chunk_size: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 512,
            max_capacity: 4 * 1024,
            file_chunk_size: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_buffer_limits() {
        #[rustfmt::skip]
        let cases = [
            ((4096, 1 << 20),  (4096, 1 << 20)),
            ((1, 1 << 20),     (4096, 1 << 20)),
            ((0, 0),           (4096, 4096)),
            ((5000, 1 << 20),  (8192, 1 << 20)),
            ((12288, 1 << 20), (16384, 1 << 20)),
            ((65536, 1024),    (65536, 65536)),
        ];

        for ((base, max), expected) in cases {
            let limits = BufferLimits {
                base_capacity: base,
                max_capacity: max,
            }
            .normalize();

            assert_eq!((limits.base_capacity, limits.max_capacity), expected);
        }
    }
}

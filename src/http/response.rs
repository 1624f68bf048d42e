//! Allocation-free builder for response heads.

use crate::{http::types::StatusCode, limits::RespLimits};
use write::WriteBuffer;

/// Builder for the head of an HTTP response.
///
/// Build responses by chaining methods in strict order:
/// [`status()`](Response::status) -> headers -> [`finish()`](Response::finish).
/// Body bytes, if any, are streamed by the connection after the head.
///
/// One instance lives as long as its worker and is reset before every
/// request, so the underlying buffer is allocated once.
///
/// # Panics
/// All methods perform validity checks in `debug` mode that panic on violations.
/// In `release` mode, these checks are omitted, which may produce invalid
/// HTTP responses.
#[derive(Debug)]
pub(crate) struct Response {
    buffer: Vec<u8>,
    pub(crate) keep_alive: bool,
    state: ResponseState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    Clean,
    Headers,
    Complete,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            buffer: Vec::with_capacity(limits.default_capacity),
            keep_alive: true,
            state: ResponseState::Clean,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self, limits: &RespLimits) {
        if self.buffer.capacity() > limits.max_capacity {
            self.buffer = Vec::with_capacity(limits.default_capacity);
        } else {
            self.buffer.clear();
        }

        self.keep_alive = true;
        self.state = ResponseState::Clean;
    }

    #[cfg(test)]
    #[inline(always)]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }
}

impl Response {
    /// Forces the connection to close after this response.
    ///
    /// Adds nothing to the head: the frames for the regular outcomes are
    /// byte-exact and carry no `Connection` header.
    ///
    /// # Panics
    /// Panics in `debug` mode when called after [`finish()`](Response::finish).
    #[inline]
    #[track_caller]
    pub(crate) fn close(&mut self) -> &mut Self {
        debug_assert!(
            self.state != ResponseState::Complete,
            "Must be called before any finalizing method",
        );

        self.keep_alive = false;
        self
    }

    /// Writes the status line.
    ///
    /// # Panics
    /// Panics in `debug` mode when called twice or after
    /// [`finish()`](Response::finish).
    #[inline]
    #[track_caller]
    pub(crate) fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Clean,
            "Must be first and called only once"
        );

        self.buffer.extend_from_slice(status.to_first_line());
        self.state = ResponseState::Headers;
        self
    }

    /// Adds a `name: value` header line.
    ///
    /// # Panics
    /// Panics in `debug` mode when called before [`status()`](Response::status)
    /// or after [`finish()`](Response::finish).
    #[inline]
    #[track_caller]
    pub(crate) fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before finish()"
        );

        name.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b": ");
        value.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a header whose value is the concatenation of `parts`.
    #[inline]
    #[track_caller]
    pub(crate) fn header_concat<N, I, V>(&mut self, name: N, parts: I) -> &mut Self
    where
        N: WriteBuffer,
        I: IntoIterator<Item = V>,
        V: WriteBuffer,
    {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before finish()"
        );

        name.write_to(&mut self.buffer);
        self.buffer.extend_from_slice(b": ");
        for part in parts {
            part.write_to(&mut self.buffer);
        }
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    /// Terminates the head with an empty line.
    ///
    /// # Panics
    /// Panics in `debug` mode when called before [`status()`](Response::status)
    /// or twice.
    #[inline]
    #[track_caller]
    pub(crate) fn finish(&mut self) -> &[u8] {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.buffer.extend_from_slice(b"\r\n");
        self.state = ResponseState::Complete;
        &self.buffer
    }
}

/// Heads of the regular outcomes.
///
/// | Outcome            | Head                                                            |
/// |--------------------|-----------------------------------------------------------------|
/// | File (GET, HEAD)   | `200 OK`, `Content-Type: application/octet-stream`, `Content-Length` |
/// | Peer has the file  | `302 Found`, `Location: http://<host:port><target>`             |
/// | Nothing to serve   | `404 Not Found`                                                 |
/// | Unknown method     | `501 Not Implemented`                                           |
impl Response {
    #[inline]
    pub(crate) fn file(&mut self, len: u64) -> &[u8] {
        self.status(StatusCode::Ok)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len)
            .finish()
    }

    #[inline]
    pub(crate) fn found(&mut self, peer: &str, target: &[u8]) -> &[u8] {
        self.status(StatusCode::Found)
            .header_concat("Location", [b"http://".as_slice(), peer.as_bytes(), target])
            .finish()
    }

    #[inline]
    pub(crate) fn not_found(&mut self) -> &[u8] {
        self.status(StatusCode::NotFound).finish()
    }

    #[inline]
    pub(crate) fn not_implemented(&mut self) -> &[u8] {
        self.status(StatusCode::NotImplemented).finish()
    }
}

impl Response {
    #[inline]
    const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}

pub(crate) mod write {
    use super::Response;

    /// Values that can be written into a response head.
    pub(crate) trait WriteBuffer {
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => str, String
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => [u8], Vec<u8>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), impl_write_buffer_u128 => u16, u32, u64, usize
    }

    #[inline(always)]
    fn impl_write_buffer_u128(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = Response::number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }
}

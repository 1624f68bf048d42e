use crate::{errors::ErrorKind, limits::BufferLimits};
use memchr::memmem;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Growable receive buffer that yields one request frame at a time.
///
/// Layout of `buffer` (its length is always `capacity + 1`):
/// ```text
/// [ frame ........ | residue ...... | free ........... | 0 ]
/// 0            frame_end          filled          capacity
/// ```
/// The trailing byte past `capacity` is always zero.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FrameBuffer {
    buffer: Vec<u8>,
    capacity: usize,
    filled: usize,
    // Bytes of `buffer[..scanned]` are known not to contain the terminator
    // start (apart from a possible 3-byte overlap).
    scanned: usize,
    frame_end: Option<usize>,
    limits: BufferLimits,
}

impl FrameBuffer {
    #[inline]
    pub(crate) fn new(limits: &BufferLimits) -> Self {
        let limits = limits.clone().normalize();
        let capacity = limits.base_capacity;

        FrameBuffer {
            buffer: vec![0; capacity + 1],
            capacity,
            filled: 0,
            scanned: 0,
            frame_end: None,
            limits,
        }
    }

    #[cfg(test)]
    pub(crate) fn from<V: AsRef<[u8]>>(limits: &BufferLimits, value: V) -> Self {
        let mut this = Self::new(limits);
        let value = value.as_ref();

        while this.capacity < value.len() {
            this.grow();
        }
        this.buffer[..value.len()].copy_from_slice(value);
        this.filled = value.len();
        this
    }

    /// Prepares the buffer for a new connection.
    ///
    /// A buffer grown by the previous connection goes back to the base size.
    #[inline]
    pub(crate) fn reset(&mut self) {
        if self.capacity > self.limits.base_capacity {
            self.capacity = self.limits.base_capacity;
            self.buffer = vec![0; self.capacity + 1];
        } else {
            self.buffer[..self.filled].fill(0);
        }

        self.filled = 0;
        self.scanned = 0;
        self.frame_end = None;
    }

    #[cfg(test)]
    #[inline(always)]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The current frame, terminator included. Empty until
    /// [`read_frame`](Self::read_frame) has succeeded.
    #[inline(always)]
    pub(crate) fn frame(&self) -> &[u8] {
        match self.frame_end {
            Some(end) => &self.buffer[..end],
            None => &[],
        }
    }

    /// Bytes read past the current frame: the start of the next request.
    #[cfg(test)]
    #[inline(always)]
    pub(crate) fn residue(&self) -> &[u8] {
        &self.buffer[self.frame_end.unwrap_or(0)..self.filled]
    }
}

// Work with the transport
impl FrameBuffer {
    /// Reads until one complete frame is buffered.
    ///
    /// Returns `Ok(false)` when the peer closed the connection before a
    /// complete frame arrived (including the clean close between requests).
    /// Bytes already buffered, such as the residue of a previous read, are
    /// examined before the transport is touched.
    pub(crate) async fn read_frame<R>(
        &mut self,
        reader: &mut R,
        read_timeout: Duration,
    ) -> Result<bool, ErrorKind>
    where
        R: AsyncRead + Unpin,
    {
        debug_assert!(self.frame_end.is_none(), "Previous frame must be consumed");

        loop {
            if let Some(end) = self.find_terminator() {
                self.frame_end = Some(end);
                return Ok(true);
            }

            if self.filled == self.capacity {
                self.grow_checked()?;
            }

            let free = &mut self.buffer[self.filled..self.capacity];
            let n = match timeout(read_timeout, reader.read(free)).await {
                Ok(result) => result?,
                Err(_) => return Err(ErrorKind::Timeout),
            };

            if n == 0 {
                return Ok(false);
            }
            self.filled += n;
        }
    }

    /// Drops the current frame and moves the residue to offset 0.
    #[inline]
    pub(crate) fn consume_frame(&mut self) {
        let Some(end) = self.frame_end.take() else {
            return;
        };

        let old_filled = self.filled;
        self.buffer.copy_within(end..old_filled, 0);
        self.filled = old_filled - end;
        self.buffer[self.filled..old_filled].fill(0);
        self.scanned = 0;
    }

    #[inline]
    fn find_terminator(&mut self) -> Option<usize> {
        let start = self.scanned.saturating_sub(TERMINATOR.len() - 1);
        match memmem::find(&self.buffer[start..self.filled], TERMINATOR) {
            Some(pos) => Some(start + pos + TERMINATOR.len()),
            None => {
                self.scanned = self.filled;
                None
            }
        }
    }

    #[inline]
    fn grow_checked(&mut self) -> Result<(), ErrorKind> {
        if self.capacity * 2 > self.limits.max_capacity {
            return Err(ErrorKind::HeaderTooLarge);
        }

        self.grow();
        Ok(())
    }

    #[inline]
    fn grow(&mut self) {
        self.capacity *= 2;
        self.buffer.resize(self.capacity + 1, 0);
    }
}

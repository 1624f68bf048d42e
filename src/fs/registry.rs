use memchr::memchr;
use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
};

// TAB + "255.255.255.255" + TAB + "65535" + LF
const ENTRY_SUFFIX_MAX: usize = 1 + 15 + 1 + 5 + 1;

/// Source of redirect targets for files missing from the local root.
///
/// The server asks it once per request that found nothing locally. `Some`
/// answers with `302 Found` pointing at the returned `host:port`, `None`
/// with `404 Not Found`, and an error with `500 Internal Server Error`.
///
/// # Examples
/// ```
/// use sandbox_httpd::PeerLookup;
/// use std::io;
///
/// struct Mirror;
///
/// impl PeerLookup for Mirror {
///     async fn lookup(&self, _key: &str) -> io::Result<Option<String>> {
///         Ok(Some("10.0.0.2:8080".to_string()))
///     }
/// }
/// ```
pub trait PeerLookup: Send + Sync + 'static {
    /// Returns the `host:port` of a peer that registered `key` exactly.
    fn lookup(&self, key: &str) -> impl Future<Output = io::Result<Option<String>>> + Send;
}

/// Tab-separated registry of files held by peer servers.
///
/// One entry per line, keyed by the request target exactly as clients send
/// it (usually with the leading `/`):
/// ```text
/// /a.txt\t10.0.0.5\t9090\n
/// ```
/// The file is opened and scanned on every lookup, so edits take effect
/// immediately. Lines are read through a buffer bounded by the key length,
/// which keeps a lookup's memory independent of the registry's contents.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    path: PathBuf,
}

impl PeerRegistry {
    #[inline]
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PeerRegistry { path: path.into() }
    }

    #[inline(always)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PeerLookup for PeerRegistry {
    async fn lookup(&self, key: &str) -> io::Result<Option<String>> {
        let file = File::open(&self.path).await?;
        find_entry(BufReader::new(file), key.as_bytes()).await
    }
}

/// Scans `reader` for the first line starting with `key` + TAB.
pub(crate) async fn find_entry<R>(mut reader: R, key: &[u8]) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = key.len() + ENTRY_SUFFIX_MAX;
    let mut line = Vec::with_capacity(limit);

    loop {
        line.clear();
        let status = read_line_bounded(&mut reader, &mut line, limit).await?;

        if status == Line::Eof {
            return Ok(None);
        }
        if line.len() <= key.len() || &line[..key.len()] != key || line[key.len()] != b'\t' {
            continue;
        }
        if status == Line::Truncated {
            return Err(corrupt("registry entry is too long"));
        }

        return parse_address(&line[key.len() + 1..]).map(Some);
    }
}

// "HOST\tPORT\n" -> "HOST:PORT"
fn parse_address(entry: &[u8]) -> io::Result<String> {
    let entry = entry.strip_suffix(b"\n").unwrap_or(entry);
    let tab = memchr(b'\t', entry).ok_or_else(|| corrupt("registry entry lacks a port"))?;

    let host = simdutf8::basic::from_utf8(&entry[..tab])
        .map_err(|_| corrupt("registry host is not UTF-8"))?;
    let port = simdutf8::basic::from_utf8(&entry[tab + 1..])
        .map_err(|_| corrupt("registry port is not UTF-8"))?;

    let mut address = String::with_capacity(entry.len());
    address.push_str(host);
    address.push(':');
    address.push_str(port);
    Ok(address)
}

#[inline]
fn corrupt(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Line {
    Complete,
    Truncated,
    Eof,
}

/// Reads one line (LF included) keeping at most `limit` bytes of it.
/// The rest of an overlong line is skipped.
async fn read_line_bounded<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut truncated = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if truncated {
                Line::Truncated
            } else if line.is_empty() {
                Line::Eof
            } else {
                Line::Complete
            });
        }

        let (chunk, done) = match memchr(b'\n', available) {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };

        let room = limit - line.len();
        if chunk.len() > room {
            truncated = true;
        }
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = chunk.len();
        reader.consume(used);

        if done {
            return Ok(if truncated { Line::Truncated } else { Line::Complete });
        }
    }
}

use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs::{self, File};

/// Result of mapping a request target onto the document root.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// A regular file, opened read-only, with its size at open time.
    Found { file: File, len: u64 },
    /// The target climbs above the root.
    ReachOut,
    /// Nothing servable at that path. The peer registry gets a chance.
    NotFound,
}

/// Confines request targets to a document root.
#[derive(Debug, Clone)]
pub(crate) struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    #[inline]
    pub(crate) fn new<P: Into<PathBuf>>(root: P) -> Self {
        Sandbox { root: root.into() }
    }

    #[inline(always)]
    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a target that starts with `/`.
    ///
    /// The containment check is lexical: symlinks inside the root are
    /// followed. The target is appended to the root verbatim.
    ///
    /// # Errors
    /// A path that passes every check but cannot be opened.
    pub(crate) async fn resolve(&self, target: &str) -> io::Result<Resolution> {
        if !is_contained(target.as_bytes()) {
            return Ok(Resolution::ReachOut);
        }

        let mut path = self.root.clone().into_os_string();
        path.push(target);
        let path = PathBuf::from(path);

        let len = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Ok(Resolution::NotFound),
        };

        let file = File::open(&path).await?;
        Ok(Resolution::Found { file, len })
    }
}

/// Walks the `/`-separated components of `target` tracking the depth below
/// the root. `..` goes up one level, `.` and empty components stay put, and
/// anything else goes down one level. Going above the root fails at once.
pub(crate) fn is_contained(target: &[u8]) -> bool {
    let mut depth: i64 = 0;

    for component in target.split(|b| *b == b'/') {
        match component {
            b".." => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            b"." | b"" => {}
            _ => depth += 1,
        }
    }

    true
}

//! Remote filesystem operations built from prompt evaluations.
//!
//! [`RemoteFs`] is a stateless facade borrowing a [`ReplSession`]: every
//! operation is a sequence of evaluated expressions (`os.stat`,
//! `os.listdir`, chunked handle reads/writes) whose printed replies are
//! decoded by the literal parser.
//!
//! Transfers are chunked to keep each round trip small: the write cursor
//! advances by the byte count the device reports, not by the chunk size
//! that was offered, and downloads read until the device returns an empty
//! chunk.  `quick` mode skips entries whose sizes already match, which
//! makes re-running a partially failed transfer converge.  Directory walks
//! visit children in lexically sorted order.

use std::fs;
use std::io::Write;
use std::path::Path;

use bytes::{Buf, Bytes};

use crate::errors::{SyncError, SyncResult};
use crate::literal::{Literal, quote_bytes, quote_str};
use crate::repl::ReplSession;
use crate::transport::{PROMPT, Wire};

/// Largest payload offered to a single remote write.
pub const MAX_WRITE_PER_PASS: usize = 64;
/// Largest count requested from a single remote read.
pub const MAX_READ_PER_PASS: usize = 64;

/// Mode-word bits in a stat tuple.
const ST_TYPE_FILE: i64 = 0x8000;
const ST_TYPE_DIRECTORY: i64 = 0x4000;

/// Chunks per progress line.
const CHUNKS_PER_TICK: u64 = 16;

// ---------------------------------------------------------------------------
// StatResult
// ---------------------------------------------------------------------------

/// Decoded remote stat: exactly one of `is_file`/`is_dir` is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResult {
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
}

impl StatResult {
    /// Build from a decoded stat tuple: element 0 is the mode word,
    /// element 6 the size.
    fn from_literal(lit: &Literal) -> SyncResult<Self> {
        let items = lit
            .as_list()
            .ok_or_else(|| SyncError::UnexpectedReply("stat did not return a tuple".into()))?;
        let mode = items
            .first()
            .and_then(Literal::as_int)
            .ok_or_else(|| SyncError::UnexpectedReply("stat tuple has no mode word".into()))?;
        let size = items
            .get(6)
            .and_then(Literal::as_int)
            .ok_or_else(|| SyncError::UnexpectedReply("stat tuple has no size".into()))?;

        let is_file = mode & ST_TYPE_FILE != 0;
        let is_dir = mode & ST_TYPE_DIRECTORY != 0;
        if is_file == is_dir {
            return Err(SyncError::UnexpectedReply(format!(
                "stat mode {mode:#x} is not a file and not a directory"
            )));
        }
        Ok(Self {
            is_file,
            is_dir,
            size: size.max(0) as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Validate and normalize a remote path: must be absolute; a trailing `/`
/// is stripped except on the root itself.
fn normalize(path: &str) -> SyncResult<String> {
    if !path.starts_with('/') {
        return Err(SyncError::RelativePath(path.to_string()));
    }
    if path.len() > 1 && path.ends_with('/') {
        Ok(path.trim_end_matches('/').to_string())
    } else {
        Ok(path.to_string())
    }
}

/// Join a child name onto a remote directory path.
fn join_remote(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

// ---------------------------------------------------------------------------
// RemoteFs
// ---------------------------------------------------------------------------

/// Filesystem facade over a borrowed session.  Holds no state of its own.
pub struct RemoteFs<'a, W: Wire> {
    session: &'a mut ReplSession<W>,
}

impl<'a, W: Wire> RemoteFs<'a, W> {
    pub fn new(session: &'a mut ReplSession<W>) -> Self {
        Self { session }
    }

    // -----------------------------------------------------------------------
    // Primitives
    // -----------------------------------------------------------------------

    /// Stat a remote path.  Returns `None` when the device reports the
    /// "no such entry" fault; any other fault propagates.
    pub fn stat(&mut self, path: &str) -> SyncResult<Option<StatResult>> {
        let path = normalize(path)?;
        match self
            .session
            .evaluate(&format!("os.stat({})", quote_str(&path)))
        {
            Ok(lit) => Ok(Some(StatResult::from_literal(&lit)?)),
            Err(e) if e.is_not_found_fault() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List a remote directory's entry names.
    pub fn ls(&mut self, path: &str) -> SyncResult<Vec<String>> {
        let path = normalize(path)?;
        let lit = self
            .session
            .evaluate(&format!("os.listdir({})", quote_str(&path)))?;
        let items = lit
            .as_list()
            .ok_or_else(|| SyncError::UnexpectedReply("listdir did not return a list".into()))?;
        items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    SyncError::UnexpectedReply("listdir entry is not a string".into())
                })
            })
            .collect()
    }

    pub fn mkdir(&mut self, path: &str) -> SyncResult<()> {
        let path = normalize(path)?;
        self.primitive("os.mkdir", &path)
    }

    pub fn rm(&mut self, path: &str) -> SyncResult<()> {
        let path = normalize(path)?;
        self.primitive("os.remove", &path)
    }

    pub fn rmdir(&mut self, path: &str) -> SyncResult<()> {
        let path = normalize(path)?;
        self.primitive("os.rmdir", &path)
    }

    /// Run a side-effecting primitive and assert its success sentinel.
    fn primitive(&mut self, func: &str, path: &str) -> SyncResult<()> {
        let reply = self
            .session
            .evaluate(&format!("{func}({}) or True", quote_str(path)))?;
        if reply.is_true() {
            Ok(())
        } else {
            Err(SyncError::UnexpectedReply(format!(
                "{func} did not confirm: {reply:?}"
            )))
        }
    }

    // -----------------------------------------------------------------------
    // Tree operations
    // -----------------------------------------------------------------------

    /// Create every missing directory along `path`, root inward.
    /// Re-invoking on an existing tree performs no mutation.
    pub fn makedirs(&mut self, path: &str) -> SyncResult<()> {
        let path = normalize(path)?;
        let mut prefix = String::new();
        for segment in path[1..].split('/') {
            prefix.push('/');
            prefix.push_str(segment);
            match self.stat(&prefix)? {
                None => self.mkdir(&prefix)?,
                Some(st) if !st.is_dir => {
                    return Err(SyncError::PrefixNotDirectory(prefix));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Remove a file, or a directory tree child-first in sorted order.
    /// The root `/` itself is never removed, though its children are.
    pub fn rmtree(&mut self, path: &str) -> SyncResult<()> {
        let path = normalize(path)?;
        let st = self
            .stat(&path)?
            .ok_or_else(|| SyncError::NotFound(path.clone()))?;

        if st.is_file {
            log::info!("RM {path}");
            self.rm(&path)
        } else {
            let mut names = self.ls(&path)?;
            names.sort();
            for name in names {
                self.rmtree(&join_remote(&path, &name))?;
            }
            if path != "/" {
                log::info!("RMDIR {path}");
                self.rmdir(&path)?;
            }
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    /// Upload a local file or directory tree under the remote directory
    /// `dst`, which must already exist.
    ///
    /// With `contents`, `src` must be a directory and its children land
    /// directly under `dst`.  `overwrite` permits replacing existing
    /// files; `quick` skips files whose remote size already matches
    /// (sizes only — a same-size content change is not detected).
    pub fn upload(
        &mut self,
        src: &Path,
        dst: &str,
        contents: bool,
        overwrite: bool,
        quick: bool,
    ) -> SyncResult<()> {
        let dst = normalize(dst)?;
        match self.stat(&dst)? {
            Some(st) if st.is_dir => {}
            _ => return Err(SyncError::NotADirectory(dst)),
        }

        if contents {
            if !src.is_dir() {
                return Err(SyncError::BadSource(format!(
                    "--contents was given but {} is not a directory",
                    src.display()
                )));
            }
            for child in sorted_children(src)? {
                self.upload_entry(&child, &dst, overwrite, quick)?;
            }
            Ok(())
        } else {
            self.upload_entry(src, &dst, overwrite, quick)
        }
    }

    fn upload_entry(
        &mut self,
        src: &Path,
        dst: &str,
        overwrite: bool,
        quick: bool,
    ) -> SyncResult<()> {
        let name = src
            .file_name()
            .ok_or_else(|| SyncError::BadSource(src.display().to_string()))?
            .to_string_lossy()
            .into_owned();
        let dst_path = join_remote(dst, &name);

        if src.is_dir() {
            match self.stat(&dst_path)? {
                None => {
                    log::info!("MKDIR {dst_path}");
                    self.mkdir(&dst_path)?;
                }
                Some(st) if st.is_file => {
                    return Err(SyncError::DirectoryOverFile {
                        src: src.display().to_string(),
                        dst: dst_path,
                    });
                }
                Some(_) => {}
            }
            for child in sorted_children(src)? {
                self.upload_entry(&child, &dst_path, overwrite, quick)?;
            }
            Ok(())
        } else if src.is_file() {
            self.upload_file(src, &dst_path, overwrite, quick)
        } else {
            Err(SyncError::BadSource(src.display().to_string()))
        }
    }

    fn upload_file(
        &mut self,
        src: &Path,
        dst: &str,
        overwrite: bool,
        quick: bool,
    ) -> SyncResult<()> {
        let st = self.stat(dst)?;
        if let Some(st) = &st {
            if !overwrite {
                return Err(SyncError::DestinationExists(dst.to_string()));
            }
            if st.is_dir {
                return Err(SyncError::FileOverDirectory {
                    src: src.display().to_string(),
                    dst: dst.to_string(),
                });
            }
        }

        let data = fs::read(src)?;
        if quick {
            if let Some(st) = &st {
                if data.len() as u64 == st.size {
                    log::info!("SKIP {dst}");
                    return Ok(());
                }
            }
        }

        log::info!("UPLOAD {dst}");
        self.session.execute_with(
            &format!("_fout = open({},'wb+')", quote_str(dst)),
            PROMPT,
            false,
        )?;

        let total = data.len() as u64;
        let mut data = Bytes::from(data);
        let mut progress = Progress::new(total);
        while !data.is_empty() {
            let offer = data.len().min(MAX_WRITE_PER_PASS);
            let reply = self
                .session
                .evaluate(&format!("_fout.write({})", quote_bytes(&data[..offer])))?;
            let written = reply
                .as_int()
                .ok_or_else(|| SyncError::UnexpectedReply("write returned no count".into()))?;
            if written <= 0 || written as usize > offer {
                return Err(SyncError::UnexpectedReply(format!(
                    "write accepted {written} of {offer} bytes"
                )));
            }
            data.advance(written as usize);
            progress.chunk(written as u64);
        }
        self.session.execute_with("_fout.close()", PROMPT, false)?;
        self.session.execute_with("del _fout", PROMPT, false)?;
        progress.done(dst);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    /// Download a remote file or directory tree into the local directory
    /// `dst`.  Mirror of [`RemoteFs::upload`].
    pub fn download(
        &mut self,
        src: &str,
        dst: &Path,
        contents: bool,
        overwrite: bool,
        quick: bool,
    ) -> SyncResult<()> {
        let src = normalize(src)?;
        if !dst.is_dir() {
            return Err(SyncError::NotADirectory(dst.display().to_string()));
        }

        if contents {
            match self.stat(&src)? {
                Some(st) if st.is_dir => {}
                _ => {
                    return Err(SyncError::BadSource(format!(
                        "--contents was given but {src} is not a directory"
                    )));
                }
            }
            let mut names = self.ls(&src)?;
            names.sort();
            for name in names {
                if name == "." || name == ".." {
                    continue;
                }
                self.download_entry(&join_remote(&src, &name), dst, overwrite, quick)?;
            }
            Ok(())
        } else {
            self.download_entry(&src, dst, overwrite, quick)
        }
    }

    fn download_entry(
        &mut self,
        src: &str,
        dst: &Path,
        overwrite: bool,
        quick: bool,
    ) -> SyncResult<()> {
        let name = src.rsplit('/').next().unwrap_or(src);
        let dst_path = dst.join(name);

        let st = self
            .stat(src)?
            .ok_or_else(|| SyncError::NotFound(src.to_string()))?;

        if st.is_dir {
            if dst_path.is_file() {
                return Err(SyncError::DirectoryOverFile {
                    src: src.to_string(),
                    dst: dst_path.display().to_string(),
                });
            }
            if !dst_path.is_dir() {
                log::info!("MKDIR {}", dst_path.display());
                fs::create_dir(&dst_path)?;
            }
            let mut names = self.ls(src)?;
            names.sort();
            for name in names {
                if name == "." || name == ".." {
                    continue;
                }
                self.download_entry(&join_remote(src, &name), &dst_path, overwrite, quick)?;
            }
            Ok(())
        } else {
            self.download_file(src, &dst_path, overwrite, quick, st)
        }
    }

    fn download_file(
        &mut self,
        src: &str,
        dst: &Path,
        overwrite: bool,
        quick: bool,
        st: StatResult,
    ) -> SyncResult<()> {
        if dst.is_dir() {
            return Err(SyncError::FileOverDirectory {
                src: src.to_string(),
                dst: dst.display().to_string(),
            });
        }
        if dst.is_file() {
            if !overwrite {
                return Err(SyncError::DestinationExists(dst.display().to_string()));
            }
            if quick && fs::metadata(dst)?.len() == st.size {
                log::info!("SKIP {}", dst.display());
                return Ok(());
            }
        }

        log::info!("DOWNLOAD {}", dst.display());
        self.session.execute_with(
            &format!("_fin = open({},'rb')", quote_str(src)),
            PROMPT,
            false,
        )?;

        let mut fout = fs::File::create(dst)?;
        let mut progress = Progress::new(st.size);
        loop {
            let reply = self
                .session
                .evaluate(&format!("_fin.read({MAX_READ_PER_PASS})"))?;
            let chunk = reply
                .as_bytes()
                .ok_or_else(|| SyncError::UnexpectedReply("read returned no bytes".into()))?;
            if chunk.is_empty() {
                break;
            }
            fout.write_all(chunk)?;
            progress.chunk(chunk.len() as u64);
        }
        self.session.execute_with("_fin.close()", PROMPT, false)?;
        self.session.execute_with("del _fin", PROMPT, false)?;
        progress.done(&dst.display().to_string());
        Ok(())
    }
}

/// Children of a local directory in lexically sorted order.
fn sorted_children(dir: &Path) -> SyncResult<Vec<std::path::PathBuf>> {
    let mut children: Vec<_> = fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    children.sort();
    Ok(children)
}

// ---------------------------------------------------------------------------
// Transfer progress
// ---------------------------------------------------------------------------

/// Observational byte accounting for one file transfer.
struct Progress {
    total: u64,
    transferred: u64,
    chunks: u64,
}

impl Progress {
    fn new(total: u64) -> Self {
        Self {
            total,
            transferred: 0,
            chunks: 0,
        }
    }

    fn chunk(&mut self, n: u64) {
        self.transferred += n;
        self.chunks += 1;
        log::trace!("chunk {}: +{n} bytes", self.chunks);
        if self.chunks % CHUNKS_PER_TICK == 0 {
            if self.total > 0 {
                log::debug!(
                    "  {:.2}K, {:.2}%",
                    self.transferred as f64 / 1024.0,
                    100.0 * self.transferred as f64 / self.total as f64
                );
            } else {
                log::debug!("  {:.2}K", self.transferred as f64 / 1024.0);
            }
        }
    }

    fn done(&self, what: &str) {
        log::debug!("{what}: {:.2} KB transferred", self.transferred as f64 / 1024.0);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use fs2::FileExt;
use parking_lot::Mutex;
use time::OffsetDateTime;

use super::record::signature_from_line;
use crate::{
    error::{TpsError, TpsResult},
    fs_utils,
};

/// Durable append-only destination for audit bytes.
pub trait AuditSink: Send {
    fn open(&mut self) -> TpsResult<()>;
    /// Append `bytes` as one unit and make them durable.
    fn write(&mut self, bytes: &[u8]) -> TpsResult<()>;
    fn close(&mut self) -> TpsResult<()>;
    /// Retire the current file and start a fresh one. Returns the retired path.
    fn rotate(&mut self) -> TpsResult<Option<PathBuf>>;
    /// Bytes in the current file.
    fn size(&self) -> u64;
    /// When the current file was started.
    fn opened_at(&self) -> OffsetDateTime;
    /// Most recent chained signature already on the sink, newest first scan.
    fn last_signature(&self) -> TpsResult<Option<String>>;
}

pub struct FileAuditSink {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    opened_at: OffsetDateTime,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> TpsResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs_utils::ensure_secure_dir(dir).map_err(TpsError::sink)?;
        }
        Ok(Self {
            path,
            file: None,
            size: 0,
            opened_at: OffsetDateTime::now_utc(),
        })
    }

    fn append(file: &File, bytes: &[u8]) -> io::Result<()> {
        FileExt::lock_exclusive(file)?;
        let mut writer = file;
        let written = writer.write_all(bytes).and_then(|_| file.sync_data());
        FileExt::unlock(file)?;
        written
    }
}

impl AuditSink for FileAuditSink {
    fn open(&mut self) -> TpsResult<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = fs_utils::open_append_secure(&self.path).map_err(TpsError::sink)?;
        let metadata = file.metadata().map_err(TpsError::sink)?;
        self.size = metadata.len();
        self.opened_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        if self.size == 0 {
            self.opened_at = OffsetDateTime::now_utc();
        }
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> TpsResult<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| TpsError::sink("audit sink is not open"))?;
        Self::append(file, bytes).map_err(TpsError::sink)?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> TpsResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(TpsError::sink)?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> TpsResult<Option<PathBuf>> {
        self.close()?;
        let retired = if self.path.exists() && self.size > 0 {
            let target = fs_utils::rotated_path(&self.path, OffsetDateTime::now_utc());
            std::fs::rename(&self.path, &target).map_err(TpsError::sink)?;
            Some(target)
        } else {
            None
        };
        self.size = 0;
        self.open()?;
        self.opened_at = OffsetDateTime::now_utc();
        Ok(retired)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn opened_at(&self) -> OffsetDateTime {
        self.opened_at
    }

    /// Newest signature in the current file, else in the newest rotated file:
    /// a rotation right after the last signed flush leaves the current file
    /// without one.
    fn last_signature(&self) -> TpsResult<Option<String>> {
        if let Some(sig) = newest_signature_in(&self.path)? {
            return Ok(Some(sig));
        }
        let rotated = fs_utils::rotated_siblings(&self.path).map_err(TpsError::sink)?;
        match rotated.last() {
            Some((path, _)) => newest_signature_in(path),
            None => Ok(None),
        }
    }
}

fn newest_signature_in(path: &Path) -> TpsResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(TpsError::sink)?;
    Ok(contents
        .lines()
        .rev()
        .find_map(signature_from_line)
        .map(str::to_string))
}

/// In-memory sink. Each `write` call is kept as one chunk so tests can inspect
/// exactly what was flushed together.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Default)]
struct MemorySinkState {
    open: bool,
    fail_writes: bool,
    chunks: Vec<Vec<u8>>,
    retired: Vec<Vec<Vec<u8>>>,
    size: u64,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate as if a previous process had written `lines`.
    pub fn with_existing(contents: &str) -> Self {
        let sink = Self::new();
        {
            let mut state = sink.inner.lock();
            state.size = contents.len() as u64;
            state.chunks.push(contents.as_bytes().to_vec());
        }
        sink
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.inner.lock().chunks.clone()
    }

    pub fn contents(&self) -> String {
        let state = self.inner.lock();
        String::from_utf8_lossy(&state.chunks.concat()).into_owned()
    }

    pub fn rotations(&self) -> usize {
        self.inner.lock().retired.len()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

impl AuditSink for MemoryAuditSink {
    fn open(&mut self) -> TpsResult<()> {
        self.inner.lock().open = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> TpsResult<()> {
        let mut state = self.inner.lock();
        if state.fail_writes || !state.open {
            return Err(TpsError::sink("memory sink rejected write"));
        }
        state.size += bytes.len() as u64;
        state.chunks.push(bytes.to_vec());
        Ok(())
    }

    fn close(&mut self) -> TpsResult<()> {
        self.inner.lock().open = false;
        Ok(())
    }

    fn rotate(&mut self) -> TpsResult<Option<PathBuf>> {
        let mut state = self.inner.lock();
        let chunks = std::mem::take(&mut state.chunks);
        state.retired.push(chunks);
        state.size = 0;
        Ok(None)
    }

    fn size(&self) -> u64 {
        self.inner.lock().size
    }

    fn opened_at(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn last_signature(&self) -> TpsResult<Option<String>> {
        let contents = self.contents();
        Ok(contents
            .lines()
            .rev()
            .find_map(signature_from_line)
            .map(str::to_string))
    }
}

use std::{collections::HashSet, path::PathBuf, sync::Arc, time::Duration};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    record::{AuditRecord, Outcome, SIGNATURE_DETAIL_PREFIX, events},
    sink::{AuditSink, FileAuditSink},
};
use crate::{
    config::ConfigStore,
    error::{TpsError, TpsResult},
    signing::{AuditSigner, KeyRing, encode_signature},
};

const SETTINGS_PREFIX: &str = "log.instance.SignedAudit";

/// Called with the error when the trail can no longer guarantee durability.
pub type FatalHandler = Arc<dyn Fn(&TpsError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub file_name: PathBuf,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub signing: bool,
    pub signer_nickname: Option<String>,
    pub enabled: bool,
    /// `None` selects every event.
    pub events: Option<HashSet<String>>,
    /// Zero disables size-based rotation.
    pub max_file_size: u64,
    /// Zero disables age-based rotation.
    pub rotation_interval: Duration,
    /// Zero keeps rotated files forever.
    pub expiration: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            file_name: PathBuf::from("logs/signedAudit/tps_audit.log"),
            buffer_capacity: 512,
            flush_interval: Duration::from_secs(5),
            signing: false,
            signer_nickname: None,
            enabled: true,
            events: None,
            max_file_size: 2000 * 1024,
            rotation_interval: Duration::from_secs(30 * 24 * 3600),
            expiration: Duration::ZERO,
        }
    }
}

impl AuditSettings {
    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let defaults = Self::default();
        let key = |name: &str| format!("{SETTINGS_PREFIX}.{name}");
        let non_negative = |name: &str, default: i64| -> TpsResult<u64> {
            let value = config.get_int(&key(name), default)?;
            u64::try_from(value)
                .map_err(|_| TpsError::Config(format!("{} must not be negative", key(name))))
        };

        let buffer_capacity = non_negative("bufferSize", defaults.buffer_capacity as i64)? as usize;
        if buffer_capacity == 0 {
            return Err(TpsError::Config(format!("{} must be positive", key("bufferSize"))));
        }
        let events = config
            .get(&key("events"))
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect::<HashSet<_>>()
            })
            .filter(|set| !set.is_empty());

        Ok(Self {
            file_name: PathBuf::from(
                config.get_string(&key("fileName"), &defaults.file_name.to_string_lossy()),
            ),
            buffer_capacity,
            flush_interval: Duration::from_secs(non_negative(
                "flushInterval",
                defaults.flush_interval.as_secs() as i64,
            )?),
            signing: config.get_bool(&key("logSigning"), defaults.signing)?,
            signer_nickname: config.get(&key("signedAuditCertNickname")),
            enabled: config.get_bool(&key("enable"), defaults.enabled)?,
            events,
            max_file_size: non_negative("maxFileSize", (defaults.max_file_size / 1024) as i64)?
                * 1024,
            rotation_interval: Duration::from_secs(non_negative(
                "rollover_interval",
                defaults.rotation_interval.as_secs() as i64,
            )?),
            expiration: Duration::from_secs(non_negative("expirationTime", 0)?),
        })
    }
}

struct TrailState {
    open: bool,
    buffer: Vec<u8>,
    capacity: usize,
    enabled: bool,
    signing: bool,
    last_signature: Option<String>,
    rotation_pending: bool,
    events: Option<HashSet<String>>,
    max_file_size: u64,
    rotation_interval: Duration,
    sink: Box<dyn AuditSink>,
}

impl TrailState {
    fn rotation_due(&self) -> bool {
        if self.max_file_size > 0 && self.sink.size() >= self.max_file_size {
            return true;
        }
        if self.rotation_interval.is_zero() {
            return false;
        }
        let age = OffsetDateTime::now_utc() - self.sink.opened_at();
        age >= self.rotation_interval
    }

    fn selects(&self, event: &str) -> bool {
        self.events
            .as_ref()
            .map_or(true, |selected| selected.contains(event))
    }
}

/// Buffered, optionally signed audit log.
///
/// All buffer and sink state lives behind one lock, so a flush, its signature
/// record and any rotation that follows it are never interleaved with other
/// appends. Each signature covers the previous signature and the chunk just
/// written, chaining every signed chunk to the one before it.
pub struct AuditTrail {
    state: Mutex<TrailState>,
    signer: Option<Arc<dyn AuditSigner>>,
    fatal: FatalHandler,
    flush_interval: watch::Sender<Duration>,
}

impl AuditTrail {
    pub fn new(
        sink: Box<dyn AuditSink>,
        settings: &AuditSettings,
        signer: Option<Arc<dyn AuditSigner>>,
    ) -> TpsResult<Self> {
        if settings.signing && signer.is_none() {
            return Err(TpsError::config("audit signing enabled without a signing key"));
        }
        if settings.buffer_capacity == 0 {
            return Err(TpsError::config("audit buffer capacity must be positive"));
        }
        let (flush_interval, _) = watch::channel(settings.flush_interval);
        Ok(Self {
            state: Mutex::new(TrailState {
                open: false,
                buffer: Vec::with_capacity(settings.buffer_capacity),
                capacity: settings.buffer_capacity,
                enabled: settings.enabled,
                signing: settings.signing,
                last_signature: None,
                rotation_pending: false,
                events: settings.events.clone(),
                max_file_size: settings.max_file_size,
                rotation_interval: settings.rotation_interval,
                sink,
            }),
            signer,
            fatal: Arc::new(|err: &TpsError| {
                error!(error = %err, "audit trail cannot persist records, terminating");
                std::process::exit(1);
            }),
            flush_interval,
        })
    }

    /// File-backed trail using `log.instance.SignedAudit.*` settings.
    pub fn from_config(config: &dyn ConfigStore, keys: &KeyRing) -> TpsResult<Self> {
        let settings = AuditSettings::from_config(config)?;
        let signer = match &settings.signer_nickname {
            Some(nickname) => {
                let signer = keys.find_private_key(nickname);
                if signer.is_none() && settings.signing {
                    return Err(TpsError::Config(format!(
                        "audit signing key {nickname} not found"
                    )));
                }
                signer.map(|s| s as Arc<dyn AuditSigner>)
            }
            None => None,
        };
        let sink = FileAuditSink::new(&settings.file_name)?;
        Self::new(Box::new(sink), &settings, signer)
    }

    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal = handler;
        self
    }

    pub fn open(&self) -> TpsResult<()> {
        let mut state = self.state.lock();
        if state.open {
            return Ok(());
        }
        state.sink.open()?;
        if state.signing {
            state.last_signature = state.sink.last_signature()?;
            debug!(
                seeded = state.last_signature.is_some(),
                "audit signature chain resumed"
            );
        }
        state.open = true;
        info!(capacity = state.capacity, signing = state.signing, "audit trail opened");
        Ok(())
    }

    /// Queue a record. Records are dropped while auditing is disabled, while
    /// the trail is closed, or when their event is not selected.
    ///
    /// Signature records are written only by the trail itself.
    pub fn append(&self, record: &AuditRecord) -> TpsResult<()> {
        if record.event == events::AUDIT_LOG_SIGNING {
            return Err(TpsError::invalid("AUDIT_LOG_SIGNING records are reserved"));
        }
        let mut state = self.state.lock();
        if !state.open || !state.enabled || !state.selects(&record.event) {
            return Ok(());
        }
        let line = record.format_line();
        let bytes = line.as_bytes();
        if state.buffer.len() + bytes.len() >= state.capacity {
            self.flush_locked(&mut state)?;
        }
        if bytes.len() >= state.capacity {
            // Too large to ever buffer: goes out unsigned.
            warn!(len = bytes.len(), capacity = state.capacity, "audit record bypasses buffer");
            self.write_locked(&mut state, bytes)?;
            self.finish_write(&mut state, false)?;
        } else {
            state.buffer.extend_from_slice(bytes);
        }
        Ok(())
    }

    pub fn flush_now(&self) -> TpsResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        self.flush_locked(&mut state)
    }

    /// Timer entry point: flush if anything is buffered, and apply age-based
    /// rotation even when idle.
    pub fn flush_if_pending(&self) -> TpsResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        if state.buffer.is_empty() {
            self.finish_write(&mut state, false)
        } else {
            self.flush_locked(&mut state)
        }
    }

    pub fn set_flush_interval(&self, seconds: u64) {
        self.flush_interval.send_replace(Duration::from_secs(seconds));
    }

    pub fn flush_interval(&self) -> Duration {
        *self.flush_interval.borrow()
    }

    pub fn subscribe_interval(&self) -> watch::Receiver<Duration> {
        self.flush_interval.subscribe()
    }

    pub fn set_buffer_capacity(&self, capacity: usize) -> TpsResult<()> {
        if capacity == 0 {
            return Err(TpsError::invalid("audit buffer capacity must be positive"));
        }
        let mut state = self.state.lock();
        state.capacity = capacity;
        if state.open && state.buffer.len() > capacity {
            self.flush_locked(&mut state)?;
        }
        Ok(())
    }

    pub fn enable_signing(&self, enabled: bool) -> TpsResult<()> {
        if enabled && self.signer.is_none() {
            return Err(TpsError::config("no audit signing key configured"));
        }
        let mut state = self.state.lock();
        if enabled && !state.signing && state.open && state.last_signature.is_none() {
            state.last_signature = state.sink.last_signature()?;
        }
        state.signing = enabled;
        info!(signing = enabled, "audit signing toggled");
        Ok(())
    }

    pub fn enable_audit(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
        info!(enabled, "audit logging toggled");
    }

    /// Flush and close the sink. Stop the flush timer before calling this.
    pub fn close(&self) -> TpsResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        state.sink.close()?;
        state.open = false;
        info!("audit trail closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn unflushed_bytes(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn last_signature(&self) -> Option<String> {
        self.state.lock().last_signature.clone()
    }

    pub fn rotation_pending(&self) -> bool {
        self.state.lock().rotation_pending
    }

    fn flush_locked(&self, state: &mut TrailState) -> TpsResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut state.buffer);
        self.write_locked(state, &chunk)?;
        metrics::counter!("tps_audit_flush_total").increment(1);

        let signed = match (&self.signer, state.signing) {
            (Some(signer), true) => {
                self.sign_chunk(state, signer.as_ref(), &chunk)?;
                true
            }
            _ => false,
        };
        self.finish_write(state, signed)
    }

    fn sign_chunk(
        &self,
        state: &mut TrailState,
        signer: &dyn AuditSigner,
        chunk: &[u8],
    ) -> TpsResult<()> {
        let data = match &state.last_signature {
            Some(previous) => {
                let mut data = Vec::with_capacity(previous.len() + 1 + chunk.len());
                data.extend_from_slice(previous.as_bytes());
                data.push(b'\n');
                data.extend_from_slice(chunk);
                data
            }
            None => chunk.to_vec(),
        };
        let raw = signer.sign(&data).inspect_err(|err| (self.fatal)(err))?;
        let encoded = encode_signature(&raw);
        let record = AuditRecord::system(
            events::AUDIT_LOG_SIGNING,
            Outcome::Success,
            format!("{SIGNATURE_DETAIL_PREFIX}{encoded}"),
        );
        self.write_locked(state, record.format_line().as_bytes())?;
        state.last_signature = Some(encoded);
        metrics::counter!("tps_audit_signature_total").increment(1);
        Ok(())
    }

    fn write_locked(&self, state: &mut TrailState, bytes: &[u8]) -> TpsResult<()> {
        state.sink.write(bytes).map_err(|err| {
            let err = match err {
                TpsError::SinkWriteFailed(_) => err,
                other => TpsError::sink(other),
            };
            (self.fatal)(&err);
            err
        })
    }

    /// Rotate if a threshold was crossed. While signing, rotation waits for a
    /// signed flush so no file ends with an unsigned tail.
    fn finish_write(&self, state: &mut TrailState, signed_flush: bool) -> TpsResult<()> {
        if !state.rotation_pending && !state.rotation_due() {
            return Ok(());
        }
        if state.signing && !signed_flush {
            if !state.rotation_pending {
                debug!("audit rotation deferred until next signed flush");
            }
            state.rotation_pending = true;
            return Ok(());
        }
        let retired = state.sink.rotate().inspect_err(|err| (self.fatal)(err))?;
        state.rotation_pending = false;
        info!(retired = ?retired, "audit log rotated");
        Ok(())
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, macros::format_description};

/// Event names with a fixed meaning to log viewers.
pub mod events {
    pub const AUDIT_LOG_SIGNING: &str = "AUDIT_LOG_SIGNING";
    pub const AUDIT_LOG_STARTUP: &str = "AUDIT_LOG_STARTUP";
    pub const AUDIT_LOG_SHUTDOWN: &str = "AUDIT_LOG_SHUTDOWN";
    pub const CONFIG_SIGNED_AUDIT: &str = "CONFIG_SIGNED_AUDIT";
    pub const TOKEN_AUTH: &str = "TOKEN_AUTH";
    pub const TOKEN_KEY_CHANGEOVER: &str = "TOKEN_KEY_CHANGEOVER";
    pub const SERVER_SIDE_KEYGEN: &str = "SERVER_SIDE_KEYGEN_REQUEST_PROCESSED";
    pub const KEY_RECOVERY: &str = "KEY_RECOVERY_REQUEST_PROCESSED";
}

pub const SYSTEM_SUBJECT: &str = "$System$";
pub const SIGNATURE_MARKER: &str = "[AuditEvent=AUDIT_LOG_SIGNING]";
pub const SIGNATURE_DETAIL_PREFIX: &str = "signature of audit buffer just flushed: sig: ";
/// Everything after `[AuditEvent=` on a genuine signature record, up to the
/// encoded signature.
const SIGNATURE_RECORD_TAIL: &str =
    "AUDIT_LOG_SIGNING][SubjectID=$System$][Outcome=Success] signature of audit buffer just flushed: sig: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "Success",
            Outcome::Failure => "Failure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: OffsetDateTime,
    pub thread_id: String,
    pub event: String,
    pub subject_id: String,
    pub outcome: Outcome,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(
        event: impl Into<String>,
        subject_id: impl Into<String>,
        outcome: Outcome,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            thread_id: current_thread_id(),
            event: event.into(),
            subject_id: subject_id.into(),
            outcome,
            detail: detail.into(),
        }
    }

    /// A record attributed to the engine itself rather than an operator.
    pub fn system(event: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self::new(event, SYSTEM_SUBJECT, outcome, detail)
    }

    /// Render as one newline-terminated log line. Line breaks in any field are
    /// flattened, and brackets in the bracketed header fields are replaced, so
    /// a caller-supplied value can neither start a new record nor add a field.
    pub fn format_line(&self) -> String {
        let timestamp = self
            .timestamp
            .format(format_description!(
                "[day]/[month repr:short]/[year]:[hour]:[minute]:[second] [offset_hour sign:mandatory][offset_minute]"
            ))
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        let detail = self.detail.replace(['\r', '\n'], " ");
        format!(
            "[{timestamp}] [{}] [AuditEvent={}][SubjectID={}][Outcome={}] {detail}\n",
            header_field(&self.thread_id),
            header_field(&self.event),
            header_field(&self.subject_id),
            self.outcome
        )
    }
}

fn header_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '\r' | '\n' => ' ',
            '[' => '(',
            ']' => ')',
            other => other,
        })
        .collect()
}

fn current_thread_id() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", thread.id()),
    }
}

/// Pull the encoded signature out of an `AUDIT_LOG_SIGNING` line.
///
/// Only the record's own event field counts: the first `[AuditEvent=` on the
/// line, which header sanitising keeps out of the timestamp and thread id.
/// Marker text inside another record's detail is ignored.
pub fn signature_from_line(line: &str) -> Option<&str> {
    let (_, record) = line.split_once("[AuditEvent=")?;
    let sig = record.strip_prefix(SIGNATURE_RECORD_TAIL)?.trim();
    (!sig.is_empty()).then_some(sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn line_format_is_stable() {
        let record = AuditRecord {
            timestamp: datetime!(2024-03-05 07:08:09 UTC),
            thread_id: "worker-3".into(),
            event: events::TOKEN_AUTH.into(),
            subject_id: "admin".into(),
            outcome: Outcome::Failure,
            detail: "card 0102\nrejected".into(),
        };
        assert_eq!(
            record.format_line(),
            "[05/Mar/2024:07:08:09 +0000] [worker-3] [AuditEvent=TOKEN_AUTH][SubjectID=admin][Outcome=Failure] card 0102 rejected\n"
        );
    }

    #[test]
    fn extracts_signature_from_signing_record() {
        let record = AuditRecord::system(
            events::AUDIT_LOG_SIGNING,
            Outcome::Success,
            format!("{SIGNATURE_DETAIL_PREFIX}QUJD"),
        );
        let line = record.format_line();
        assert_eq!(signature_from_line(&line), Some("QUJD"));
        assert!(line.contains("[SubjectID=$System$]"));
        assert_eq!(signature_from_line("[AuditEvent=TOKEN_AUTH] sig: QUJD"), None);
        assert!(line.starts_with('['));
        assert!(line.contains(SIGNATURE_MARKER));
    }

    #[test]
    fn header_fields_cannot_inject_records() {
        let forged = format!(
            "op\n[01/Jan/2024:00:00:00 +0000] [t] {SIGNATURE_MARKER}[SubjectID=$System$][Outcome=Success] {SIGNATURE_DETAIL_PREFIX}Rk9SR0VE"
        );
        let record = AuditRecord::new(events::TOKEN_AUTH, forged, Outcome::Success, "ok");
        let line = record.format_line();
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("[AuditEvent=TOKEN_AUTH][SubjectID=op (01/Jan/2024"));
        assert_eq!(signature_from_line(&line), None);

        let mut threaded = AuditRecord::new(events::TOKEN_AUTH, "op", Outcome::Success, "ok");
        threaded.thread_id = "t] [AuditEvent=AUDIT_LOG_SIGNING".into();
        assert!(threaded.format_line().contains("[AuditEvent=TOKEN_AUTH]"));
        assert_eq!(signature_from_line(&threaded.format_line()), None);
    }

    #[test]
    fn signature_text_in_detail_is_not_a_signature() {
        let record = AuditRecord::new(
            events::TOKEN_AUTH,
            "op",
            Outcome::Success,
            format!("{SIGNATURE_MARKER}[SubjectID=$System$][Outcome=Success] {SIGNATURE_DETAIL_PREFIX}Rk9SR0VE"),
        );
        assert_eq!(signature_from_line(&record.format_line()), None);
    }
}

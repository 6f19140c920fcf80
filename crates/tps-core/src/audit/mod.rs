//! Buffered, chained-signature audit logging.

mod record;
mod sink;
mod trail;
mod verify;

pub use record::{
    AuditRecord, Outcome, SIGNATURE_DETAIL_PREFIX, SIGNATURE_MARKER, SYSTEM_SUBJECT, events,
    signature_from_line,
};
pub use sink::{AuditSink, FileAuditSink, MemoryAuditSink};
pub use trail::{AuditSettings, AuditTrail, FatalHandler};
pub use verify::{ChainReport, verify_chain, verify_contents};

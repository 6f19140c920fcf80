//! Offline verification of a signed audit log.

use std::path::Path;

use p256::ecdsa::VerifyingKey;
use serde::Serialize;

use super::record::signature_from_line;
use crate::{
    error::{TpsError, TpsResult},
    signing::verify_signature,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub signatures: usize,
    pub verified: usize,
    /// 1-based line numbers of signature records that did not verify.
    pub failures: Vec<usize>,
    /// Lines written outside any signed chunk (oversized records).
    pub unsigned_lines: usize,
    /// Lines after the final signature record, not yet covered by one.
    pub trailing_lines: usize,
    /// Carry into the next rotated file when verifying a sequence.
    pub last_signature: Option<String>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Re-derive every chained signature in `path`.
///
/// `initial` is the signature that preceded the first chunk, i.e. the last
/// signature of the previous rotated file, or `None` for the first file.
pub fn verify_chain(
    path: &Path,
    key: &VerifyingKey,
    initial: Option<String>,
) -> TpsResult<ChainReport> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| TpsError::Config(format!("{}: {e}", path.display())))?;
    Ok(verify_contents(&contents, key, initial))
}

pub fn verify_contents(contents: &str, key: &VerifyingKey, initial: Option<String>) -> ChainReport {
    let mut report = ChainReport {
        last_signature: initial,
        ..ChainReport::default()
    };
    // Byte offsets of the lines seen since the last signature record.
    let mut line_starts: Vec<usize> = Vec::new();
    let mut offset = 0;

    for (index, line) in contents.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += line.len();
        let Some(signature) = signature_from_line(line) else {
            line_starts.push(start);
            continue;
        };
        report.signatures += 1;
        let segment = Segment {
            contents,
            line_starts: &line_starts,
            end: start,
        };
        match segment.signed_suffix(report.last_signature.as_deref(), key, signature) {
            Some(skipped) => {
                report.verified += 1;
                report.unsigned_lines += skipped;
            }
            None => {
                tracing::warn!(line = index + 1, "audit signature does not verify");
                report.failures.push(index + 1);
            }
        }
        report.last_signature = Some(signature.to_string());
        line_starts.clear();
    }
    report.trailing_lines = line_starts.len();
    report
}

/// Lines between two signature records, as offsets into the file contents.
struct Segment<'a> {
    contents: &'a str,
    line_starts: &'a [usize],
    end: usize,
}

impl Segment<'_> {
    /// Find how many leading lines fall outside the signed chunk. Oversized
    /// records are written straight to the file after a flush, so they can
    /// only precede the chunk that the next signature covers.
    fn signed_suffix(
        &self,
        previous: Option<&str>,
        key: &VerifyingKey,
        signature: &str,
    ) -> Option<usize> {
        let prefix_len = previous.map_or(0, |p| p.len() + 1);
        let mut data = Vec::with_capacity(prefix_len + self.end - self.line_starts.first()?);
        if let Some(previous) = previous {
            data.extend_from_slice(previous.as_bytes());
            data.push(b'\n');
        }
        let bytes = self.contents.as_bytes();
        self.line_starts.iter().position(|&start| {
            data.truncate(prefix_len);
            data.extend_from_slice(&bytes[start..self.end]);
            verify_signature(key, &data, signature)
        })
    }
}

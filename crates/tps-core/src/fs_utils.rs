use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use time::{OffsetDateTime, macros::format_description};

pub fn ensure_secure_dir(path: &Path) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Open `path` for appending, creating it owner-read/write only.
pub fn open_append_secure(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let file = options.open(path)?;
    #[cfg(unix)]
    {
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)?;
    }
    Ok(file)
}

/// Name a rotated log: `<file>.<YYYYMMDDHHMMSS>`, adding a counter on collision.
pub fn rotated_path(path: &Path, at: OffsetDateTime) -> PathBuf {
    let fmt = format_description!("[year][month][day][hour][minute][second]");
    let stamp = at
        .format(fmt)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    let base = path.as_os_str().to_string_lossy().into_owned();
    let mut candidate = PathBuf::from(format!("{base}.{stamp}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{stamp}.{n}"));
        n += 1;
    }
    candidate
}

/// Rotated siblings of `path` with their modification times, oldest first.
pub fn rotated_siblings(path: &Path) -> io::Result<Vec<(PathBuf, SystemTime)>> {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = format!("{name}.");
    let mut found = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(suffix) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        if !is_rotation_suffix(suffix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            found.push((entry.path(), metadata.modified()?));
        }
    }
    found.sort_by(|(a_path, a_time), (b_path, b_time)| {
        a_time.cmp(b_time).then_with(|| a_path.cmp(b_path))
    });
    Ok(found)
}

/// Matches what [`rotated_path`] appends: 14 digits, optionally `.N`.
fn is_rotation_suffix(suffix: &str) -> bool {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    let (stamp, counter) = match suffix.split_once('.') {
        Some((stamp, counter)) => (stamp, Some(counter)),
        None => (suffix, None),
    };
    stamp.len() == 14 && all_digits(stamp) && counter.map_or(true, all_digits)
}

//! Database-directory file naming.
//!
//! Everything a column family persists lives in one directory:
//!
//! | Name | Contents |
//! |------|----------|
//! | `CURRENT` | Text file naming the live MANIFEST |
//! | `LOCK` | Advisory lock |
//! | `LOG`, `LOG.old` | Human-readable logs |
//! | `MANIFEST-%06u` | Version-edit log |
//! | `%06u.log` | Commit-log segment |
//! | `%06u.sst` | SSTable |
//! | `%06u.dbtmp` | Rename-in target |

use std::path::{Path, PathBuf};

/// The kind of file a directory entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `CURRENT`.
    Current,
    /// `LOCK`.
    Lock,
    /// `LOG` or `LOG.old`.
    InfoLog,
    /// `MANIFEST-%06u`.
    Manifest(u64),
    /// `%06u.log`.
    CommitLog(u64),
    /// `%06u.sst`.
    Table(u64),
    /// `%06u.dbtmp`.
    Temp(u64),
}

/// `DB/CURRENT`.
pub fn current_file(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

/// `DB/LOCK`.
pub fn lock_file(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

/// `DB/LOG`.
pub fn info_log_file(dir: &Path) -> PathBuf {
    dir.join("LOG")
}

/// `DB/LOG.old`.
pub fn old_info_log_file(dir: &Path) -> PathBuf {
    dir.join("LOG.old")
}

/// `DB/MANIFEST-%06u`.
pub fn manifest_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{number:06}"))
}

/// `DB/%06u.log`.
pub fn log_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.log"))
}

/// `DB/%06u.sst`.
pub fn table_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.sst"))
}

/// `DB/%06u.dbtmp`.
pub fn temp_file(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{number:06}.dbtmp"))
}

/// Classify a file name from a directory listing.
///
/// Returns `None` for names this engine does not own.
pub fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::Lock),
        "LOG" | "LOG.old" => return Some(FileType::InfoLog),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse::<u64>().ok().map(FileType::Manifest);
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse::<u64>().ok().map(FileType::CommitLog);
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return stem.parse::<u64>().ok().map(FileType::Table);
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        return stem.parse::<u64>().ok().map(FileType::Temp);
    }
    None
}

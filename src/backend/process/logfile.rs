//! Per-world output log files.
//!
//! Each line is stored as `[stream] text`. A [`LogWriter`] rotates the file
//! once it grows past [`MAX_LOG_BYTES`], including while the server runs, and
//! at most [`MAX_ROTATED`] rotations are kept.

use chrono::Utc;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::broadcast::StreamTag;
use crate::error::{Error, Result};

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const MAX_ROTATED: usize = 5;
/// Read size when scanning a log backwards.
const TAIL_CHUNK: u64 = 8 * 1024;

/// Append-only writer for one run of a world.
#[derive(Debug)]
pub(in crate::backend) struct LogWriter {
    path: PathBuf,
    file: tokio::fs::File,
    written: u64,
    limit: u64,
    /// Offset in the current file where this run's output begins.
    history_end: u64,
}

impl LogWriter {
    /// Open `path` for appending, rotating it first when it is already full.
    pub(in crate::backend) async fn open(path: PathBuf) -> Result<Self> {
        Self::open_with_limit(path, MAX_LOG_BYTES).await
    }

    async fn open_with_limit(path: PathBuf, limit: u64) -> Result<Self> {
        rotate_if_needed(&path, limit)?;
        let file = open_append(&path)
            .await
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        let written = file
            .metadata()
            .await
            .map_err(|e| Error::io(format!("inspecting {}", path.display()), e))?
            .len();
        Ok(Self {
            path,
            file,
            written,
            limit,
            history_end: written,
        })
    }

    /// Bytes in the current file written before this run started.
    pub(in crate::backend) const fn history_end(&self) -> u64 {
        self.history_end
    }

    /// Append one entry and rotate once the file reaches its limit.
    pub(in crate::backend) async fn append(&mut self, entry: &str) -> std::io::Result<()> {
        self.file.write_all(entry.as_bytes()).await?;
        self.file.flush().await?;
        self.written += entry.len() as u64;
        if self.written >= self.limit {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let rotated = rotated_path(&self.path);
        tokio::fs::rename(&self.path, &rotated).await?;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        self.history_end = 0;

        tracing::info!(
            log = %self.path.display(),
            rotated_to = %rotated.display(),
            "Rotated world log file"
        );

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || cleanup_rotated(&path, MAX_ROTATED));
        Ok(())
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Split a stored line into its stream tag and text. Untagged lines count as
/// stdout.
pub(super) fn parse_entry(line: &str) -> (StreamTag, &str) {
    if let Some(rest) = line.strip_prefix("[stderr] ") {
        (StreamTag::Stderr, rest)
    } else if let Some(rest) = line.strip_prefix("[stdout] ") {
        (StreamTag::Stdout, rest)
    } else if let Some(rest) = line.strip_prefix("[info] ") {
        (StreamTag::Info, rest)
    } else {
        (StreamTag::Stdout, line)
    }
}

/// Last `lines` stored lines, oldest first. A missing file has no lines.
pub(super) fn tail_log(log_path: &Path, lines: usize) -> Result<Vec<String>> {
    tail_log_before(log_path, u64::MAX, lines)
}

/// Last `lines` lines stored before byte offset `end`, oldest first.
///
/// The file is read backwards in chunks, so the cost depends on `lines`
/// rather than on the size of the file.
pub(super) fn tail_log_before(log_path: &Path, end: u64, lines: usize) -> Result<Vec<String>> {
    let context = || format!("reading {}", log_path.display());
    let mut file = match fs::File::open(log_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io(format!("opening {}", log_path.display()), e)),
    };
    if lines == 0 {
        return Ok(Vec::new());
    }

    let len = file.metadata().map_err(|e| Error::io(context(), e))?.len();
    let mut pos = end.min(len);
    let mut data: Vec<u8> = Vec::new();

    // One newline more than requested guarantees the first kept line is whole.
    while pos > 0 && count_newlines(&data) <= lines {
        let size = TAIL_CHUNK.min(pos);
        pos -= size;
        let mut chunk = vec![0; usize::try_from(size).unwrap_or(0)];
        file.seek(SeekFrom::Start(pos)).map_err(|e| Error::io(context(), e))?;
        file.read_exact(&mut chunk).map_err(|e| Error::io(context(), e))?;
        chunk.extend_from_slice(&data);
        data = chunk;
    }

    let text = String::from_utf8_lossy(&data);
    let mut all: Vec<&str> = text.lines().collect();
    if pos > 0 && !all.is_empty() {
        all.remove(0);
    }
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|line| (*line).to_string()).collect())
}

fn count_newlines(data: &[u8]) -> usize {
    data.iter().filter(|b| **b == b'\n').count()
}

/// Rename the log aside when it has reached `limit`. Returns whether it
/// rotated.
fn rotate_if_needed(log_path: &Path, limit: u64) -> Result<bool> {
    let metadata = match fs::metadata(log_path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::io(format!("inspecting {}", log_path.display()), e)),
    };

    if metadata.len() < limit {
        return Ok(false);
    }

    let rotated_path = rotated_path(log_path);
    fs::rename(log_path, &rotated_path)
        .map_err(|e| Error::io(format!("rotating {}", log_path.display()), e))?;

    tracing::info!(
        log = %log_path.display(),
        rotated_to = %rotated_path.display(),
        "Rotated world log file"
    );

    cleanup_rotated(log_path, MAX_ROTATED);
    Ok(true)
}

/// Free `{name}.{timestamp}` path next to the log, suffixed with a counter
/// when several rotations happen within one second.
fn rotated_path(log_path: &Path) -> PathBuf {
    let name = log_path.file_name().unwrap_or_default().to_string_lossy();
    let base = format!("{name}.{}", Utc::now().format("%Y%m%d-%H%M%S"));
    let mut candidate = log_path.with_file_name(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = log_path.with_file_name(format!("{base}-{n}"));
        n += 1;
    }
    candidate
}

/// Whether `file_name` is a rotation of the log called `log_name`.
///
/// Only timestamp suffixes count, so `alpha.log` never claims the files of a
/// world named `alpha.log`.
fn is_rotation_of(file_name: &str, log_name: &str) -> bool {
    file_name
        .strip_prefix(log_name)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|suffix| {
            !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit() || b == b'-')
        })
}

/// Rotations of `log_path`, newest first.
fn rotations(log_path: &Path) -> Vec<PathBuf> {
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let log_name = log_path.file_name().unwrap_or_default().to_string_lossy();

    let mut rotated: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_rotation = path
                .file_name()
                .is_some_and(|n| is_rotation_of(&n.to_string_lossy(), &log_name));
            if is_rotation
                && let Ok(metadata) = fs::metadata(&path)
                && let Ok(modified) = metadata.modified()
            {
                rotated.push((path, modified));
            }
        }
    }

    rotated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    rotated.into_iter().map(|(path, _)| path).collect()
}

/// Delete the oldest rotated files beyond `keep`.
fn cleanup_rotated(log_path: &Path, keep: usize) {
    for path in rotations(log_path).iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete old world log");
        }
    }
}

/// Delete the log and every rotation of it.
pub(super) fn remove_all(log_path: &Path) {
    let mut paths = rotations(log_path);
    paths.push(log_path.to_path_buf());
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete world log");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_lines(path: &Path, count: usize) {
        let mut file = fs::File::create(path).unwrap();
        for i in 1..=count {
            writeln!(file, "[stdout] Line {i}").unwrap();
        }
    }

    #[test]
    fn test_tail_log() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        write_lines(&log_file, 5);

        let lines = tail_log(&log_file, 3).unwrap();
        assert_eq!(lines, vec!["[stdout] Line 3", "[stdout] Line 4", "[stdout] Line 5"]);
        assert_eq!(tail_log(&log_file, 50).unwrap().len(), 5);
    }

    #[test]
    fn test_tail_of_large_file_spans_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        write_lines(&log_file, 50_000);

        let lines = tail_log(&log_file, 2_000).unwrap();
        assert_eq!(lines.len(), 2_000);
        assert_eq!(lines[0], "[stdout] Line 48001");
        assert_eq!(lines[1_999], "[stdout] Line 50000");
        assert!(lines.iter().all(|line| line.starts_with("[stdout] Line ")));
    }

    #[test]
    fn test_tail_before_offset() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        write_lines(&log_file, 3);
        let end = fs::metadata(&log_file).unwrap().len();
        let mut file = fs::OpenOptions::new().append(true).open(&log_file).unwrap();
        writeln!(file, "[stdout] later").unwrap();

        let lines = tail_log_before(&log_file, end, 2).unwrap();
        assert_eq!(lines, vec!["[stdout] Line 2", "[stdout] Line 3"]);
        assert!(tail_log_before(&log_file, 0, 2).unwrap().is_empty());
    }

    #[test]
    fn test_tail_replaces_invalid_utf8() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        fs::write(&log_file, b"[stdout] gel\xfcftet\n[stdout] Server started\n").unwrap();

        let lines = tail_log(&log_file, 10).unwrap();
        assert_eq!(lines, vec!["[stdout] gel\u{fffd}ftet", "[stdout] Server started"]);
    }

    #[test]
    fn test_tail_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(tail_log(&temp_dir.path().join("none.log"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(parse_entry("[stderr] boom"), (StreamTag::Stderr, "boom"));
        assert_eq!(parse_entry("[stdout] ok"), (StreamTag::Stdout, "ok"));
        assert_eq!(parse_entry("raw"), (StreamTag::Stdout, "raw"));
    }

    #[test]
    fn test_small_log_not_rotated() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        fs::write(&log_file, "small\n").unwrap();

        assert!(!rotate_if_needed(&log_file, MAX_LOG_BYTES).unwrap());
        assert!(log_file.exists());
        assert!(!rotate_if_needed(&temp_dir.path().join("missing.log"), MAX_LOG_BYTES).unwrap());
    }

    #[test]
    fn test_large_log_rotated() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        let file = fs::File::create(&log_file).unwrap();
        file.set_len(MAX_LOG_BYTES).unwrap();

        assert!(rotate_if_needed(&log_file, MAX_LOG_BYTES).unwrap());
        assert!(!log_file.exists());
        assert_eq!(rotations(&log_file).len(), 1);
    }

    #[tokio::test]
    async fn test_writer_rotates_while_running() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        let mut writer = LogWriter::open_with_limit(log_file.clone(), 64).await.unwrap();

        for i in 0..10 {
            writer.append(&format!("[stdout] line number {i}\n")).await.unwrap();
        }

        assert!(!rotations(&log_file).is_empty());
        assert!(fs::metadata(&log_file).unwrap().len() < 64);
        assert_eq!(writer.history_end(), 0);
        let rotated: usize = rotations(&log_file)
            .iter()
            .map(|path| fs::read_to_string(path).unwrap().lines().count())
            .sum();
        let current = fs::read_to_string(&log_file).unwrap().lines().count();
        assert_eq!(rotated + current, 10);
    }

    #[tokio::test]
    async fn test_writer_keeps_previous_run_as_history() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        fs::write(&log_file, "[stdout] previous run\n").unwrap();

        let mut writer = LogWriter::open(log_file.clone()).await.unwrap();
        writer.append("[stdout] this run\n").await.unwrap();

        let history = tail_log_before(&log_file, writer.history_end(), 10).unwrap();
        assert_eq!(history, vec!["[stdout] previous run"]);
    }

    #[test]
    fn test_remove_all_deletes_rotations_only() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        for name in [
            "alpha.log",
            "alpha.log.20260101-120000",
            "alpha.log.20260101-120000-1",
            "alpha.log.log",
            "beta.log",
        ] {
            fs::write(dir.join(name), "x\n").unwrap();
        }

        remove_all(&dir.join("alpha.log"));

        let mut left: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["alpha.log.log", "beta.log"]);
    }

    #[test]
    fn test_rotation_names_are_unique() {
        let temp_dir = TempDir::new().unwrap();
        let log_file = temp_dir.path().join("alpha.log");
        let first = rotated_path(&log_file);
        fs::write(&first, "x\n").unwrap();
        let second = rotated_path(&log_file);

        assert_ne!(first, second);
        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(is_rotation_of(&name, "alpha.log"));
    }
}

//! Per-container log capture and retrieval.
//!
//! The supervisor owns two files per container, `stdout.log` and
//! `stderr.log`. Every line is prefixed at write time with an RFC-3339
//! nanosecond timestamp. Readers interleave both files by timestamp and apply
//! tail/since/until; `follow` delivers new writes by bounded polling.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::mpsc;

use crate::errors::{ServinError, ServinResult};

pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";

/// Options for a log read.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub follow: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Last N lines by interleaved order.
    pub tail: Option<usize>,
    /// Prefix each line with its timestamp and stream tag.
    pub timestamps: bool,
}

/// Which file a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "[stdout]",
            Self::Stderr => "[stderr]",
        }
    }
}

#[derive(Debug, Clone)]
struct LogLine {
    ts: DateTime<Utc>,
    stream: Stream,
    content: String,
}

/// Pump one stdio pipe into a log file, timestamping each line as it
/// arrives. Runs on a dedicated thread; exits when the pipe closes.
pub fn spawn_log_pump(fd: OwnedFd, path: PathBuf) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let source = std::fs::File::from(fd);
        let mut reader = BufReader::new(source);
        let mut sink = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "log file unavailable");
                return;
            }
        };

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
                    let content = line.trim_end_matches('\n');
                    if let Err(e) = writeln!(sink, "{ts} {content}") {
                        tracing::warn!(path = %path.display(), error = %e, "log write failed");
                        break;
                    }
                    let _ = sink.flush();
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "log pump ended");
                    break;
                }
            }
        }
    })
}

fn parse_line(raw: &str, stream: Stream) -> Option<LogLine> {
    let (ts, content) = raw.split_once(' ')?;
    let ts = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);
    Some(LogLine {
        ts,
        stream,
        content: content.to_string(),
    })
}

fn read_stream(path: &Path, stream: Stream, out: &mut Vec<LogLine>) -> ServinResult<()> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ServinError::Io(e)),
    };
    for raw in BufReader::new(file).lines() {
        let raw = raw.map_err(ServinError::Io)?;
        if let Some(line) = parse_line(&raw, stream) {
            out.push(line);
        }
    }
    Ok(())
}

fn format_line(line: &LogLine, timestamps: bool) -> String {
    if timestamps {
        format!(
            "{} {} {}",
            line.ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
            line.stream.tag(),
            line.content
        )
    } else {
        line.content.clone()
    }
}

/// Read both log files of a container directory, interleaved by timestamp,
/// with tail/since/until applied.
pub fn read_logs(container_dir: &Path, query: &LogQuery) -> ServinResult<Vec<String>> {
    let mut lines = Vec::new();
    read_stream(&container_dir.join(STDOUT_LOG), Stream::Stdout, &mut lines)?;
    read_stream(&container_dir.join(STDERR_LOG), Stream::Stderr, &mut lines)?;

    lines.sort_by_key(|line| line.ts);

    if let Some(since) = query.since {
        lines.retain(|line| line.ts >= since);
    }
    if let Some(until) = query.until {
        lines.retain(|line| line.ts <= until);
    }
    if let Some(tail) = query.tail {
        if lines.len() > tail {
            lines.drain(..lines.len() - tail);
        }
    }

    Ok(lines
        .iter()
        .map(|line| format_line(line, query.timestamps))
        .collect())
}

/// Follow both log files, delivering the backlog first and then new writes
/// in best-effort tail order. Returns when the receiver is dropped.
pub async fn follow_logs(
    container_dir: PathBuf,
    query: LogQuery,
    tx: mpsc::Sender<String>,
) -> ServinResult<()> {
    let backlog = read_logs(&container_dir, &query)?;
    let mut seen = {
        // Track raw byte offsets per file so only new content is re-read.
        let stdout_len = file_len(&container_dir.join(STDOUT_LOG));
        let stderr_len = file_len(&container_dir.join(STDERR_LOG));
        (stdout_len, stderr_len)
    };
    for line in backlog {
        if tx.send(line).await.is_err() {
            return Ok(());
        }
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return Ok(());
        }

        let mut fresh = Vec::new();
        seen.0 = drain_new(&container_dir.join(STDOUT_LOG), seen.0, Stream::Stdout, &mut fresh);
        seen.1 = drain_new(&container_dir.join(STDERR_LOG), seen.1, Stream::Stderr, &mut fresh);
        fresh.sort_by_key(|line| line.ts);

        for line in &fresh {
            if let Some(until) = query.until {
                if line.ts > until {
                    return Ok(());
                }
            }
            if tx.send(format_line(line, query.timestamps)).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Read lines appended past `offset`; returns the new offset.
fn drain_new(path: &Path, offset: u64, stream: Stream, out: &mut Vec<LogLine>) -> u64 {
    use std::io::{Seek, SeekFrom};

    let Ok(mut file) = std::fs::File::open(path) else {
        return offset;
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len <= offset {
        return offset;
    }
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return offset;
    }
    let reader = BufReader::new(&mut file);
    for raw in reader.lines().map_while(Result::ok) {
        if let Some(line) = parse_line(&raw, stream) {
            out.push(line);
        }
    }
    len
}

//! Line readers shared by both backends.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::BackendSignal;
use super::process::LogWriter;
use crate::broadcast::StreamTag;

/// Shared per-run log file.
pub(super) type LogSink = Arc<Mutex<LogWriter>>;

/// Spawn a task that splits `reader` into lines and forwards each as a
/// [`BackendSignal::Output`]. Lines are also appended to `sink` when given.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the
/// stream. The task ends at EOF or on a read error. Once the receiving side
/// is gone it keeps draining the pipe into `sink` so the writer never blocks.
pub(super) fn forward_lines<R>(
    reader: R,
    stream: StreamTag,
    tx: mpsc::Sender<BackendSignal>,
    sink: Option<LogSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {},
                Err(e) => {
                    tracing::debug!(error = %e, %stream, "Output reader stopped");
                    break;
                },
            }
            let line = decode_line(&buf);

            if let Some(sink) = &sink {
                let entry = format!("[{stream}] {line}\n");
                if let Err(e) = sink.lock().await.append(&entry).await {
                    tracing::warn!(error = %e, "Failed to append to world log file");
                }
            }

            if forwarding
                && tx
                    .send(BackendSignal::Output { stream, line })
                    .await
                    .is_err()
            {
                forwarding = false;
            }
        }
    })
}

/// Strip the line terminator and decode, replacing invalid sequences.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

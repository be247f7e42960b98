//! Diagnostic stream draining.
//!
//! yt-dlp and ffmpeg rewrite their progress line with carriage returns, so a
//! piped stderr can go a long time without a `\n`. Records are therefore split
//! on either `\n` or `\r`, and each record is capped so a misbehaving child
//! cannot grow our buffers without bound.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest record kept, in bytes. Longer records are cut.
const MAX_RECORD_BYTES: usize = 4096;

/// Number of trailing records retained for error reports.
pub const TAIL_RECORDS: usize = 20;

/// Reads an async stream and yields text records delimited by `\n` or `\r`.
pub struct DiagnosticReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
    discarding: bool,
}

impl<R> DiagnosticReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
            discarding: false,
        }
    }

    /// Returns the next non-empty record, or `None` at EOF.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| matches!(b, b'\n' | b'\r')) {
                let record_bytes: Vec<u8> = self.pending.drain(..idx).collect();
                let delimiters = self
                    .pending
                    .iter()
                    .take_while(|&&b| matches!(b, b'\n' | b'\r'))
                    .count();
                self.pending.drain(..delimiters);

                // The head of an oversized record was already returned.
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                let record = String::from_utf8_lossy(&record_bytes).trim().to_string();
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            if self.pending.len() >= MAX_RECORD_BYTES {
                let head: Vec<u8> = self.pending.drain(..).collect();
                if std::mem::replace(&mut self.discarding, true) {
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(&head).trim().to_string()));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let rest = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.discarding) || rest.is_empty() {
                    return Ok(None);
                }
                let record = String::from_utf8_lossy(&rest).trim().to_string();
                return Ok((!record.is_empty()).then_some(record));
            }

            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}

/// Drain a child's diagnostic stream until EOF.
///
/// Every record is logged at debug level under the child's program name.
/// Returns the last [`TAIL_RECORDS`] records joined by newlines.
pub async fn drain_diagnostics<R>(reader: R, program: String, session_id: Uuid) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = DiagnosticReader::new(reader);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_RECORDS);

    loop {
        match reader.next_record().await {
            Ok(Some(record)) => {
                debug!(session_id = %session_id, program = %program, "{}", record);
                if tail.len() == TAIL_RECORDS {
                    tail.pop_front();
                }
                tail.push_back(record);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    program = %program,
                    error = %e,
                    "Error reading diagnostic stream"
                );
                break;
            }
        }
    }

    Vec::from(tail).join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn collect(input: &'static [u8]) -> Vec<String> {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = tx.write_all(input).await;
        });

        let mut reader = DiagnosticReader::new(rx);
        let mut records = Vec::new();
        while let Some(line) = reader.next_record().await.unwrap() {
            records.push(line);
        }
        records
    }

    #[tokio::test]
    async fn splits_on_cr_and_lf() {
        let records = collect(b"one\rtwo\nthree\r\nfour").await;
        assert_eq!(records, vec!["one", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn skips_blank_records() {
        let records = collect(b"\n\n  \r[download]  5.0%\r\n").await;
        assert_eq!(records, vec!["[download]  5.0%"]);
    }

    #[tokio::test]
    async fn caps_oversized_records() {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut payload = vec![b'x'; MAX_RECORD_BYTES * 3];
            payload.extend_from_slice(b"\nafter\n");
            let _ = tx.write_all(&payload).await;
        });

        let mut reader = DiagnosticReader::new(rx);
        let first = reader.next_record().await.unwrap().unwrap();
        assert!(first.len() <= MAX_RECORD_BYTES + 4096);
        assert_eq!(reader.next_record().await.unwrap().as_deref(), Some("after"));
        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_keeps_only_the_tail() {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            for i in 0..50 {
                let _ = tx.write_all(format!("line {i}\n").as_bytes()).await;
            }
        });

        let tail = drain_diagnostics(rx, "yt-dlp".to_string(), Uuid::new_v4()).await;
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), TAIL_RECORDS);
        assert_eq!(lines.first(), Some(&"line 30"));
        assert_eq!(lines.last(), Some(&"line 49"));
    }
}

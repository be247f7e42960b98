//! Terminal output relay.
//!
//! The relay turns the terminal reader of a session into a pull-driven byte
//! stream. Nothing is read until the transport asks for the next chunk, so a
//! slow client slows the producers down through the OS pipes.

use std::io;
use std::time::Duration;

use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use super::lifecycle::{SessionEvent, SessionMonitor, TerminalOutcome};
use crate::{Error, Result};

/// Read size for the terminal output.
pub const RELAY_CHUNK_SIZE: usize = 64 * 1024;

/// The reader a relay pulls from: a child stdout or a staged file.
pub type TerminalReader = Box<dyn AsyncRead + Send + Unpin>;

/// Response metadata, fixed before the first byte is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub content_type: &'static str,
    pub filename: String,
    pub content_length: Option<u64>,
}

impl DeliveryMetadata {
    pub fn new(content_type: &'static str, filename: impl Into<String>) -> Self {
        Self {
            content_type,
            filename: filename.into(),
            content_length: None,
        }
    }

    pub fn with_content_length(mut self, length: Option<u64>) -> Self {
        self.content_length = length;
        self
    }

    /// `attachment; filename="..."`, plus an RFC 5987 `filename*` for non-ASCII names.
    pub fn content_disposition(&self) -> String {
        if self.filename.is_ascii() {
            return format!("attachment; filename=\"{}\"", self.filename);
        }
        let fallback: String = self
            .filename
            .chars()
            .map(|c| if c.is_ascii() { c } else { '_' })
            .collect();
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(&self.filename)
        )
    }

    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type));
        let disposition = HeaderValue::from_str(&self.content_disposition())
            .map_err(|e| Error::Other(format!("invalid Content-Disposition: {e}")))?;
        headers.insert(CONTENT_DISPOSITION, disposition);
        if let Some(length) = self.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        Ok(headers)
    }
}

/// Pull-driven relay over a session's terminal output.
///
/// Dropping the relay before the output completed cancels the session.
pub struct Relay {
    session_id: uuid::Uuid,
    reader: ReaderStream<TerminalReader>,
    outcome_rx: Option<oneshot::Receiver<TerminalOutcome>>,
    monitor: SessionMonitor,
    idle_timeout: Option<Duration>,
    primed: Option<Bytes>,
    delivered_first: bool,
    finished: bool,
    bytes_sent: u64,
    cancel_guard: Option<DropGuard>,
    _done_guard: DropGuard,
}

impl Relay {
    pub fn new(
        reader: TerminalReader,
        outcome_rx: oneshot::Receiver<TerminalOutcome>,
        monitor: SessionMonitor,
        cancel: CancellationToken,
        relay_done: CancellationToken,
    ) -> Self {
        Self {
            session_id: monitor.id(),
            reader: ReaderStream::with_capacity(reader, RELAY_CHUNK_SIZE),
            outcome_rx: Some(outcome_rx),
            monitor,
            idle_timeout: None,
            primed: None,
            delivered_first: false,
            finished: false,
            bytes_sent: 0,
            cancel_guard: Some(cancel.drop_guard()),
            _done_guard: relay_done.drop_guard(),
        }
    }

    /// Abort when no bytes arrive for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Read the first chunk ahead of the response headers.
    ///
    /// A process that fails before producing any output surfaces here as an
    /// error, while the response can still carry a status code. A process that
    /// succeeds without output leaves an empty body.
    pub async fn prime(&mut self) -> Result<()> {
        if self.finished || self.primed.is_some() {
            return Ok(());
        }
        match self.read_next().await {
            Ok(Some(chunk)) => {
                self.primed = Some(chunk);
                Ok(())
            }
            Ok(None) => match self.await_outcome().await {
                Ok(TerminalOutcome::Completed) => {
                    self.complete();
                    Ok(())
                }
                Ok(TerminalOutcome::Failed(outcome)) => {
                    self.finished = true;
                    Err(outcome.into_error())
                }
                Ok(TerminalOutcome::Cancelled) => {
                    self.finished = true;
                    Err(Error::Other("session cancelled before output".to_string()))
                }
                Err(e) => Err(Error::Io(self.fail(e))),
            },
            Err(e) => Err(Error::Io(self.fail(e))),
        }
    }

    /// Convert the relay into a fused body stream.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut relay| async move {
            relay.next_chunk().await.map(|item| (item, relay))
        })
        .fuse()
    }

    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.finished {
            return None;
        }
        if let Some(chunk) = self.primed.take() {
            return Some(Ok(self.deliver(chunk)));
        }

        match self.read_next().await {
            Ok(Some(chunk)) => Some(Ok(self.deliver(chunk))),
            Ok(None) => match self.await_outcome().await {
                Ok(TerminalOutcome::Completed) => {
                    self.complete();
                    None
                }
                Ok(TerminalOutcome::Failed(outcome)) => {
                    self.finished = true;
                    // Already recorded by the supervisor.
                    Some(Err(io::Error::other(outcome.into_error().to_string())))
                }
                Ok(TerminalOutcome::Cancelled) => {
                    self.finished = true;
                    Some(Err(io::Error::other("session cancelled")))
                }
                Err(e) => Some(Err(self.fail(e))),
            },
            Err(e) => Some(Err(self.fail(e))),
        }
    }

    fn deliver(&mut self, chunk: Bytes) -> Bytes {
        if !self.delivered_first {
            self.delivered_first = true;
            if let Err(e) = self.monitor.apply(SessionEvent::FirstByte) {
                debug!(session_id = %self.session_id, error = %e, "First byte after session end");
            }
        }
        self.bytes_sent += chunk.len() as u64;
        chunk
    }

    async fn read_next(&mut self) -> io::Result<Option<Bytes>> {
        let next = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.reader.next())
                .await
                .map_err(|_| idle_error(limit))?,
            None => self.reader.next().await,
        };
        next.transpose()
    }

    async fn await_outcome(&mut self) -> io::Result<TerminalOutcome> {
        let Some(rx) = self.outcome_rx.take() else {
            return Ok(TerminalOutcome::Completed);
        };
        let received = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| idle_error(limit))?,
            None => rx.await,
        };
        // A supervisor that vanished without reporting cannot vouch for the output.
        Ok(received.unwrap_or(TerminalOutcome::Cancelled))
    }

    fn complete(&mut self) {
        self.finished = true;
        if let Some(guard) = self.cancel_guard.take() {
            guard.disarm();
        }
        debug!(session_id = %self.session_id, bytes = self.bytes_sent, "Relay finished");
    }

    /// Record a relay-side failure and cancel the session.
    fn fail(&mut self, error: io::Error) -> io::Error {
        self.finished = true;
        warn!(
            session_id = %self.session_id,
            bytes = self.bytes_sent,
            error = %error,
            "Relay aborted"
        );
        if let Err(e) = self
            .monitor
            .apply(SessionEvent::ProcessFailed(format!("relay: {error}")))
        {
            debug!(session_id = %self.session_id, error = %e, "Relay failure after session end");
        }
        drop(self.cancel_guard.take());
        error
    }
}

fn idle_error(limit: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no data received for {}s", limit.as_secs_f32()),
    )
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("session_id", &self.session_id)
            .field("finished", &self.finished)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::lifecycle::SessionState;
    use crate::pipeline::process::ExitOutcome;
    use tokio::io::AsyncWriteExt;
    use uuid::Uuid;

    struct Fixture {
        monitor: SessionMonitor,
        cancel: CancellationToken,
        relay_done: CancellationToken,
        outcome_tx: oneshot::Sender<TerminalOutcome>,
    }

    fn relay_over(reader: impl AsyncRead + Send + Unpin + 'static) -> (Relay, Fixture) {
        let monitor = SessionMonitor::new(Uuid::new_v4());
        let cancel = CancellationToken::new();
        let relay_done = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let relay = Relay::new(
            Box::new(reader),
            outcome_rx,
            monitor.clone(),
            cancel.clone(),
            relay_done.clone(),
        );
        (
            relay,
            Fixture {
                monitor,
                cancel,
                relay_done,
                outcome_tx,
            },
        )
    }

    fn failed() -> TerminalOutcome {
        TerminalOutcome::Failed(ExitOutcome {
            program: "ffmpeg".to_string(),
            code: Some(1),
            killed: false,
            stderr_tail: "Invalid data found when processing input".to_string(),
        })
    }

    #[test]
    fn disposition_quotes_filename() {
        let meta = DeliveryMetadata::new("audio/mpeg", "My Song.mp3");
        assert_eq!(
            meta.content_disposition(),
            "attachment; filename=\"My Song.mp3\""
        );
        let headers = meta.headers().unwrap();
        assert_eq!(headers[CONTENT_TYPE], "audio/mpeg");
        assert!(headers.get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn disposition_encodes_unicode() {
        let meta =
            DeliveryMetadata::new("video/mp4", "日本 clip.mp4").with_content_length(Some(42));
        let value = meta.content_disposition();
        assert!(value.starts_with("attachment; filename=\"__ clip.mp4\""));
        assert!(value.contains("filename*=UTF-8''%E6%97%A5%E6%9C%AC%20clip.mp4"));
        let headers = meta.headers().unwrap();
        assert_eq!(headers[CONTENT_LENGTH], "42");
    }

    #[tokio::test]
    async fn relays_all_bytes_then_ends_cleanly() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut relay, fx) = relay_over(std::io::Cursor::new(payload.clone()));
        fx.outcome_tx.send(TerminalOutcome::Completed).unwrap();

        relay.prime().await.unwrap();
        let chunks: Vec<io::Result<Bytes>> = relay.into_stream().collect().await;
        let body: Vec<u8> = chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect();

        assert_eq!(body, payload);
        assert!(!fx.cancel.is_cancelled());
        assert!(fx.relay_done.is_cancelled());
        assert_eq!(fx.monitor.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn empty_successful_output_is_an_empty_body() {
        let (mut relay, fx) = relay_over(tokio::io::empty());
        fx.outcome_tx.send(TerminalOutcome::Completed).unwrap();
        relay.prime().await.unwrap();
        let chunks: Vec<_> = relay.into_stream().collect().await;
        assert!(chunks.is_empty());
        assert!(!fx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn failure_before_first_byte_surfaces_from_prime() {
        let (mut relay, fx) = relay_over(tokio::io::empty());
        fx.outcome_tx.send(failed()).unwrap();
        let err = relay.prime().await.unwrap_err();
        assert!(matches!(err, Error::Process { code: Some(1), .. }));
        drop(relay);
        assert!(fx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn failure_after_output_aborts_stream() {
        let (mut relay, fx) = relay_over(std::io::Cursor::new(b"partial".to_vec()));
        fx.outcome_tx.send(failed()).unwrap();
        relay.prime().await.unwrap();

        let mut stream = Box::pin(relay.into_stream());
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_cancels_session() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut relay, fx) = relay_over(client);
        server.write_all(b"hello").await.unwrap();
        relay.prime().await.unwrap();

        let mut stream = Box::pin(relay.into_stream());
        stream.next().await.unwrap().unwrap();
        assert!(!fx.cancel.is_cancelled());
        drop(stream);
        assert!(fx.cancel.is_cancelled());
        assert!(fx.relay_done.is_cancelled());
    }

    #[tokio::test]
    async fn stalled_consumer_stalls_producer() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (relay, _fx) = relay_over(client);
        let mut stream = Box::pin(relay.into_stream());

        // Nobody polls the stream, so the producer fills the pipe and blocks.
        let big = vec![7u8; 1024 * 1024];
        let blocked =
            tokio::time::timeout(Duration::from_millis(200), server.write_all(&big)).await;
        assert!(blocked.is_err(), "producer should block on a stalled consumer");

        // Pulling a chunk frees room for the producer again.
        let chunk = stream.next().await.unwrap().unwrap();
        assert!(!chunk.is_empty());
        assert!(chunk.len() <= 4096);
        let progressed =
            tokio::time::timeout(Duration::from_millis(200), server.write_all(&[1u8; 16])).await;
        assert!(progressed.is_ok());
    }

    #[tokio::test]
    async fn idle_timeout_aborts_and_cancels() {
        let (client, _server) = tokio::io::duplex(64);
        let (relay, fx) = relay_over(client);
        let relay = relay.with_idle_timeout(Some(Duration::from_millis(50)));

        let mut stream = Box::pin(relay.into_stream());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(fx.cancel.is_cancelled());
        assert!(fx.monitor.status().error.is_some());
        assert!(stream.next().await.is_none());
    }
}

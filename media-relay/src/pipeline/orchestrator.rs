//! Process orchestration.
//!
//! Builds the argument vectors for the retriever (yt-dlp) and transcoder
//! (ffmpeg), spawns them for a [`DownloadPlan`] and hands the wired session to
//! its supervisor. Two delivery modes share the single [`Orchestrator::start`]
//! entry point:
//!
//! - **streaming**: the retriever writes to stdout. For audio its output is
//!   pumped into the transcoder; the terminal stdout is relayed directly.
//! - **staged**: the retriever downloads into a per-session workspace and is
//!   awaited, then the staged file is relayed (or transcoded from disk).

use std::path::Path;
use std::sync::Arc;

use process_utils::StdioLayout;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lifecycle::{SessionMonitor, SupervisedSession, spawn_supervisor};
use super::process::{ChildProcessHandle, run_to_completion};
use super::relay::{DeliveryMetadata, Relay, TerminalReader};
use super::workspace::Workspace;
use crate::catalog::MediaDescriptor;
use crate::config::{DeliveryMode, PipelineConfig};
use crate::selector::DownloadPlan;
use crate::utils::filename::{attachment_filename, split_extension};
use crate::utils::fs::{find_first_file, io_error};
use crate::{Error, Result};

/// Buffer used when pumping retriever output into the transcoder.
pub const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Output template used for the filename lookup.
const FILENAME_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Where the retriever writes its output.
#[derive(Debug, Clone, Copy)]
pub enum RetrieverOutput<'a> {
    Stdout,
    /// A yt-dlp output template on disk.
    Template(&'a Path),
}

/// Where the transcoder reads its input from.
#[derive(Debug, Clone, Copy)]
pub enum TranscodeInput<'a> {
    Stdin,
    File(&'a Path),
}

/// A started download, ready to be relayed.
#[derive(Debug)]
pub struct PipelineSession {
    id: Uuid,
    monitor: SessionMonitor,
    cancel: CancellationToken,
    content_length: Option<u64>,
    output_extension: Option<String>,
    relay: Relay,
}

impl PipelineSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    /// Token that cancels the session (and kills its children) when fired.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Known only for staged output that is relayed without transcoding.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Extension of the staged file, if the output was staged.
    pub fn output_extension(&self) -> Option<&str> {
        self.output_extension.as_deref()
    }

    /// Response metadata for this session.
    ///
    /// `filename` comes from [`Orchestrator::resolve_filename`]; for staged
    /// video output its extension is replaced by the real one on disk.
    pub fn delivery_metadata(&self, plan: &DownloadPlan, filename: &str) -> DeliveryMetadata {
        let filename = match self.output_extension() {
            Some(ext) if !plan.mode.needs_transcode() => {
                attachment_filename(Some(split_extension(filename).0), ext)
            }
            _ => filename.to_string(),
        };
        DeliveryMetadata::new(plan.mode.content_type(), filename)
            .with_content_length(self.content_length)
    }

    pub fn relay_mut(&mut self) -> &mut Relay {
        &mut self.relay
    }

    pub fn into_relay(self) -> Relay {
        self.relay
    }
}

/// Everything a session needs once its processes are wired.
struct Wiring {
    children: Vec<ChildProcessHandle>,
    reader: TerminalReader,
    workspace: Option<Workspace>,
    content_length: Option<u64>,
    output_extension: Option<String>,
}

/// Starts pipeline sessions.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
}

impl Orchestrator {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Retriever arguments for a download.
    pub fn retriever_args(&self, plan: &DownloadPlan, output: RetrieverOutput<'_>) -> Vec<String> {
        let output = match output {
            RetrieverOutput::Stdout => "-".to_string(),
            RetrieverOutput::Template(path) => path.to_string_lossy().into_owned(),
        };
        vec![
            "-f".to_string(),
            plan.selector.expression(),
            "--no-playlist".to_string(),
            "-o".to_string(),
            output,
            "--".to_string(),
            plan.url.clone(),
        ]
    }

    /// Transcoder arguments producing MP3 on stdout.
    pub fn transcoder_args(&self, input: TranscodeInput<'_>) -> Vec<String> {
        let input = match input {
            TranscodeInput::Stdin => "pipe:0".to_string(),
            TranscodeInput::File(path) => path.to_string_lossy().into_owned(),
        };
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input,
            "-f".to_string(),
            "mp3".to_string(),
            "-b:a".to_string(),
            self.config.audio_bitrate.clone(),
            "pipe:1".to_string(),
        ]
    }

    /// Retriever arguments for the media info query.
    pub fn info_args(&self, url: &str) -> Vec<String> {
        vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--".to_string(),
            url.to_string(),
        ]
    }

    /// Retriever arguments for the filename lookup.
    pub fn filename_lookup_args(&self, plan: &DownloadPlan) -> Vec<String> {
        vec![
            "--get-filename".to_string(),
            "-f".to_string(),
            plan.selector.expression(),
            "--no-playlist".to_string(),
            "-o".to_string(),
            FILENAME_TEMPLATE.to_string(),
            "--".to_string(),
            plan.url.clone(),
        ]
    }

    /// Spawn and wire the processes for `plan`.
    ///
    /// Fails with [`Error::Startup`] when a program cannot be launched. In
    /// staged mode a failed retrieval is reported as [`Error::Process`]. On
    /// any failure, children spawned so far are killed and the workspace is
    /// removed before returning.
    pub async fn start(&self, plan: &DownloadPlan) -> Result<PipelineSession> {
        let session_id = Uuid::new_v4();
        info!(
            session_id = %session_id,
            url = %plan.url,
            mode = %plan.mode,
            selector = %plan.selector,
            delivery = %self.config.delivery_mode,
            "Starting pipeline session"
        );

        let cancel = CancellationToken::new();
        let wiring = match self.config.delivery_mode {
            DeliveryMode::Streaming => self.wire_streaming(plan, session_id, &cancel).await?,
            DeliveryMode::Staged => self.wire_staged(plan, session_id).await?,
        };
        Ok(self.launch(session_id, cancel, wiring))
    }

    async fn wire_streaming(
        &self,
        plan: &DownloadPlan,
        session_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Wiring> {
        let args = self.retriever_args(plan, RetrieverOutput::Stdout);
        let mut retriever = ChildProcessHandle::spawn(
            &self.config.ytdlp_path,
            &args,
            StdioLayout::Producer,
            session_id,
        )?;
        let retriever_stdout = match retriever.require_stdout() {
            Ok(stdout) => stdout,
            Err(e) => {
                retriever.terminate().await;
                return Err(e);
            }
        };

        if !plan.mode.needs_transcode() {
            return Ok(Wiring {
                children: vec![retriever],
                reader: Box::new(retriever_stdout),
                workspace: None,
                content_length: None,
                output_extension: None,
            });
        }

        let mut children = vec![retriever];
        let spawned = ChildProcessHandle::spawn(
            &self.config.ffmpeg_path,
            &self.transcoder_args(TranscodeInput::Stdin),
            StdioLayout::Filter,
            session_id,
        )
        .and_then(|mut transcoder| {
            let stdin = transcoder.require_stdin()?;
            let stdout = transcoder.require_stdout()?;
            Ok((transcoder, stdin, stdout))
        });
        let (transcoder, stdin, stdout) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                abort_children(&mut children).await;
                return Err(e);
            }
        };

        tokio::spawn(pump(retriever_stdout, stdin, cancel.clone(), session_id));
        children.push(transcoder);

        Ok(Wiring {
            children,
            reader: Box::new(stdout),
            workspace: None,
            content_length: None,
            output_extension: None,
        })
    }

    async fn wire_staged(&self, plan: &DownloadPlan, session_id: Uuid) -> Result<Wiring> {
        let workspace = Workspace::create(&self.config.staging_dir, session_id).await?;
        match self.stage(plan, session_id, &workspace).await {
            Ok(mut wiring) => {
                wiring.workspace = Some(workspace);
                Ok(wiring)
            }
            Err(e) => {
                workspace.remove().await;
                Err(e)
            }
        }
    }

    /// Download into `workspace` and open the result.
    ///
    /// Dropping this future (client gone) kills the retriever through
    /// `kill_on_drop`.
    async fn stage(
        &self,
        plan: &DownloadPlan,
        session_id: Uuid,
        workspace: &Workspace,
    ) -> Result<Wiring> {
        let template = workspace.output_template();
        let args = self.retriever_args(plan, RetrieverOutput::Template(&template));
        let mut retriever = ChildProcessHandle::spawn(
            &self.config.ytdlp_path,
            &args,
            StdioLayout::Sink,
            session_id,
        )?;

        let outcome = retriever.wait().await;
        if !outcome.success() {
            warn!(
                session_id = %session_id,
                code = ?outcome.code,
                stderr = %outcome.stderr_tail,
                "Staged retrieval failed"
            );
            return Err(outcome.into_error());
        }

        let Some(staged) = find_first_file(workspace.path()).await? else {
            return Err(Error::Process {
                program: outcome.program,
                code: outcome.code,
                stderr: "no output file was produced".to_string(),
            });
        };
        let extension = staged
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string);
        debug!(session_id = %session_id, path = %staged.display(), "Retrieval staged");

        if plan.mode.needs_transcode() {
            let mut transcoder = ChildProcessHandle::spawn(
                &self.config.ffmpeg_path,
                &self.transcoder_args(TranscodeInput::File(&staged)),
                StdioLayout::Producer,
                session_id,
            )?;
            let stdout = match transcoder.require_stdout() {
                Ok(stdout) => stdout,
                Err(e) => {
                    transcoder.terminate().await;
                    return Err(e);
                }
            };
            return Ok(Wiring {
                children: vec![transcoder],
                reader: Box::new(stdout),
                workspace: None,
                content_length: None,
                output_extension: Some(plan.mode.default_extension().to_string()),
            });
        }

        let file = tokio::fs::File::open(&staged)
            .await
            .map_err(|e| io_error("opening staged file", &staged, e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| io_error("reading staged file metadata", &staged, e))?
            .len();

        Ok(Wiring {
            children: Vec::new(),
            reader: Box::new(file),
            workspace: None,
            content_length: Some(length),
            output_extension: extension,
        })
    }

    fn launch(
        &self,
        session_id: Uuid,
        cancel: CancellationToken,
        wiring: Wiring,
    ) -> PipelineSession {
        let monitor = SessionMonitor::new(session_id);
        let relay_done = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        spawn_supervisor(SupervisedSession {
            monitor: monitor.clone(),
            cancel: cancel.clone(),
            relay_done: relay_done.clone(),
            children: wiring.children,
            workspace: wiring.workspace,
            outcome_tx,
            upstream_grace: self.config.upstream_grace,
        });

        let relay = Relay::new(
            wiring.reader,
            outcome_rx,
            monitor.clone(),
            cancel.clone(),
            relay_done,
        )
        .with_idle_timeout(self.config.idle_timeout);

        PipelineSession {
            id: session_id,
            monitor,
            cancel,
            content_length: wiring.content_length,
            output_extension: wiring.output_extension,
            relay,
        }
    }

    /// Attachment filename for `plan`.
    ///
    /// Uses the title hint when present, else asks the retriever. Lookup
    /// failures fall back to `download.<ext>`; they never fail the request.
    pub async fn resolve_filename(&self, plan: &DownloadPlan) -> String {
        let default_ext = plan.mode.default_extension();
        if let Some(title) = plan.title.as_deref() {
            return attachment_filename(Some(title), default_ext);
        }
        if !self.config.resolve_filenames {
            return attachment_filename(None, default_ext);
        }

        let query_id = Uuid::new_v4();
        let args = self.filename_lookup_args(plan);
        match run_to_completion(&self.config.ytdlp_path, &args, query_id).await {
            Ok(output) => {
                let text = String::from_utf8_lossy(&output.stdout);
                let line = text
                    .lines()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
                    .unwrap_or_default();
                let (stem, reported_ext) = split_extension(line);
                let ext = if plan.mode.needs_transcode() {
                    default_ext
                } else {
                    reported_ext.unwrap_or(default_ext)
                };
                attachment_filename(Some(stem), ext)
            }
            Err(e) => {
                warn!(url = %plan.url, error = %e, "Filename lookup failed, using fallback");
                attachment_filename(None, default_ext)
            }
        }
    }

    /// Query the retriever for media info and formats.
    pub async fn fetch_info(&self, url: &str) -> Result<MediaDescriptor> {
        let query_id = Uuid::new_v4();
        debug!(query_id = %query_id, url = %url, "Fetching media info");
        let output =
            run_to_completion(&self.config.ytdlp_path, &self.info_args(url), query_id).await?;
        MediaDescriptor::parse(url, &output.stdout)
    }
}

async fn abort_children(children: &mut [ChildProcessHandle]) {
    for child in children.iter_mut() {
        child.terminate().await;
    }
}

/// Copy `from` into `to` in order, one bounded chunk at a time.
///
/// Stops at EOF, on cancellation, or when the consumer closes its end.
/// Closing `to` afterwards signals end of input to the consumer.
pub async fn pump<R, W>(
    mut from: R,
    mut to: W,
    cancel: CancellationToken,
    session_id: Uuid,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, "Pump cancelled");
                break;
            }
            result = from.read(&mut buffer) => match result {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = to.write_all(&buffer[..n]).await {
                        debug!(session_id = %session_id, error = %e, "Transcoder input closed");
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Error reading retriever output");
                    break;
                }
            }
        }
    }

    if let Err(e) = to.shutdown().await {
        debug!(session_id = %session_id, error = %e, "Failed to close transcoder input");
    }
    debug!(session_id = %session_id, bytes = total, "Pump finished");
    total
}

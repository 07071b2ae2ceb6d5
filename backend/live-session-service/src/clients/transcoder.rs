//! Transcoder process control
//!
//! A backend turns one ingest stream into the HLS rendition ladder. Launch
//! returns as soon as the process is running; readiness (first segment
//! written) arrives later on the job's `ready` channel. When the session is
//! recorded, every completed segment is handed over on the job's `segments`
//! channel while the stream is still running.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ClientError;
use crate::config::Rendition;

const DEPENDENCY: &str = "transcoder";

/// Completed segments buffered between the transcoder and the archiver
pub const SEGMENT_BACKLOG: usize = 32;

#[derive(Debug, Clone)]
pub struct TranscodeJobSpec {
    pub session_id: Uuid,
    pub ingest_url: String,
    pub output_dir: PathBuf,
    pub renditions: Vec<Rendition>,
    /// Stream completed segments back for archival
    pub record: bool,
}

pub struct LaunchedJob {
    pub job_id: String,
    /// Resolves once the first segment is on disk, or with the reason the
    /// process died first
    pub ready: oneshot::Receiver<Result<(), String>>,
    /// Completed segments in production order; closes when the job stops.
    /// `None` unless the spec asked for recording.
    pub segments: Option<mpsc::Receiver<RecordedSegment>>,
}

#[derive(Debug, Clone)]
pub struct RecordedSegment {
    /// Path relative to the job's output root, e.g. `720p/seg_00001.ts`
    pub name: String,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct FinalizedJob {
    /// Master playlist
    pub manifest: String,
    /// Per-rendition playlists, named like segments
    pub playlists: Vec<RecordedSegment>,
}

#[async_trait]
pub trait TranscoderBackend: Send + Sync {
    async fn launch(&self, spec: TranscodeJobSpec) -> Result<LaunchedJob, ClientError>;

    /// Stop the job gracefully and hand back its playlists. Segments still
    /// pending are flushed to the `segments` channel before it closes.
    async fn finalize(&self, job_id: &str) -> Result<FinalizedJob, ClientError>;

    /// Best-effort hard stop after a failed finalize
    async fn abort(&self, job_id: &str);
}

struct FfmpegJob {
    output_dir: PathBuf,
    child: tokio::sync::Mutex<Option<Child>>,
}

/// Runs one `ffmpeg` process per session writing an HLS ladder
pub struct FfmpegTranscoder {
    ffmpeg_bin: String,
    jobs: DashMap<String, Arc<FfmpegJob>>,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            jobs: DashMap::new(),
        }
    }

    fn build_args(spec: &TranscodeJobSpec) -> Vec<String> {
        let count = spec.renditions.len();
        let mut filter = format!("[0:v]split={count}");
        for i in 0..count {
            filter.push_str(&format!("[v{i}]"));
        }
        for (i, rendition) in spec.renditions.iter().enumerate() {
            filter.push_str(&format!(";[v{i}]scale=-2:{}[v{i}out]", rendition.height));
        }

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "info".into(),
            "-i".into(),
            spec.ingest_url.clone(),
            "-filter_complex".into(),
            filter,
        ];

        let mut stream_map = Vec::with_capacity(count);
        for (i, rendition) in spec.renditions.iter().enumerate() {
            args.extend([
                "-map".into(),
                format!("[v{i}out]"),
                format!("-c:v:{i}"),
                "libx264".into(),
                format!("-b:v:{i}"),
                format!("{}k", rendition.bitrate_kbps),
                "-map".into(),
                "a:0?".into(),
                format!("-c:a:{i}"),
                "aac".into(),
            ]);
            stream_map.push(format!("v:{i},a:{i},name:{}", rendition.name));
        }

        let out = spec.output_dir.display();
        args.extend([
            "-preset".into(),
            "veryfast".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            "4".into(),
            "-hls_list_size".into(),
            "0".into(),
            "-hls_segment_filename".into(),
            format!("{out}/%v/seg_%05d.ts"),
            "-master_pl_name".into(),
            "master.m3u8".into(),
            "-var_stream_map".into(),
            stream_map.join(" "),
            format!("{out}/%v/index.m3u8"),
        ]);
        args
    }

    fn job(&self, job_id: &str) -> Result<Arc<FfmpegJob>, ClientError> {
        self.jobs
            .get(job_id)
            .map(|job| job.value().clone())
            .ok_or_else(|| ClientError::rejected(DEPENDENCY, format!("unknown job {job_id}")))
    }
}

/// ffmpeg logs `Opening '<path>.ts' for writing` for each new segment
fn opened_segment(line: &str) -> Option<PathBuf> {
    let start = line.find("Opening '")? + "Opening '".len();
    let rest = &line[start..];
    let end = rest.find("' for writing")?;
    let path = &rest[..end];
    path.ends_with(".ts").then(|| PathBuf::from(path))
}

/// `<output>/720p/seg_00001.ts` -> `720p/seg_00001.ts`
fn segment_name(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_string_lossy();
    let rendition = path.parent()?.file_name()?.to_string_lossy();
    Some(format!("{rendition}/{file}"))
}

/// A segment is complete once ffmpeg opens the next one for the same
/// rendition, or once the process exits.
#[derive(Default)]
struct SegmentTracker {
    open: HashMap<PathBuf, PathBuf>,
}

impl SegmentTracker {
    fn opened(&mut self, path: PathBuf) -> Option<PathBuf> {
        let rendition = path.parent().map(Path::to_path_buf).unwrap_or_default();
        self.open.insert(rendition, path)
    }

    fn drain(&mut self) -> Vec<PathBuf> {
        let mut rest: Vec<_> = self.open.drain().map(|(_, path)| path).collect();
        rest.sort();
        rest
    }
}

/// Read completed segments off disk and hand them to the archiver. Runs apart
/// from the stderr reader so a slow archive never stalls ffmpeg.
fn spawn_segment_loader(
    job_id: String,
    mut completed: mpsc::UnboundedReceiver<PathBuf>,
    segments: mpsc::Sender<RecordedSegment>,
) {
    tokio::spawn(async move {
        while let Some(path) = completed.recv().await {
            let Some(name) = segment_name(&path) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(data) => {
                    let segment = RecordedSegment {
                        name,
                        data: Bytes::from(data),
                    };
                    if segments.send(segment).await.is_err() {
                        debug!(%job_id, "archiver gone; dropping remaining segments");
                        return;
                    }
                }
                Err(e) => warn!(%job_id, path = %path.display(), error = %e, "segment unreadable"),
            }
        }
    });
}

#[async_trait]
impl TranscoderBackend for FfmpegTranscoder {
    async fn launch(&self, spec: TranscodeJobSpec) -> Result<LaunchedJob, ClientError> {
        let job_id = format!("ffmpeg-{}", spec.session_id);
        if self.jobs.contains_key(&job_id) {
            return Err(ClientError::rejected(DEPENDENCY, format!("job {job_id} already running")));
        }

        for rendition in &spec.renditions {
            tokio::fs::create_dir_all(spec.output_dir.join(rendition.name))
                .await
                .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;
        }

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(Self::build_args(&spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::unavailable(DEPENDENCY, format!("ffmpeg spawn error: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::unavailable(DEPENDENCY, "ffmpeg stderr not captured"))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (completed_tx, segments_rx) = if spec.record {
            let (completed_tx, completed_rx) = mpsc::unbounded_channel();
            let (segments_tx, segments_rx) = mpsc::channel(SEGMENT_BACKLOG);
            spawn_segment_loader(job_id.clone(), completed_rx, segments_tx);
            (Some(completed_tx), Some(segments_rx))
        } else {
            (None, None)
        };

        let log_job_id = job_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut ready_tx = Some(ready_tx);
            let mut tracker = SegmentTracker::default();
            let mut last_line = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(path) = opened_segment(&line) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                        info!(job_id = %log_job_id, "transcoder produced first segment");
                    }
                    if let Some(completed_tx) = &completed_tx {
                        if let Some(done) = tracker.opened(path) {
                            let _ = completed_tx.send(done);
                        }
                    }
                }
                debug!(job_id = %log_job_id, "ffmpeg: {}", line);
                last_line = line;
            }
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(Err(format!("ffmpeg exited before first segment: {last_line}")));
            }
            // stderr closes when ffmpeg exits; whatever is open is final
            if let Some(completed_tx) = completed_tx {
                for done in tracker.drain() {
                    let _ = completed_tx.send(done);
                }
            }
        });

        self.jobs.insert(
            job_id.clone(),
            Arc::new(FfmpegJob {
                output_dir: spec.output_dir,
                child: tokio::sync::Mutex::new(Some(child)),
            }),
        );

        Ok(LaunchedJob {
            job_id,
            ready: ready_rx,
            segments: segments_rx,
        })
    }

    async fn finalize(&self, job_id: &str) -> Result<FinalizedJob, ClientError> {
        let job = self.job(job_id)?;

        {
            let mut guard = job.child.lock().await;
            if let Some(child) = guard.as_mut() {
                if let Some(mut stdin) = child.stdin.take() {
                    // `q` asks ffmpeg to flush the playlist and exit
                    let _ = stdin.write_all(b"q\n").await;
                }
                let status = child
                    .wait()
                    .await
                    .map_err(|e| ClientError::unavailable(DEPENDENCY, e.to_string()))?;
                debug!(job_id, ?status, "ffmpeg exited");
                *guard = None;
            }
        }

        let finalized = collect_playlists(&job.output_dir).await?;
        self.jobs.remove(job_id);
        Ok(finalized)
    }

    async fn abort(&self, job_id: &str) {
        if let Some((_, job)) = self.jobs.remove(job_id) {
            if let Some(mut child) = job.child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    warn!(job_id, error = %e, "failed to kill ffmpeg");
                }
            }
        }
    }
}

/// Playlists are small; segments were already streamed out while live
async fn collect_playlists(root: &Path) -> Result<FinalizedJob, ClientError> {
    let io_err = |e: std::io::Error| ClientError::unavailable(DEPENDENCY, e.to_string());

    let manifest = tokio::fs::read_to_string(root.join("master.m3u8"))
        .await
        .map_err(io_err)?;

    let mut playlists = Vec::new();
    let mut variants = tokio::fs::read_dir(root).await.map_err(io_err)?;
    while let Some(variant) = variants.next_entry().await.map_err(io_err)? {
        if !variant.file_type().await.map_err(io_err)?.is_dir() {
            continue;
        }
        let path = variant.path().join("index.m3u8");
        match tokio::fs::read(&path).await {
            Ok(data) => playlists.push(RecordedSegment {
                name: format!("{}/index.m3u8", variant.file_name().to_string_lossy()),
                data: Bytes::from(data),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err(e)),
        }
    }
    playlists.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(FinalizedJob { manifest, playlists })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessMode {
    /// Ready as soon as launched
    Immediate,
    /// Ready only when the test signals it
    Manual,
}

/// Transcoder that runs nothing; readiness and failures are driven by hand.
/// A recorded job produces two segments when it becomes ready, and tests can
/// push more with [`InMemoryTranscoder::push_segment`].
pub struct InMemoryTranscoder {
    mode: Mutex<ReadinessMode>,
    fail_launch: AtomicBool,
    fail_finalize: AtomicBool,
    finalize_delay: Mutex<Option<Duration>>,
    pending: DashMap<String, oneshot::Sender<Result<(), String>>>,
    feeds: DashMap<String, mpsc::Sender<RecordedSegment>>,
    produced: DashMap<String, usize>,
    running: DashMap<String, Uuid>,
    finalized: Mutex<Vec<String>>,
}

impl Default for InMemoryTranscoder {
    fn default() -> Self {
        Self {
            mode: Mutex::new(ReadinessMode::Immediate),
            fail_launch: AtomicBool::new(false),
            fail_finalize: AtomicBool::new(false),
            finalize_delay: Mutex::new(None),
            pending: DashMap::new(),
            feeds: DashMap::new(),
            produced: DashMap::new(),
            running: DashMap::new(),
            finalized: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id_for(session_id: Uuid) -> String {
        format!("mem-{session_id}")
    }

    pub fn set_mode(&self, mode: ReadinessMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_finalize(&self, fail: bool) {
        self.fail_finalize.store(fail, Ordering::SeqCst);
    }

    pub fn set_finalize_delay(&self, delay: Option<Duration>) {
        *self.finalize_delay.lock() = delay;
    }

    pub fn signal_ready(&self, session_id: Uuid) -> bool {
        let signalled = self.signal(session_id, Ok(()));
        if signalled {
            self.produce_opening_segments(&Self::job_id_for(session_id));
        }
        signalled
    }

    pub fn signal_failure(&self, session_id: Uuid, reason: &str) -> bool {
        self.signal(session_id, Err(reason.to_string()))
    }

    fn signal(&self, session_id: Uuid, outcome: Result<(), String>) -> bool {
        match self.pending.remove(&Self::job_id_for(session_id)) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Hand one more completed segment to the archiver of a recorded job
    pub fn push_segment(&self, session_id: Uuid, data: &'static [u8]) -> bool {
        let job_id = Self::job_id_for(session_id);
        let Some(feed) = self.feeds.get(&job_id).map(|f| f.value().clone()) else {
            return false;
        };
        let index = {
            let mut produced = self.produced.entry(job_id).or_insert(0);
            *produced += 1;
            *produced - 1
        };
        feed.try_send(RecordedSegment {
            name: format!("720p/seg_{index:05}.ts"),
            data: Bytes::from_static(data),
        })
        .is_ok()
    }

    fn produce_opening_segments(&self, job_id: &str) {
        let Some(session_id) = self.running.get(job_id).map(|s| *s.value()) else {
            return;
        };
        self.push_segment(session_id, b"segment-0");
        self.push_segment(session_id, b"segment-1");
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.running.contains_key(&Self::job_id_for(session_id))
    }

    pub fn finalized_jobs(&self) -> Vec<String> {
        self.finalized.lock().clone()
    }
}

#[async_trait]
impl TranscoderBackend for InMemoryTranscoder {
    async fn launch(&self, spec: TranscodeJobSpec) -> Result<LaunchedJob, ClientError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(ClientError::unavailable(DEPENDENCY, "no transcoder capacity"));
        }
        let job_id = Self::job_id_for(spec.session_id);
        let (tx, rx) = oneshot::channel();
        self.running.insert(job_id.clone(), spec.session_id);

        let segments = if spec.record {
            let (feed, segments) = mpsc::channel(SEGMENT_BACKLOG);
            self.feeds.insert(job_id.clone(), feed);
            Some(segments)
        } else {
            None
        };

        let mode = *self.mode.lock();
        match mode {
            ReadinessMode::Immediate => {
                let _ = tx.send(Ok(()));
                self.produce_opening_segments(&job_id);
            }
            ReadinessMode::Manual => {
                self.pending.insert(job_id.clone(), tx);
            }
        }
        Ok(LaunchedJob {
            job_id,
            ready: rx,
            segments,
        })
    }

    async fn finalize(&self, job_id: &str) -> Result<FinalizedJob, ClientError> {
        let delay = *self.finalize_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_finalize.load(Ordering::SeqCst) {
            return Err(ClientError::unavailable(DEPENDENCY, "transcoder unreachable"));
        }
        self.running.remove(job_id);
        self.pending.remove(job_id);
        self.feeds.remove(job_id);
        self.produced.remove(job_id);
        self.finalized.lock().push(job_id.to_string());
        Ok(FinalizedJob {
            manifest: "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=3000000\n720p/index.m3u8\n".to_string(),
            playlists: vec![RecordedSegment {
                name: "720p/index.m3u8".to_string(),
                data: Bytes::from_static(b"#EXTM3U\n#EXT-X-ENDLIST\n"),
            }],
        })
    }

    async fn abort(&self, job_id: &str) {
        self.running.remove(job_id);
        self.pending.remove(job_id);
        self.feeds.remove(job_id);
        self.produced.remove(job_id);
    }
}

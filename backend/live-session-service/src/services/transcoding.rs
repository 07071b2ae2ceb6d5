//! Transcoding orchestrator
//!
//! Owns one job per live session and drives it through
//! `NOT_STARTED -> STARTING -> READY -> STOPPING -> STOPPED | FAILED`.
//! Readiness arrives as an explicit signal from the backend; viewers see a
//! `starting` status until it does. Recorded sessions have their segments
//! archived as the backend completes them; stopping only flushes the tail
//! and writes the manifest.

use dashmap::DashMap;
use parking_lot::Mutex;
use resilience::{with_deadline, CallPolicy, DeadlineError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::{
    guarded, ArchiveStorage, ClientError, RecordedSegment, TranscodeJobSpec, TranscoderBackend,
};
use crate::config::TranscodeConfig;
use crate::error::{AppError, Result};
use crate::metrics;
use crate::models::StreamSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscodeState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl TranscodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: TranscodeState) -> bool {
        use TranscodeState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (NotStarted, Failed)
                | (Starting, Ready)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Ready, Stopping)
                | (Ready, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

/// What a joining viewer is told about playback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlaybackStatus {
    NotStarted,
    Starting,
    Ready { manifest_url: String },
    Failed { reason: String },
    Ended,
}

impl PlaybackStatus {
    pub fn manifest_url(&self) -> Option<String> {
        match self {
            PlaybackStatus::Ready { manifest_url } => Some(manifest_url.clone()),
            _ => None,
        }
    }
}

pub type ReadySignal = oneshot::Receiver<std::result::Result<(), String>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveTally {
    pub stored: usize,
    pub failed: usize,
}

struct TranscodeJob {
    state: TranscodeState,
    job_id: Option<String>,
    manifest_url: Option<String>,
    recording: bool,
    failure: Option<String>,
    archiver: Option<JoinHandle<ArchiveTally>>,
}

/// Upload segments as they complete. Ends when the backend closes the feed.
fn spawn_archiver(
    session_id: Uuid,
    archive: Arc<dyn ArchiveStorage>,
    mut segments: mpsc::Receiver<RecordedSegment>,
) -> JoinHandle<ArchiveTally> {
    tokio::spawn(async move {
        let mut tally = ArchiveTally::default();
        while let Some(segment) = segments.recv().await {
            match archive.put_segment(session_id, &segment.name, segment.data).await {
                Ok(()) => {
                    tally.stored += 1;
                    debug!(%session_id, segment = %segment.name, "segment archived");
                }
                Err(e) => {
                    tally.failed += 1;
                    metrics::external_failure("archive");
                    warn!(%session_id, segment = %segment.name, error = %e, "segment not archived");
                }
            }
        }
        tally
    })
}

pub struct TranscodeOrchestrator {
    jobs: DashMap<Uuid, Arc<Mutex<TranscodeJob>>>,
    backend: Arc<dyn TranscoderBackend>,
    archive: Arc<dyn ArchiveStorage>,
    config: TranscodeConfig,
    policy: CallPolicy,
}

impl TranscodeOrchestrator {
    pub fn new(
        backend: Arc<dyn TranscoderBackend>,
        archive: Arc<dyn ArchiveStorage>,
        config: TranscodeConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            jobs: DashMap::new(),
            backend,
            archive,
            config,
            policy,
        }
    }

    fn job(&self, session_id: Uuid) -> Option<Arc<Mutex<TranscodeJob>>> {
        self.jobs.get(&session_id).map(|j| j.value().clone())
    }

    /// Move a job forward; refuses moves outside the state machine
    fn advance(&self, session_id: Uuid, next: TranscodeState) -> bool {
        let Some(job) = self.job(session_id) else {
            return false;
        };
        let mut job = job.lock();
        if !job.state.can_transition_to(next) {
            return false;
        }
        job.state = next;
        metrics::transcoder_state(next.as_str());
        info!(%session_id, state = next.as_str(), "transcoder state changed");
        true
    }

    fn fail(&self, session_id: Uuid, reason: String) {
        if self.advance(session_id, TranscodeState::Failed) {
            if let Some(job) = self.job(session_id) {
                job.lock().failure = Some(reason);
            }
        }
    }

    /// Launch the rendition ladder for a session that just went live
    pub async fn start_for_session(&self, session: &StreamSession) -> Result<ReadySignal> {
        let session_id = session.id;
        self.jobs.insert(
            session_id,
            Arc::new(Mutex::new(TranscodeJob {
                state: TranscodeState::NotStarted,
                job_id: None,
                manifest_url: None,
                recording: session.recording_enabled,
                failure: None,
                archiver: None,
            })),
        );
        self.advance(session_id, TranscodeState::Starting);

        let spec = TranscodeJobSpec {
            session_id,
            ingest_url: format!(
                "{}/{}",
                self.config.ingest_base_url.trim_end_matches('/'),
                session_id
            ),
            output_dir: PathBuf::from(&self.config.output_dir).join(session_id.to_string()),
            renditions: self.config.ladder.clone(),
            record: session.recording_enabled,
        };

        let backend = self.backend.clone();
        let launched = guarded("transcoder", &self.policy, || {
            let backend = backend.clone();
            let spec = spec.clone();
            async move { backend.launch(spec).await }
        })
        .await;

        match launched {
            Ok(job) => {
                let archiver = job
                    .segments
                    .map(|segments| spawn_archiver(session_id, self.archive.clone(), segments));
                if let Some(entry) = self.job(session_id) {
                    let mut entry = entry.lock();
                    entry.job_id = Some(job.job_id.clone());
                    entry.archiver = archiver;
                }
                info!(%session_id, job_id = %job.job_id, "transcoder launched");
                Ok(job.ready)
            }
            Err(e) => {
                self.fail(session_id, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Wait for the first segment. Returns the playback manifest URL.
    pub async fn await_ready(&self, session_id: Uuid, signal: ReadySignal) -> Result<String> {
        let outcome = with_deadline(self.config.ready_timeout, async move {
            match signal.await {
                Ok(result) => result,
                Err(_) => Err("transcoder dropped its readiness signal".to_string()),
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                let manifest_url = format!(
                    "{}/{}/master.m3u8",
                    self.config.playback_base_url.trim_end_matches('/'),
                    session_id
                );
                if !self.advance(session_id, TranscodeState::Ready) {
                    return Err(AppError::Conflict("transcoder is no longer starting".to_string()));
                }
                if let Some(job) = self.job(session_id) {
                    job.lock().manifest_url = Some(manifest_url.clone());
                }
                Ok(manifest_url)
            }
            Err(DeadlineError::Elapsed(after)) => {
                let reason = format!("transcoder not ready after {}s", after.as_secs());
                self.fail(session_id, reason.clone());
                metrics::external_failure("transcoder");
                Err(AppError::ExternalDependency(reason))
            }
            Err(DeadlineError::Inner(reason)) => {
                self.fail(session_id, reason.clone());
                metrics::external_failure("transcoder");
                Err(AppError::ExternalDependency(reason))
            }
        }
    }

    /// Finalize the job and complete the recording. Never fails the caller:
    /// an incomplete recording is logged and teardown proceeds.
    pub async fn stop_for_session(&self, session_id: Uuid) -> Option<String> {
        let job = self.job(session_id)?;
        let (job_id, recording, archiver) = {
            let mut job = job.lock();
            (job.job_id.clone(), job.recording, job.archiver.take())
        };
        let Some(job_id) = job_id else {
            return None;
        };

        if !self.advance(session_id, TranscodeState::Stopping) {
            // Already failed; make sure nothing keeps running
            self.backend.abort(&job_id).await;
            if let Some(archiver) = archiver {
                archiver.abort();
            }
            return None;
        }

        let policy = CallPolicy::new(self.config.stop_timeout, self.policy.retry.clone());
        let backend = self.backend.clone();
        let finalized = guarded("transcoder", &policy, || {
            let backend = backend.clone();
            let job_id = job_id.clone();
            async move { backend.finalize(&job_id).await }
        })
        .await;

        let finalized = match finalized {
            Ok(finalized) => finalized,
            Err(e) => {
                warn!(%session_id, %job_id, error = %e, "transcoder finalize failed; recording may be incomplete");
                self.backend.abort(&job_id).await;
                if let Some(archiver) = archiver {
                    archiver.abort();
                }
                self.fail(session_id, e.to_string());
                return None;
            }
        };

        let (true, Some(mut archiver)) = (recording, archiver) else {
            self.advance(session_id, TranscodeState::Stopped);
            return None;
        };

        let archive = self.archive.clone();
        let completion = with_deadline(self.config.stop_timeout, async {
            let tally = (&mut archiver).await.unwrap_or_else(|e| {
                warn!(%session_id, error = %e, "archiver task ended abnormally");
                ArchiveTally::default()
            });
            for playlist in finalized.playlists {
                archive
                    .put_segment(session_id, &playlist.name, playlist.data)
                    .await?;
            }
            let location = archive.finalize_manifest(session_id, &finalized.manifest).await?;
            Ok::<_, ClientError>((location, tally))
        })
        .await;

        match completion {
            Ok((location, tally)) => {
                self.advance(session_id, TranscodeState::Stopped);
                if tally.failed > 0 {
                    warn!(%session_id, missing = tally.failed, "recording archived with gaps");
                }
                info!(%session_id, %location, segments = tally.stored, "recording archived");
                Some(location)
            }
            Err(e) => {
                archiver.abort();
                let reason = match e {
                    DeadlineError::Elapsed(_) => "archive flush timed out".to_string(),
                    DeadlineError::Inner(inner) => inner.to_string(),
                };
                metrics::external_failure("archive");
                warn!(%session_id, %reason, "recording archive incomplete");
                self.fail(session_id, reason);
                None
            }
        }
    }

    /// Forget a finished session's job
    pub fn evict(&self, session_id: Uuid) -> bool {
        self.jobs
            .remove_if(&session_id, |_, job| {
                matches!(
                    job.lock().state,
                    TranscodeState::Stopped | TranscodeState::Failed | TranscodeState::NotStarted
                )
            })
            .is_some()
    }

    pub fn tracks(&self, session_id: Uuid) -> bool {
        self.jobs.contains_key(&session_id)
    }

    pub fn state(&self, session_id: Uuid) -> TranscodeState {
        self.job(session_id)
            .map(|job| job.lock().state)
            .unwrap_or(TranscodeState::NotStarted)
    }

    pub fn playback_status(&self, session: &StreamSession) -> PlaybackStatus {
        if session.state.is_terminal() {
            return PlaybackStatus::Ended;
        }
        let Some(job) = self.job(session.id) else {
            return PlaybackStatus::NotStarted;
        };
        let job = job.lock();
        match job.state {
            TranscodeState::NotStarted => PlaybackStatus::NotStarted,
            TranscodeState::Starting => PlaybackStatus::Starting,
            TranscodeState::Ready => match &job.manifest_url {
                Some(url) => PlaybackStatus::Ready {
                    manifest_url: url.clone(),
                },
                None => PlaybackStatus::Starting,
            },
            TranscodeState::Failed => PlaybackStatus::Failed {
                reason: job.failure.clone().unwrap_or_default(),
            },
            TranscodeState::Stopping | TranscodeState::Stopped => PlaybackStatus::Ended,
        }
    }
}

//! Export → upload → persist state machine for one model at a time.
//!
//! Everything except the conversion request runs synchronously inside the job future; the
//! request is the only suspension point. A job exclusively owns its target directory until it
//! is dropped, and a second job for the same directory is refused.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use foldhash::HashSet;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::{ConversionClient, MeshService};
use crate::error::{ConversionError, FailureKind};
use crate::import::PendingImports;
use crate::paths::{self, PlannedArtifacts};
use crate::ply;
use crate::settings::Settings;
use crate::structures::{ConversionParameters, PointSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Exporting,
    Uploading,
    AwaitingResponse,
    Persisting,
    Completed,
    Failed { kind: FailureKind, message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    pub fn in_progress(&self) -> bool {
        !self.is_terminal() && *self != JobStatus::Idle
    }

    fn failed(err: &ConversionError) -> Self {
        JobStatus::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Idle => write!(f, "Idle"),
            JobStatus::Exporting => write!(f, "Exporting point cloud..."),
            JobStatus::Uploading => write!(f, "Uploading point cloud..."),
            JobStatus::AwaitingResponse => {
                write!(f, "Waiting for mesh response from conversion service...")
            }
            JobStatus::Persisting => write!(f, "Writing mesh..."),
            JobStatus::Completed => write!(f, "Conversion complete."),
            JobStatus::Failed { message, .. } => write!(f, "{}", message),
        }
    }
}

/// What to convert and where to put it.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub point_set: PointSet,
    pub base_directory: String,
    pub model_name: String,
    pub parameters: ConversionParameters,
}

impl ConversionRequest {
    pub fn from_settings(point_set: PointSet, model_name: &str, settings: &Settings) -> Self {
        ConversionRequest {
            point_set,
            base_directory: settings.converted_models_path.clone(),
            model_name: model_name.to_string(),
            parameters: settings.conversion_parameters(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub artifacts: PlannedArtifacts,
    pub exported_points: usize,
    pub mesh: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

type ActiveTargets = Arc<Mutex<HashSet<PathBuf>>>;

/// Reservation of a model directory; released on drop.
#[derive(Debug)]
struct TargetLease {
    key: PathBuf,
    active: ActiveTargets,
}

impl TargetLease {
    fn acquire(key: PathBuf, active: &ActiveTargets) -> Result<Self, ConversionError> {
        let mut set = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Err(ConversionError::TargetBusy(key.display().to_string()));
        }
        Ok(TargetLease {
            key,
            active: Arc::clone(active),
        })
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Marks an in-flight job as cancelled if its future is dropped before finishing.
struct AbandonGuard {
    status: Arc<watch::Sender<JobStatus>>,
    model: String,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let abandoned = self.status.send_if_modified(|s| {
            if s.in_progress() {
                *s = JobStatus::failed(&ConversionError::Cancelled);
                true
            } else {
                false
            }
        });
        if abandoned {
            warn!("Conversion of {} abandoned", self.model);
        }
    }
}

pub struct ConversionJob<S> {
    artifacts: PlannedArtifacts,
    base_directory: String,
    point_set: Option<PointSet>,
    parameters: ConversionParameters,
    service: Arc<S>,
    pending_imports: PendingImports,
    status: Arc<watch::Sender<JobStatus>>,
    history: Vec<JobStatus>,
    cancel: Arc<watch::Sender<bool>>,
    exported_points: Option<usize>,
    outcome: Option<JobOutcome>,
    _lease: Option<TargetLease>,
}

impl<S> fmt::Debug for ConversionJob<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionJob")
            .field("artifacts", &self.artifacts)
            .field("status", &*self.status.borrow())
            .field("exported_points", &self.exported_points)
            .finish_non_exhaustive()
    }
}

impl<S: MeshService> ConversionJob<S> {
    pub fn artifacts(&self) -> &PlannedArtifacts {
        &self.artifacts
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.subscribe()
    }

    /// Statuses seen during the most recent `run`, starting with the one it began from.
    pub fn history(&self) -> &[JobStatus] {
        &self.history
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    pub fn exported_points(&self) -> Option<usize> {
        self.exported_points
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    fn transition(&mut self, next: JobStatus) {
        debug!(
            model = %self.artifacts.model_name,
            from = ?*self.status.borrow(),
            to = ?next,
            "job transition"
        );
        self.history.push(next.clone());
        self.status.send_replace(next);
    }

    fn check_cancelled(&self) -> Result<(), ConversionError> {
        if *self.cancel.borrow() {
            return Err(ConversionError::Cancelled);
        }
        Ok(())
    }

    /// Drives the job to `Completed` or `Failed`.
    ///
    /// From `Idle` the job starts by exporting. After a failure it resumes at the first step
    /// that did not finish: re-export if the export itself failed, otherwise re-upload the
    /// PLY already on disk. A completed job returns its outcome again.
    pub async fn run(&mut self) -> Result<JobOutcome, ConversionError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        if matches!(*self.status.borrow(), JobStatus::Failed { .. }) {
            self.cancel.send_replace(false);
        }
        self.history = vec![self.status()];

        let _guard = AbandonGuard {
            status: Arc::clone(&self.status),
            model: self.artifacts.model_name.clone(),
        };

        match self.drive().await {
            Ok(outcome) => {
                self.outcome = Some(outcome.clone());
                self.transition(JobStatus::Completed);
                self._lease = None;
                info!(
                    "Conversion of {} complete: {}",
                    self.artifacts.model_name, self.artifacts.mesh_path
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!("Conversion of {} failed: {}", self.artifacts.model_name, err);
                self.transition(JobStatus::failed(&err));
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<JobOutcome, ConversionError> {
        if !Path::new(&self.base_directory).is_dir() {
            return Err(ConversionError::InvalidDestination(format!(
                "'{}' is no longer a directory",
                self.base_directory
            )));
        }

        if self.point_set.is_some() {
            self.check_cancelled()?;
            self.transition(JobStatus::Exporting);
            self.export()?;
        }

        self.check_cancelled()?;
        self.transition(JobStatus::Uploading);
        let ply_path = &self.artifacts.point_cloud_path;
        let file_bytes = fs::read(ply_path).map_err(|e| ConversionError::io_at(ply_path, e))?;
        let file_name = self.artifacts.point_cloud_file_name();

        self.check_cancelled()?;
        self.transition(JobStatus::AwaitingResponse);
        let service = Arc::clone(&self.service);
        let parameters = self.parameters;
        let mut cancel_rx = self.cancel.subscribe();
        let mesh = tokio::select! {
            biased;
            _ = cancel_rx.wait_for(|&cancelled| cancelled) => {
                return Err(ConversionError::Cancelled);
            }
            result = service.submit(file_bytes, &file_name, &parameters) => result?,
        };

        self.transition(JobStatus::Persisting);
        persist(Path::new(&self.artifacts.mesh_path), &mesh)?;
        self.pending_imports.mark(&self.artifacts.mesh_path);

        Ok(JobOutcome {
            artifacts: self.artifacts.clone(),
            exported_points: self.exported_points.unwrap_or_default(),
            mesh: Arc::from(mesh),
        })
    }

    fn export(&mut self) -> Result<(), ConversionError> {
        paths::plan(&self.base_directory, &self.artifacts.model_name)?;
        let Some(set) = self.point_set.as_ref() else {
            return Ok(());
        };
        let count = ply::export(set, Path::new(&self.artifacts.point_cloud_path))?;
        self.exported_points = Some(count);
        // The set is only needed until it has been encoded.
        self.point_set = None;
        Ok(())
    }
}

/// Writes the mesh and flushes it to disk before returning.
fn persist(path: &Path, bytes: &[u8]) -> Result<(), ConversionError> {
    let mut file = File::create(path).map_err(|e| ConversionError::io_at(path, e))?;
    file.write_all(bytes)
        .map_err(|e| ConversionError::io_at(path, e))?;
    file.sync_all().map_err(|e| ConversionError::io_at(path, e))?;
    info!("Wrote mesh {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

pub struct ConversionPipeline<S> {
    service: Arc<S>,
    pending_imports: PendingImports,
    active: ActiveTargets,
}

impl ConversionPipeline<ConversionClient> {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConversionError> {
        settings.validate()?;
        Ok(Self::new(ConversionClient::from_settings(settings)?))
    }
}

impl<S: MeshService> ConversionPipeline<S> {
    pub fn new(service: S) -> Self {
        Self::with_pending_imports(service, PendingImports::new())
    }

    pub fn with_pending_imports(service: S, pending_imports: PendingImports) -> Self {
        ConversionPipeline {
            service: Arc::new(service),
            pending_imports,
            active: ActiveTargets::default(),
        }
    }

    pub fn pending_imports(&self) -> &PendingImports {
        &self.pending_imports
    }

    /// Validates the request and reserves its target directory. Nothing is written yet.
    ///
    /// The reservation is held until the job completes or is dropped. A failed job keeps it so
    /// that `run` can retry, and another `prepare` for the same model gets `TargetBusy`.
    pub fn prepare(&self, request: ConversionRequest) -> Result<ConversionJob<S>, ConversionError> {
        let base = Path::new(&request.base_directory);
        if !base.is_dir() {
            return Err(ConversionError::InvalidDestination(format!(
                "'{}' does not exist or is not a directory",
                request.base_directory
            )));
        }
        let metadata = fs::metadata(base).map_err(|e| ConversionError::io_at(base, e))?;
        if metadata.permissions().readonly() {
            return Err(ConversionError::InvalidDestination(format!(
                "'{}' is not writable",
                request.base_directory
            )));
        }
        request.parameters.validate()?;
        let artifacts = paths::artifact_paths(&request.base_directory, &request.model_name)?;

        let canonical = fs::canonicalize(base).map_err(|e| ConversionError::io_at(base, e))?;
        let lease = TargetLease::acquire(canonical.join(&request.model_name), &self.active)?;

        debug!(
            model = %artifacts.model_name,
            points = request.point_set.len(),
            "prepared conversion job"
        );
        let (status, _) = watch::channel(JobStatus::Idle);
        let (cancel, _) = watch::channel(false);
        Ok(ConversionJob {
            artifacts,
            base_directory: request.base_directory.clone(),
            point_set: Some(request.point_set),
            parameters: request.parameters,
            service: Arc::clone(&self.service),
            pending_imports: self.pending_imports.clone(),
            status: Arc::new(status),
            history: vec![JobStatus::Idle],
            cancel: Arc::new(cancel),
            exported_points: None,
            outcome: None,
            _lease: Some(lease),
        })
    }

    /// `prepare` followed by `run`.
    pub async fn convert(&self, request: ConversionRequest) -> Result<JobOutcome, ConversionError> {
        let mut job = self.prepare(request)?;
        job.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RECORD_SIZE;
    use crate::structures::{DeletionMask, PointRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeService {
        calls: AtomicUsize,
        fail_first: usize,
        hang: bool,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl MeshService for FakeService {
        async fn submit(
            &self,
            file_bytes: Vec<u8>,
            file_name: &str,
            _parameters: &ConversionParameters,
        ) -> Result<Vec<u8>, ConversionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.uploads
                .lock()
                .unwrap()
                .push((file_name.to_string(), file_bytes));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if call < self.fail_first {
                return Err(ConversionError::upload_failed("503 Service Unavailable"));
            }
            Ok(b"mesh-payload".to_vec())
        }
    }

    fn five_point_set() -> PointSet {
        let mut records: Vec<_> = (0..5)
            .map(|i| PointRecord {
                position: [i as f32, 0.0, 0.0],
                ..Default::default()
            })
            .collect();
        records[4].normal = [1.0, 0.0, 0.0];
        let mut mask = DeletionMask::new(5);
        mask.set_deleted(1, true);
        mask.set_deleted(3, true);
        PointSet::with_mask(records, mask)
    }

    fn request(dir: &TempDir, name: &str) -> ConversionRequest {
        ConversionRequest {
            point_set: five_point_set(),
            base_directory: dir.path().to_string_lossy().into_owned(),
            model_name: name.to_string(),
            parameters: ConversionParameters::default(),
        }
    }

    #[tokio::test]
    async fn successful_run_visits_every_state_once() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();
        assert_eq!(job.status(), JobStatus::Idle);

        let outcome = job.run().await.unwrap();
        assert_eq!(
            job.history(),
            &[
                JobStatus::Idle,
                JobStatus::Exporting,
                JobStatus::Uploading,
                JobStatus::AwaitingResponse,
                JobStatus::Persisting,
                JobStatus::Completed,
            ]
        );
        assert_eq!(outcome.exported_points, 2);
        assert_eq!(&*outcome.mesh, b"mesh-payload");
        assert_eq!(
            fs::read(&outcome.artifacts.mesh_path).unwrap(),
            b"mesh-payload"
        );
        assert!(pipeline
            .pending_imports()
            .is_pending(&outcome.artifacts.mesh_path));

        let uploads = pipeline.service.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let (file_name, bytes) = &uploads[0];
        assert_eq!(file_name, "skater.ply");
        let header = ply::header(2);
        assert!(bytes.starts_with(header.as_bytes()));
        assert_eq!(bytes.len() - header.len(), 2 * RECORD_SIZE);
    }

    #[tokio::test]
    async fn transport_failure_leaves_no_mesh() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService {
            fail_first: 1,
            ..Default::default()
        });
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();

        let err = job.run().await.unwrap_err();
        assert_eq!(err.to_string(), "Upload failed: 503 Service Unavailable");
        match job.status() {
            JobStatus::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Transport);
                assert_eq!(message, "Upload failed: 503 Service Unavailable");
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(!Path::new(&job.artifacts().mesh_path).exists());
        // The exported point cloud stays on disk for a retry.
        assert!(Path::new(&job.artifacts().point_cloud_path).exists());
        assert!(pipeline.pending_imports().pending().is_empty());
    }

    #[tokio::test]
    async fn retry_after_transport_failure_skips_export() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService {
            fail_first: 1,
            ..Default::default()
        });
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();
        assert!(job.run().await.is_err());

        let outcome = job.run().await.unwrap();
        assert_eq!(outcome.exported_points, 2);
        assert!(!job.history().contains(&JobStatus::Exporting));
        assert_eq!(job.history().last(), Some(&JobStatus::Completed));
        assert_eq!(pipeline.service.calls.load(Ordering::SeqCst), 2);

        // A finished job hands back the same outcome without another request.
        job.run().await.unwrap();
        assert_eq!(pipeline.service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_destination_is_rejected_before_io() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());

        let mut missing = request(&dir, "skater");
        missing.base_directory = dir.path().join("nope").to_string_lossy().into_owned();
        assert!(matches!(
            pipeline.prepare(missing),
            Err(ConversionError::InvalidDestination(_))
        ));
        assert!(!dir.path().join("nope").exists());

        let file = dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();
        let mut not_dir = request(&dir, "skater");
        not_dir.base_directory = file.to_string_lossy().into_owned();
        assert!(matches!(
            pipeline.prepare(not_dir),
            Err(ConversionError::InvalidDestination(_))
        ));

        assert!(matches!(
            pipeline.prepare(request(&dir, "../escape")),
            Err(ConversionError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn same_target_is_serialized() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());

        let first = pipeline.prepare(request(&dir, "skater")).unwrap();
        assert!(matches!(
            pipeline.prepare(request(&dir, "skater")),
            Err(ConversionError::TargetBusy(_))
        ));
        let mut other = pipeline.prepare(request(&dir, "bunny")).unwrap();
        other.run().await.unwrap();

        drop(first);
        assert!(pipeline.prepare(request(&dir, "skater")).is_ok());
    }

    #[tokio::test]
    async fn completed_job_releases_its_target() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        let mut done = pipeline.prepare(request(&dir, "skater")).unwrap();
        done.run().await.unwrap();

        let mut again = pipeline.prepare(request(&dir, "skater")).unwrap();
        again.run().await.unwrap();
        assert!(done.outcome().is_some());
    }

    #[tokio::test]
    async fn failed_job_keeps_its_target() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService {
            fail_first: 1,
            ..Default::default()
        });
        let mut failed = pipeline.prepare(request(&dir, "skater")).unwrap();
        assert!(failed.run().await.is_err());
        assert!(matches!(
            pipeline.prepare(request(&dir, "skater")),
            Err(ConversionError::TargetBusy(_))
        ));
    }

    #[tokio::test]
    async fn persist_failure_is_io_and_not_marked() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();
        // A directory where the mesh file should go.
        fs::create_dir_all(&job.artifacts().mesh_path).unwrap();

        let err = job.run().await.unwrap_err();
        assert!(matches!(err, ConversionError::IoFailure { .. }), "{:?}", err);
        assert!(matches!(
            job.status(),
            JobStatus::Failed {
                kind: FailureKind::Io,
                ..
            }
        ));
        let history = job.history();
        assert_eq!(history[history.len() - 2], JobStatus::Persisting);
        assert!(matches!(history.last(), Some(JobStatus::Failed { .. })));
        assert!(pipeline.pending_imports().pending().is_empty());
        assert!(job.outcome().is_none());
    }

    #[tokio::test]
    async fn export_failure_stops_before_upload() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        // A plain file where the model folder should be created.
        fs::write(dir.path().join("skater"), b"not a folder").unwrap();
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();

        let err = job.run().await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
        assert_eq!(&job.history()[..2], &[JobStatus::Idle, JobStatus::Exporting]);
        assert_eq!(job.history().len(), 3);
        assert!(!job.history().contains(&JobStatus::Uploading));
        assert_eq!(job.exported_points(), None);
        assert_eq!(pipeline.service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn independent_jobs_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        let (a, b) = tokio::join!(
            pipeline.convert(request(&dir, "a")),
            pipeline.convert(request(&dir, "b"))
        );
        assert!(Path::new(&a.unwrap().artifacts.mesh_path).exists());
        assert!(Path::new(&b.unwrap().artifacts.mesh_path).exists());
    }

    #[tokio::test]
    async fn cancel_while_awaiting_response() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService {
            hang: true,
            ..Default::default()
        });
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();
        let cancel = job.cancel_handle();
        let mut status = job.subscribe();

        let (result, _) = tokio::join!(job.run(), async move {
            status
                .wait_for(|s| *s == JobStatus::AwaitingResponse)
                .await
                .unwrap();
            cancel.cancel();
        });
        assert!(matches!(result, Err(ConversionError::Cancelled)));
        assert!(matches!(
            job.status(),
            JobStatus::Failed {
                kind: FailureKind::Cancelled,
                ..
            }
        ));
        assert!(!Path::new(&job.artifacts().mesh_path).exists());
    }

    #[tokio::test]
    async fn cancel_before_start_skips_export() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService::default());
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();
        job.cancel_handle().cancel();

        assert!(matches!(job.run().await, Err(ConversionError::Cancelled)));
        assert!(!Path::new(&job.artifacts().point_cloud_path).exists());
        assert_eq!(pipeline.service.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abandoned_run_is_marked_cancelled() {
        let dir = TempDir::new().unwrap();
        let pipeline = ConversionPipeline::new(FakeService {
            hang: true,
            ..Default::default()
        });
        let mut job = pipeline.prepare(request(&dir, "skater")).unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(50), job.run())
            .await
            .is_err();
        assert!(timed_out);
        assert_eq!(
            job.status(),
            JobStatus::Failed {
                kind: FailureKind::Cancelled,
                message: "Conversion was cancelled".to_string(),
            }
        );
    }
}

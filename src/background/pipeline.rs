use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::background::pool::Task;
use crate::background::watermark::WatermarkCache;
use crate::common::errors::{ResizeError, Step, UploadFailure};
use crate::common::{DEFAULT_WATERMARK_DISSOLVE, DEFAULT_WATERMARK_QUALITY, content_type_for};
use crate::metrics::ResizeMetrics;
use crate::models::request::{ResizePlan, SizeSpec, WaterMarkOptions};
use crate::models::response::{ResultSize, SizeResults};
use crate::operations::executor::{ExecError, Gravity, Quality, ResizeMode, TransformExecutor};
use crate::operations::store::{BlobLocation, BlobStore};

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct PipelineContext {
    pub executor: Arc<dyn TransformExecutor>,
    pub store: Arc<dyn BlobStore>,
    pub watermarks: Arc<WatermarkCache>,
    pub metrics: Arc<dyn ResizeMetrics>,
    pub work_dir: PathBuf,
}

// ────────────────────────────────────────────────────────────────
// Local artifacts
// ────────────────────────────────────────────────────────────────

/// Every local file a run creates. All of them are removed on drop,
/// whether the run succeeded, failed or panicked.
struct Artifacts {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl Artifacts {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            paths: Vec::new(),
        }
    }

    /// Reserve a fresh `<uuid>.<ext>` path. It is registered before anything
    /// writes to it.
    fn create(&mut self, format: &str) -> PathBuf {
        let path = self
            .dir
            .join(format!("{}.{}", Uuid::new_v4(), artifact_extension(format)));
        self.paths.push(path.clone());
        path
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => error!("Failed to remove artifact {:?}: {}", path, err),
            }
        }
    }
}

fn artifact_extension(format: &str) -> String {
    if !format.is_empty() && format.chars().all(|c| c.is_ascii_alphanumeric()) {
        format.to_ascii_lowercase()
    } else {
        "img".to_string()
    }
}

// ────────────────────────────────────────────────────────────────
// Run
// ────────────────────────────────────────────────────────────────

struct PendingUpload {
    size: String,
    key: String,
    path: PathBuf,
    format: String,
}

/// One request's pipeline: download, normalize, per-size chain, uploads.
pub struct PipelineRun {
    plan: ResizePlan,
    ctx: PipelineContext,
    uploaded: Arc<Mutex<Vec<String>>>,
}

impl PipelineRun {
    pub fn new(plan: ResizePlan, ctx: PipelineContext) -> Self {
        Self {
            plan,
            ctx,
            uploaded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle that deletes whatever this run uploaded. Only meaningful once
    /// the run has failed.
    pub fn rollback(&self) -> RemoteRollback {
        RemoteRollback {
            store: Arc::clone(&self.ctx.store),
            location: self.plan.location.clone(),
            ledger: Arc::clone(&self.uploaded),
        }
    }

    pub async fn execute(self) -> Result<SizeResults, ResizeError> {
        let start_time = Instant::now();
        let plan = &self.plan;
        let executor = &self.ctx.executor;
        let mut artifacts = Artifacts::new(&self.ctx.work_dir);

        let source = artifacts.create(&plan.format);
        self.ctx
            .store
            .get(&plan.location, &plan.original_path, &source)
            .await
            .map_err(ResizeError::SourceFetch)?;
        debug!("Fetched {} into {:?}", plan.original_path, source);

        let normalized = artifacts.create(&plan.format);
        executor
            .normalize(&source, &normalized, plan.normalize_hint())
            .await
            .map_err(|err| ResizeError::Normalize(err.into()))?;

        // Each resize reads the previous size's resize output.
        let mut head = normalized;
        let mut results = SizeResults::new();
        let mut uploads = Vec::with_capacity(plan.sizes.len());
        for size in &plan.sizes {
            let (next_head, candidate, result) =
                self.process_size(size, &head, &mut artifacts).await?;
            head = next_head;
            uploads.push(PendingUpload {
                size: size.name.clone(),
                key: result.path.clone(),
                path: candidate,
                format: size.format.clone(),
            });
            results.insert(size.name.clone(), result);
        }

        self.upload_all(uploads).await?;

        let elapsed = start_time.elapsed();
        self.ctx.metrics.observe_resize(elapsed);
        info!(
            duration = &*format!("{:?}", elapsed);
            "Resized {} into {} sizes", plan.original_path, results.len()
        );
        Ok(results)
    }

    /// Resize, crop, watermark and inspect one size. Returns the new head,
    /// the artifact to upload and the size's result.
    async fn process_size(
        &self,
        size: &SizeSpec,
        head: &Path,
        artifacts: &mut Artifacts,
    ) -> Result<(PathBuf, PathBuf, ResultSize), ResizeError> {
        let executor = &self.ctx.executor;
        let fail = |step: Step| move |err: ExecError| ResizeError::size_step(&size.name, step, err);

        let resized = artifacts.create(&size.format);
        executor
            .resize(
                head,
                &resized,
                size.resize.x,
                size.resize.y,
                Quality::new(size.resize.image_quality),
                ResizeMode::from_quick(size.resize.quick_resize),
            )
            .await
            .map_err(fail(Step::Resize))?;

        let mut candidate = resized.clone();
        if let Some(crop) = &size.crop {
            let cropped = artifacts.create(&size.format);
            executor
                .crop(&candidate, &cropped, crop.width, crop.height, crop.x, crop.y)
                .await
                .map_err(fail(Step::Crop))?;
            candidate = cropped;
        }

        if let Some(options) = &size.watermark {
            candidate = self
                .apply_watermark(size, options, &candidate, artifacts)
                .await
                .map_err(|err| ResizeError::size_step(&size.name, Step::Watermark, err))?;
        }

        let dimensions = executor
            .inspect(&candidate)
            .await
            .map_err(fail(Step::Inspect))?;
        debug!(
            "Size {} ready at {:?} ({}x{})",
            size.name, candidate, dimensions.width, dimensions.height
        );

        let result = ResultSize {
            path: size.destination(&self.plan.path_to_save),
            width: dimensions.width,
            height: dimensions.height,
        };
        Ok((resized, candidate, result))
    }

    async fn apply_watermark(
        &self,
        size: &SizeSpec,
        options: &WaterMarkOptions,
        base: &Path,
        artifacts: &mut Artifacts,
    ) -> anyhow::Result<PathBuf> {
        let watermark = self
            .ctx
            .watermarks
            .get_or_fetch(&options.watermark_image_url)
            .await?;

        let scaled = artifacts.create(&watermark.format);
        self.ctx
            .executor
            .resize(
                &watermark.path,
                &scaled,
                options.width,
                options.height,
                Quality::new(DEFAULT_WATERMARK_QUALITY.into()),
                ResizeMode::Filtered,
            )
            .await?;

        let composed = artifacts.create(&size.format);
        self.ctx
            .executor
            .composite(
                &scaled,
                base,
                &composed,
                options.x,
                options.y,
                DEFAULT_WATERMARK_DISSOLVE,
                Gravity::NorthWest,
            )
            .await?;
        Ok(composed)
    }

    /// Upload every size concurrently. Succeeded keys go into the rollback
    /// ledger; any failure fails the run with all failed sizes listed.
    async fn upload_all(&self, uploads: Vec<PendingUpload>) -> Result<(), ResizeError> {
        let total = uploads.len();
        let store = &self.ctx.store;
        let location = &self.plan.location;

        let outcomes = join_all(uploads.into_iter().map(|upload| async move {
            let outcome = store
                .put(location, &upload.key, &upload.path, content_type_for(&upload.format))
                .await;
            (upload, outcome)
        }))
        .await;

        let mut failures = Vec::new();
        for (upload, outcome) in outcomes {
            match outcome {
                Ok(()) => self.record_uploaded(upload.key),
                Err(error) => failures.push(UploadFailure {
                    size: upload.size,
                    key: upload.key,
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ResizeError::Upload { failures, total })
        }
    }

    fn record_uploaded(&self, key: String) {
        match self.uploaded.lock() {
            Ok(mut ledger) => ledger.push(key),
            Err(_) => error!("Upload ledger poisoned, {} will not be rolled back", key),
        }
    }
}

impl Task for PipelineRun {
    type Output = Result<SizeResults, ResizeError>;

    fn run(self) -> impl Future<Output = Self::Output> + Send {
        async move { self.execute().await }
    }
}

// ────────────────────────────────────────────────────────────────
// Remote rollback
// ────────────────────────────────────────────────────────────────

/// Deletes the keys a failed run managed to upload. Best-effort.
pub struct RemoteRollback {
    store: Arc<dyn BlobStore>,
    location: BlobLocation,
    ledger: Arc<Mutex<Vec<String>>>,
}

impl RemoteRollback {
    /// Returns how many keys were deleted.
    pub async fn run(self) -> usize {
        let keys = match self.ledger.lock() {
            Ok(mut ledger) => std::mem::take(&mut *ledger),
            Err(_) => {
                error!("Upload ledger poisoned, skipping rollback");
                return 0;
            }
        };
        if keys.is_empty() {
            return 0;
        }

        let store = &self.store;
        let location = &self.location;
        let outcomes = join_all(keys.iter().map(|key| async move {
            (key, store.delete(location, key).await)
        }))
        .await;

        let mut deleted = 0;
        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => deleted += 1,
                Err(err) => warn!("Failed to roll back {}: {:#}", key, err),
            }
        }
        info!("Rolled back {} of {} uploaded keys", deleted, keys.len());
        deleted
    }
}

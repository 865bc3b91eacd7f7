use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use log::{error, info};

use image_resizer::api::{ResizeService, build_rocket};
use image_resizer::background::pipeline::{PipelineContext, PipelineRun};
use image_resizer::background::pool::WorkerPool;
use image_resizer::background::watermark::WatermarkCache;
use image_resizer::bootstrap::config::{ExecutorKind, ResizerConfig, StoreKind};
use image_resizer::bootstrap::setup::initialize;
use image_resizer::common::RESIZER_RUNTIME;
use image_resizer::metrics::{CounterMetrics, ResizeMetrics};
use image_resizer::operations::aws::AwsCliStore;
use image_resizer::operations::executor::TransformExecutor;
use image_resizer::operations::fetch::HttpFetcher;
use image_resizer::operations::local::LocalStore;
use image_resizer::operations::magick::MagickExecutor;
use image_resizer::operations::native::NativeExecutor;
use image_resizer::operations::store::BlobStore;

fn main() -> Result<()> {
    let start_time = Instant::now();
    let config = ResizerConfig::load()?;
    initialize(&config)?;

    let executor: Arc<dyn TransformExecutor> = match config.executor {
        ExecutorKind::Magick => Arc::new(MagickExecutor::new(config.limits())),
        ExecutorKind::Native => Arc::new(NativeExecutor::new(config.limits())),
    };
    let store: Arc<dyn BlobStore> = match config.store {
        StoreKind::Aws => Arc::new(AwsCliStore::new(config.timeout())),
        StoreKind::Local => Arc::new(LocalStore::new(&config.store_root)),
    };
    let fetcher = Arc::new(HttpFetcher::new(config.timeout())?);
    let watermarks = Arc::new(WatermarkCache::new(
        config.watermark_dir(),
        config.watermark_ttl(),
        fetcher,
    ));
    let counters = Arc::new(CounterMetrics::default());
    let metrics: Arc<dyn ResizeMetrics> = counters.clone();

    let context = PipelineContext {
        executor,
        store,
        watermarks: watermarks.clone(),
        metrics,
        work_dir: config.work_dir.clone(),
    };

    RESIZER_RUNTIME.block_on(async {
        let pool = Arc::new(WorkerPool::<PipelineRun>::new(
            config.worker_count(),
            RESIZER_RUNTIME.handle().clone(),
        ));
        pool.run()?;
        watermarks.start(config.janitor_interval());

        let service = ResizeService {
            pool: pool.clone(),
            context,
            counters,
        };
        info!(
            duration = &*format!("{:?}", start_time.elapsed());
            "Listening on {}:{} with {} workers", config.address, config.port, pool.size()
        );

        let launched = build_rocket(config.figment(), service)
            .launch()
            .await
            .map_err(|err| anyhow!("Rocket server failed: {}", err));
        if let Err(err) = &launched {
            error!("{:#}", err);
        }

        pool.shutdown().await;
        watermarks.shutdown().await;
        info!("Shutdown complete");
        launched.map(|_| ())
    })
}

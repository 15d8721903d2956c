pub mod artifacts;
pub mod device;
pub mod generate;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod threads;

use crate::config::Config;
use crate::error::Result;

use artifacts::{ArtifactStore, RetentionPolicy};
use device::Device;
use generate::{CameraType, Wonder3dGenerator};
use model::sam::{prompt::Prompt, SAMmodel};
use pipeline::Pipeline;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        App { config }
    }

    pub fn store(&self) -> Result<ArtifactStore> {
        ArtifactStore::new(
            &self.config.output_root,
            RetentionPolicy::from(&self.config.retention),
        )
    }

    /// Loads the segmentation model once and starts its worker thread.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let device = Device::current();
        let sam = SAMmodel::new_path(
            &self.config.sam_e_path,
            &self.config.sam_d_path,
            device,
            self.config.intra_threads,
            self.config.mask_threshold,
        )?;
        info!("SAM2 model loaded on {device}");

        let worker = threads::run(Box::new(sam))?;
        let generator = Arc::new(Wonder3dGenerator::new(&self.config.generator));
        Ok(Pipeline::new(worker, generator, self.store()?))
    }

    pub async fn serve(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        let store = pipeline.store().clone();
        sweep_once(&store);
        if let Some(secs) = self.config.retention.sweep_interval_secs {
            spawn_sweeper(store, Duration::from_secs(secs.max(1)));
        }

        let state = server::ServerState {
            pipeline,
            device: Device::current().to_string(),
        };
        let app = server::router(state.clone(), self.config.body_limit_mb * 1024 * 1024);

        let listener = tokio::net::TcpListener::bind(&self.config.bind).await?;
        info!("server listening on http://{}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await?;

        state.pipeline.stop();
        Ok(())
    }

    /// Segments one image file into `output/<image name>/` and returns the cut-out path.
    pub async fn segment_file(&self, path: PathBuf, prompt: Prompt) -> Result<PathBuf> {
        let pipeline = self.pipeline()?;
        let res = pipeline.segment_file(path, prompt).await;
        pipeline.stop();
        res
    }

    /// Segments and generates; returns the model file path.
    pub async fn run_file(&self, path: PathBuf, camera: CameraType, prompt: Prompt) -> Result<PathBuf> {
        let pipeline = self.pipeline()?;
        let res = pipeline.run_file(path, camera, prompt).await;
        pipeline.stop();
        res
    }

    pub fn sweep(&self) -> Result<Vec<PathBuf>> {
        self.store()?.sweep(std::time::SystemTime::now())
    }
}

fn sweep_once(store: &artifacts::ArtifactStore) {
    if let Err(e) = store.sweep(std::time::SystemTime::now()) {
        warn!("retention sweep failed: {e}");
    }
}

fn spawn_sweeper(store: ArtifactStore, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick fires immediately and startup already swept
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || sweep_once(&store)).await {
                Ok(()) => {}
                Err(e) => warn!("retention sweep task panicked: {e}"),
            }
        }
    });
}

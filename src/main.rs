use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use crate::backend::Loader;
use crate::config::ConfigModule;
use crate::detector::DetectorProxy;
use crate::generator::{DetectorWeights, GeneratorModule};
use crate::server::ListenTask;
use crate::software::SoftwareLoader;

mod backend;
mod cache;
mod config;
mod detail;
mod detector;
mod error;
mod generator;
mod params;
mod pixels;
mod resident;
mod server;
mod software;
mod upscale;

#[derive(Parser, Debug)]
struct CommandLineFlags {
    #[arg(long, short)]
    pub config_path: String,

    /// Overrides the configured listen address.
    #[arg(long)]
    pub listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let config = ConfigModule::new(&args.config_path).context("failed to initialize config")?;
    config
        .with_config(|c| info!("Loaded config: {:?}", c))
        .await;

    let loader: Arc<dyn Loader> = Arc::new(SoftwareLoader::new());

    // The detection worker is started once and lives for the whole process.
    let detector = DetectorProxy::spawn(
        loader
            .load_detector()
            .context("failed to start the detection worker")?,
    );

    let (weights, weights_dir) = config
        .with_config(|c| {
            (
                DetectorWeights {
                    face: c.face_weights(),
                    hand: c.hand_weights(),
                },
                c.weights_dir.clone(),
            )
        })
        .await;
    let generator = GeneratorModule::new(loader, detector, weights, weights_dir);

    ListenTask::new(config, generator, args.listen).run().await
}

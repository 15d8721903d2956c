use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sam_wonder3d::app::generate::CameraType;
use sam_wonder3d::app::model::sam::prompt::{BoxPrompt, PointPrompt, Prompt};
use sam_wonder3d::{App, Config};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sam-wonder3d", about = "SAM2 segmentation + Wonder3D model generation")]
struct Cli {
    /// JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Artifact root, overrides `output_root`
    #[arg(long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the HTTP service
    Serve {
        /// Listen address, overrides `bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Segment one image and write the cut-out
    Segment {
        image_path: PathBuf,
        #[command(flatten)]
        prompt: PromptArgs,
    },
    /// Segment one image, then build a 3D model from the cut-out
    Pipeline {
        image_path: PathBuf,
        camera_type: CameraType,
        #[command(flatten)]
        prompt: PromptArgs,
    },
    /// Apply the artifact retention policy once
    Sweep,
}

#[derive(clap::Args)]
struct PromptArgs {
    /// Positive point, may be repeated
    #[arg(long = "point", num_args = 2, value_names = ["X", "Y"], action = clap::ArgAction::Append)]
    points: Vec<f32>,

    #[arg(long = "box", num_args = 4, value_names = ["X1", "Y1", "X2", "Y2"])]
    bbox: Option<Vec<f32>>,
}

impl PromptArgs {
    fn prompt(&self) -> sam_wonder3d::Result<Prompt> {
        let points = self
            .points
            .chunks(2)
            .map(|p| PointPrompt::positive(p[0], p[1]))
            .collect();
        let bbox = self
            .bbox
            .as_deref()
            .map(|b| BoxPrompt::new(b[0], b[1], b[2], b[3]));

        Prompt::new(points, bbox)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(output) = cli.output {
        config.output_root = output;
    }

    match cli.command {
        Cmd::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            App::new(config).serve().await?;
        }
        Cmd::Segment { image_path, prompt } => {
            let cutout = App::new(config)
                .segment_file(image_path, prompt.prompt()?)
                .await?;
            println!("Saved: {}", cutout.display());
        }
        Cmd::Pipeline {
            image_path,
            camera_type,
            prompt,
        } => {
            let model = App::new(config)
                .run_file(image_path, camera_type, prompt.prompt()?)
                .await?;
            println!("Model: {}", model.display());
        }
        Cmd::Sweep => {
            let removed = App::new(config).sweep()?;
            println!("Removed {} artifact directories", removed.len());
        }
    }

    Ok(())
}

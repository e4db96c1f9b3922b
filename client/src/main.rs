mod app;
mod progress;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use shared::{Device, InferenceConfig, ModelVariant, SeparationConfig, Settings};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use stemsplit_worker::CommandRoutine;

use crate::app::App;
use crate::progress::ProgressView;

#[derive(Parser)]
#[command(name = "stemsplit")]
#[command(about = "Separate audio files into stems with an external model")]
struct Args {
    /// Audio files to process
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// auto, cpu or gpu
    #[arg(short, long)]
    device: Option<Device>,

    /// Samples per inference chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap fraction for the large model pass
    #[arg(long)]
    overlap_large: Option<f32>,

    /// Overlap fraction for the small model pass
    #[arg(long)]
    overlap_small: Option<f32>,

    /// standard, fine-tuned or six-stem
    #[arg(short, long)]
    model: Option<ModelVariant>,

    /// Only extract vocals and accompaniment
    #[arg(long, overrides_with = "no_vocals_only")]
    vocals_only: bool,

    /// Extract every stem even if the settings ask for vocals only
    #[arg(long, overrides_with = "vocals_only")]
    no_vocals_only: bool,

    /// Separation program to launch
    #[arg(long)]
    program: Option<String>,

    /// Seconds to wait for a cancelled job before abandoning it
    #[arg(long)]
    grace_secs: Option<u64>,

    /// Settings file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist the effective settings before running
    #[arg(long)]
    save_config: bool,
}

impl Args {
    fn overrides(&self) -> Settings {
        Settings {
            separation: SeparationConfig {
                output_dir: self.output.clone(),
                device: self.device,
                chunk_size: self.chunk_size,
                overlap_large: self.overlap_large,
                overlap_small: self.overlap_small,
                model: self.model,
                vocals_only: match (self.vocals_only, self.no_vocals_only) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
            },
            inference: InferenceConfig {
                program: self.program.clone(),
                args: None,
                cancel_grace_seconds: self.grace_secs,
            },
        }
    }
}

/// Drain task events until the run finishes. The first completion of
/// `interrupt` cancels the run; it is not polled again afterwards.
async fn run_until_finished(
    app: &mut App,
    interrupt: impl Future<Output = io::Result<()>>,
) -> Result<()> {
    tokio::pin!(interrupt);
    let mut ticker = tokio::time::interval(Duration::from_millis(50));
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                app.process_messages();
                if !app.is_running() {
                    return Ok(());
                }
            }
            result = &mut interrupt, if !interrupted => {
                result.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                warn!("Interrupt received, cancelling");
                app.cancel();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    settings.merge(&args.overrides());
    settings
        .job_options()
        .validate()
        .context("Invalid separation settings")?;

    if args.save_config {
        match &args.config {
            Some(path) => settings.save_to(path)?,
            None => settings.save()?,
        }
        info!("Saved settings");
    }

    let routine = CommandRoutine::from_config(&settings.inference);
    let mut app = App::new(
        routine,
        settings.inference.cancel_grace_period(),
        ProgressView::new(),
    );
    for input in &args.inputs {
        app.add_input(input);
    }

    app.start(settings.job_options())
        .context("Failed to start separation")?;

    run_until_finished(&mut app, tokio::signal::ctrl_c()).await?;

    if let Some(finished) = app.outcome() {
        if let Some(error) = &finished.error {
            eprintln!("Separation failed: {}", error);
            let lines = app.log_lines();
            for line in &lines[lines.len().saturating_sub(5)..] {
                eprintln!("  {}", line);
            }
        } else if finished.cancelled {
            eprintln!("Separation cancelled at {}%", app.percent());
        }
    }
    for line in app.summary() {
        println!("{}", line);
    }

    std::process::exit(app.exit_code());
}

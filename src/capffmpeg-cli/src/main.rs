use anyhow::{bail, Result};
use capffmpeg_bridge::{FfmpegPlugin, JobState, LineHost, PluginEvent, PluginRegistration};
use capffmpeg_core::{echo, init_logging, AppDirs, Config, EncoderConfig, ReencodeRequest, PLUGIN_VERSION};
use capffmpeg_engine::{FfmpegCliEngine, MediaEngine, NullMediaEngine};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "capffmpeg", version, about = "Video re-encoding plugin host")]
struct Cli {
    /// Keep config and logs under this directory instead of the platform
    /// directories (for sandboxed hosts)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Return the given value unchanged
    Echo {
        #[arg(long)]
        value: Option<String>,
    },
    /// Print the plugin version
    Version,
    /// List the methods registered with the host
    Methods,
    /// Re-encode a video and wait for it to finish
    Reencode(ReencodeCommand),
    /// Serve plugin calls as JSON lines on stdin/stdout
    Serve,
}

#[derive(Debug, Parser, Clone)]
struct ReencodeCommand {
    /// Source video (a file:// prefix is accepted)
    #[arg(long)]
    input: String,
    /// Destination file
    #[arg(long)]
    output: String,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    /// Target bitrate in bits per second (defaults to the configured bitrate)
    #[arg(long)]
    bitrate: Option<u64>,
    /// Simulate the job instead of running ffmpeg
    #[arg(long)]
    simulate: bool,
}

#[derive(Debug, Error)]
enum ReencodeFailure {
    #[error("video re-encoding failed: {0}")]
    Failed(String),
    #[error("video re-encoding was cancelled")]
    Cancelled,
}

impl ReencodeCommand {
    fn request(&self) -> ReencodeRequest {
        ReencodeRequest {
            input_path: self.input.clone(),
            output_path: self.output.clone(),
            width: self.width,
            height: self.height,
            bitrate: self.bitrate.filter(|b| *b > 0),
        }
    }

    fn engine(&self, encoder: &EncoderConfig) -> Arc<dyn MediaEngine> {
        if self.simulate {
            Arc::new(NullMediaEngine::default())
        } else {
            Arc::new(FfmpegCliEngine::from_config(encoder))
        }
    }

    fn run(&self, encoder: EncoderConfig) -> Result<()> {
        let plugin = FfmpegPlugin::new(self.engine(&encoder), encoder)?;
        let error = Arc::new(Mutex::new(None::<String>));

        let observer = {
            let error = error.clone();
            Box::new(move |event: &PluginEvent| match event {
                PluginEvent::Progress { progress, .. } => {
                    eprint!("\r{}", format_progress(*progress));
                }
                PluginEvent::ReencodeFinished { error: message, .. } => {
                    eprintln!();
                    if let Ok(mut slot) = error.lock() {
                        *slot = message.clone();
                    }
                }
            })
        };

        let file_id = plugin.reencode_video_observed(&self.request(), observer)?;
        tracing::info!(file_id = %file_id, "Waiting for re-encode");

        match plugin.wait(&file_id) {
            Some(JobState::Completed) => {
                println!("{}", self.output);
                Ok(())
            }
            Some(JobState::Cancelled) => Err(ReencodeFailure::Cancelled.into()),
            Some(JobState::Failed) => {
                let message = error
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                Err(ReencodeFailure::Failed(message).into())
            }
            Some(JobState::Running) | None => bail!("job {file_id} did not finish"),
        }
    }
}

fn format_progress(progress: f64) -> String {
    format!("{:>5.1}%", (progress * 100.0).clamp(0.0, 100.0))
}

fn print_methods(registration: &PluginRegistration) {
    println!("{} ({})", registration.js_name, registration.identifier);
    for method in registration.methods() {
        println!("  - {} [{:?}]", method.name, method.return_type);
    }
}

fn serve(encoder: EncoderConfig) -> Result<()> {
    let engine = Arc::new(FfmpegCliEngine::from_config(&encoder));
    let plugin = Arc::new(FfmpegPlugin::new(engine, encoder)?);
    let host = LineHost::new(PluginRegistration::ffmpeg(), plugin.clone());

    let stdin = io::stdin();
    let stdout = Arc::new(Mutex::new(io::stdout()));
    let summary = host.serve(stdin.lock(), stdout)?;
    plugin.destroy();

    tracing::info!(
        calls = summary.calls,
        rejected = summary.rejected,
        "Line host finished"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = match &cli.root {
        Some(root) => AppDirs::under(root),
        None => AppDirs::discover()?,
    };
    let mut config = Config::load_or_default(&dirs)?;
    if matches!(cli.command, Command::Serve) {
        config.logging.stdout = false;
    }
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command {
        Command::Echo { value } => {
            if let Some(value) = echo(value) {
                println!("{value}");
            }
        }
        Command::Version => println!("{PLUGIN_VERSION}"),
        Command::Methods => print_methods(&PluginRegistration::ffmpeg()),
        Command::Reencode(reencode) => reencode.run(config.encoder)?,
        Command::Serve => {
            tracing::info!(config_dir = %dirs.config_dir().display(), "Starting line host");
            serve(config.encoder)?;
        }
    }

    Ok(())
}

use crate::config::{config_path, load_config, save_config, Config};
use crate::daemon::run_daemon;
use crate::error::{DiagnosisError, Result};
use crate::ipc::{send_command, ControlMessage};
use crate::predictor::{render_text, DiagnosisReport, PredictionOutput, Predictor};
use crate::train::train;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "medscan",
    version,
    about = "Tuberculosis and diabetic retinopathy screening from a single image"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Diagnose one image and print the result
    Predict {
        image: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Keep the models loaded and serve diagnoses over a local socket
    Serve {
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
    /// Ask a running daemon to diagnose an image
    Diagnose { image: PathBuf },
    /// Stop a running daemon
    Stop,
    /// Train the cardio classifier
    Train(TrainArgs),
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigSubcommand,
    },
}

#[derive(clap::Args, Debug, Default, PartialEq)]
pub struct ModelArgs {
    /// Probability above which a diagnosis is positive
    #[arg(short, long)]
    pub threshold: Option<f32>,
    #[arg(long)]
    pub tb_model: Option<PathBuf>,
    #[arg(long)]
    pub dr_model: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Default, PartialEq)]
pub struct TrainArgs {
    /// Directory of .npz sample files
    #[arg(short, long)]
    pub dir: Option<PathBuf>,
    #[arg(long)]
    pub max_files: Option<usize>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigSubcommand {
    /// Write the default configuration file
    Init,
    /// Print the effective configuration
    Show,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl ModelArgs {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(t) = self.threshold {
            cfg.inference.threshold = t;
        }
        if let Some(p) = &self.tb_model {
            cfg.models.tuberculosis = p.clone();
        }
        if let Some(p) = &self.dr_model {
            cfg.models.retinopathy = p.clone();
        }
    }
}

impl TrainArgs {
    pub fn apply(&self, cfg: &mut Config) {
        let t = &mut cfg.training;
        if let Some(d) = &self.dir {
            t.dataset_dir = d.clone();
        }
        if let Some(n) = self.max_files {
            t.max_files = n;
        }
        if let Some(n) = self.epochs {
            t.epochs = n;
        }
        if let Some(n) = self.batch_size {
            t.batch_size = n;
        }
        if let Some(s) = self.seed {
            t.seed = s;
        }
        if let Some(o) = &self.output {
            t.output = o.clone();
        }
    }
}

/// Logs go to stderr so stdout carries only results. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run_cli() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    execute(cli)
}

pub fn execute(cli: Cli) -> ExitCode {
    match cli.command {
        Commands::Predict {
            image,
            models,
            format,
        } => predict(&image, &models, format),
        Commands::Serve { socket } => report(run_daemon(socket)),
        Commands::Diagnose { image } => diagnose_remote(&image),
        Commands::Stop => report(
            send_command(&ControlMessage::Shutdown)
                .map(|_| ())
                .map_err(Into::into),
        ),
        Commands::Train(args) => report(train_with(&args)),
        Commands::Config { action } => report(config_action(action)),
    }
}

fn report(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn diagnose_local(image: &Path, models: &ModelArgs) -> Result<DiagnosisReport> {
    let mut cfg = load_config()?;
    models.apply(&mut cfg);
    cfg.validate()?;
    Predictor::from_config(&cfg)?.diagnose_path(image)
}

/// Runs one prediction; every failure becomes an error object.
pub fn predict_output(image: &Path, models: &ModelArgs) -> PredictionOutput {
    log_failure(image, diagnose_local(image, models)).into()
}

fn log_failure(image: &Path, result: Result<DiagnosisReport>) -> Result<DiagnosisReport> {
    if let Err(e) = &result {
        error!(image = %image.display(), "prediction failed: {e}");
    }
    result
}

fn predict(image: &Path, models: &ModelArgs, format: OutputFormat) -> ExitCode {
    let output = match (log_failure(image, diagnose_local(image, models)), format) {
        (Ok(report), OutputFormat::Text) => {
            print!("{}", render_text(&report));
            return ExitCode::SUCCESS;
        }
        (result, _) => PredictionOutput::from(result),
    };
    match serde_json::to_string(&output) {
        Ok(line) => println!("{line}"),
        Err(e) => {
            error!("failed to encode result: {e}");
            return ExitCode::FAILURE;
        }
    }
    if output.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn diagnose_remote(image: &Path) -> ExitCode {
    // the daemon resolves paths against its own working directory
    let path = match std::fs::canonicalize(image) {
        Ok(p) => p,
        Err(e) => {
            error!(image = %image.display(), "cannot resolve image path: {e}");
            return ExitCode::FAILURE;
        }
    };
    match send_command(&ControlMessage::Diagnose(path)) {
        Ok(Some(reply)) => {
            println!("{reply}");
            match serde_json::from_str::<PredictionOutput>(&reply) {
                Ok(out) if !out.is_error() => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            }
        }
        Ok(None) => {
            error!("daemon did not return a result");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("failed to reach daemon: {e}");
            ExitCode::FAILURE
        }
    }
}

fn train_with(args: &TrainArgs) -> Result<()> {
    let mut cfg = load_config()?;
    args.apply(&mut cfg);
    let report = train(&cfg.training)?;
    info!(
        samples = report.samples,
        accuracy = ?report.final_accuracy(),
        path = %report.model_path.display(),
        "training complete"
    );
    Ok(())
}

fn config_action(action: ConfigSubcommand) -> Result<()> {
    match action {
        ConfigSubcommand::Init => {
            let path = config_path();
            if path.exists() {
                return Err(DiagnosisError::Config(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            let path = save_config(&Config::default())?;
            info!(path = %path.display(), "configuration written");
        }
        ConfigSubcommand::Show => {
            println!("{}", serde_json::to_string_pretty(&load_config()?)?);
        }
    }
    Ok(())
}

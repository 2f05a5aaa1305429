//! worksheet-grader - grade scanned arithmetic worksheets
//!
//! Thin command-line wrapper around the grading pipeline. Logs go to stderr;
//! stdout carries only command output (graded JSON, template ids).

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use worksheet_grader::config::{self, GraderConfig};
use worksheet_grader::error::GradeError;
use worksheet_grader::pipeline::{load_classifier, GradingPipeline};
use worksheet_grader::storage::{self, SqliteStore, StorageError, TemplateStore, WorksheetStore};
use worksheet_grader::vision::draw_marker;
use worksheet_grader::worksheet::{AnswerKey, Template, WorksheetRecord};

/// worksheet-grader - grade scanned arithmetic worksheets
#[derive(Parser, Debug)]
#[command(name = "worksheet-grader")]
#[command(about = "Grade photographed or scanned arithmetic worksheets")]
struct Args {
    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grade one page image and print the result as JSON
    Grade {
        /// Scanned or photographed worksheet
        image: PathBuf,

        /// Do not persist the graded record
        #[arg(long)]
        no_store: bool,
    },
    /// Write a printable fiducial marker image
    DrawMarker {
        /// Marker id (0-3)
        id: u16,

        /// Output image path
        output: PathBuf,

        /// Cell size in pixels
        #[arg(long, default_value = "20")]
        cell: u32,
    },
    /// Store a template JSON file and print its content id
    RegisterTemplate {
        /// Template JSON file
        template: PathBuf,
    },
    /// Register the answer key of a worksheet version
    RegisterWorksheet {
        worksheet_id: String,
        version: String,
        template_id: String,

        /// Canonical answers in problem order
        #[arg(required = true)]
        answers: Vec<String>,
    },
}

fn main() {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
    }

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("{}", failure_line(&e));
        std::process::exit(1);
    }
}

/// Single-line failure report: the whole context chain joined by ": "
fn failure_line(err: &anyhow::Error) -> String {
    format!("{:#}", err).replace('\n', " ")
}

/// Prefix a grading failure with its stable code
fn coded(err: GradeError) -> anyhow::Error {
    anyhow!("{}: {}", err.code(), err)
}

fn run(args: Args) -> Result<()> {
    let config = load_or_default_config(args.config.as_deref())?;

    match args.command {
        Command::Grade { image, no_store } => {
            run_grade(&config, &image, no_store).map_err(coded)?;
        }
        Command::DrawMarker { id, output, cell } => {
            let marker = draw_marker(config.markers.dictionary, id, cell)?;
            marker
                .save(&output)
                .with_context(|| format!("Failed to write marker to {:?}", output))?;
            info!("Wrote marker {} to {:?}", id, output);
        }
        Command::RegisterTemplate { template } => {
            let content = std::fs::read_to_string(&template)
                .with_context(|| format!("Failed to read template {:?}", template))?;
            let parsed = Template::from_json(&content, &config.geometry)
                .with_context(|| format!("Invalid template {:?}", template))?;

            let store = open_store(&config)?;
            let id = store.put_template(&parsed)?;
            println!("{}", id);
        }
        Command::RegisterWorksheet {
            worksheet_id,
            version,
            template_id,
            answers,
        } => {
            let store = open_store(&config)?;
            if store.get_template(&template_id)?.is_none() {
                anyhow::bail!("template {} is not registered", template_id);
            }
            store.put_worksheet(&WorksheetRecord {
                answer_key: AnswerKey {
                    worksheet_id,
                    version,
                    answers,
                },
                template_id,
            })?;
            info!("Worksheet registered");
        }
    }

    Ok(())
}

/// Load configuration from the given file, the default location, or defaults
fn load_or_default_config(path: Option<&Path>) -> Result<GraderConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let config = config::load_config(&config_path)?;
            info!("Loaded configuration from {:?}", config_path);
            return Ok(config);
        }
    }
    info!("Using default configuration");
    Ok(GraderConfig::default())
}

fn open_store(config: &GraderConfig) -> Result<SqliteStore, GradeError> {
    let path = match &config.storage.database_path {
        Some(path) => path.clone(),
        None => storage::default_database_path()?,
    };
    Ok(SqliteStore::open(&path)?)
}

fn run_grade(config: &GraderConfig, image: &Path, no_store: bool) -> Result<(), GradeError> {
    let classifier = load_classifier(&config.recognition)?;
    let store = Arc::new(open_store(config)?);
    let pipeline = GradingPipeline::from_config(config, classifier, store.clone(), store.clone());

    let graded = pipeline.grade_file(image)?;
    if !no_store {
        store.put_graded(&graded)?;
    }

    let json = serde_json::to_string_pretty(&graded).map_err(StorageError::from)?;
    println!("{}", json);
    Ok(())
}

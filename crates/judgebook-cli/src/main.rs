use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use judgebook_grader::{GradeOptions, Grader, GraderConfig, PointsFilter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "judgebook")]
#[command(about = "Weekly competitive-programming grader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dump contest rankings for platforms that grade from pre-processed data.
    Preprocess {
        #[arg(short, long)]
        week: u32,
    },
    /// Grade every roster user for a week into `grade_{week}.log`.
    Grade {
        #[arg(short, long)]
        week: u32,
        /// Archive an existing log and regrade.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        platform: Option<String>,
    },
    /// Aggregate a week's log into `grades_{week}.csv`.
    Points {
        #[arg(short, long)]
        week: u32,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        platform: Option<String>,
        /// Overwrite an existing points sheet.
        #[arg(long)]
        force: bool,
    },
    /// Copy a week's totals into an LMS gradebook export.
    Gradebook {
        #[arg(short, long)]
        week: u32,
        #[arg(short, long)]
        gradebook: PathBuf,
    },
}

fn init_tracing() {
    let filter = if std::env::var("DEBUG").is_ok_and(|v| v == "1") {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = GraderConfig::from_env().await.context("loading configuration")?;
    let grader = Grader::new(config).context("setting up grader")?;

    match cli.command {
        Commands::Preprocess { week } => {
            let summaries = grader.preprocess(week).await.context("pre-processing")?;
            for summary in summaries {
                let skipped = summary.contests.iter().filter(|c| c.skipped).count();
                println!(
                    "preprocess complete: platform={} week={} contests={} skipped={}",
                    summary.platform,
                    summary.week_num,
                    summary.contests.len(),
                    skipped
                );
            }
        }
        Commands::Grade {
            week,
            force,
            user,
            platform,
        } => {
            let options = GradeOptions { force, user, platform };
            let summary = grader.grade(week, &options).await.context("grading")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Points {
            week,
            user,
            platform,
            force,
        } => {
            let filter = PointsFilter { user, platform };
            let (path, sheet) = grader
                .points(week, &filter, force)
                .await
                .context("aggregating points")?;
            println!("points complete: rows={} sheet={}", sheet.rows.len(), path.display());
        }
        Commands::Gradebook { week, gradebook } => {
            let summary = grader
                .populate_gradebook(week, &gradebook)
                .with_context(|| format!("populating {}", gradebook.display()))?;
            info!(missing = ?summary.missing, "students without points were given 0");
            println!(
                "gradebook complete: column={:?} filled={} missing={} output={}",
                summary.week_column,
                summary.filled,
                summary.missing.len(),
                summary.output.display()
            );
        }
    }

    Ok(())
}

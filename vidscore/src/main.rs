use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use std::path::{Path, PathBuf};
use tracing::error;

use vidscore::{evaluate, QualityReport};

#[derive(Parser)]
#[command(name = "vidscore")]
#[command(version, about = "Video quality scoring - resolution, blur and motion metrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a single video
    Analyze {
        /// Input video file
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Label used in the report (defaults to the file name)
        #[arg(short, long)]
        label: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },

    /// Score two videos side by side
    Compare {
        /// First video file
        #[arg(value_name = "FIRST")]
        first: PathBuf,

        /// Second video file
        #[arg(value_name = "SECOND")]
        second: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            label,
            output,
        } => {
            let label = label.unwrap_or_else(|| display_name(&input));
            let report = evaluate(&input, &label)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Human => print_human(&report),
            }
        }

        Commands::Compare {
            first,
            second,
            output,
        } => {
            // Two independent evaluations over two independent decoders;
            // nothing is shared, so they run concurrently.
            let (a, b) = rayon::join(
                || evaluate(&first, "Video 1"),
                || evaluate(&second, "Video 2"),
            );

            let mut reports = Vec::new();
            let mut failures = 0usize;
            for (path, result) in [(&first, a), (&second, b)] {
                match result {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        failures += 1;
                        error!(path = %path.display(), error = %e, "evaluation failed");
                        eprintln!("{} {}: {}", style("✗").red().bold(), path.display(), e);
                    }
                }
            }
            match output {
                // Always an array for compare, however many slots survived.
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
                OutputFormat::Human => reports.iter().for_each(print_human),
            }

            if failures > 0 {
                anyhow::bail!("{} of 2 evaluations failed", failures);
            }
        }
    }

    Ok(())
}

fn print_human(report: &QualityReport) {
    println!();
    println!("{}", style(&report.label).bold().cyan());
    println!("  Resolution:     {}x{}", report.width, report.height);
    println!(
        "  Average blur:   {}  {}",
        format_metric(report.average_blur),
        style("(higher = blurrier)").dim()
    );
    println!(
        "  Average motion: {}",
        format_metric(report.average_motion)
    );
}

fn format_metric(value: f64) -> String {
    if value.is_nan() {
        "undefined".to_string()
    } else if value.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:.2}", value)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

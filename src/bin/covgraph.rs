//! # covgraph
//!
//! Command-line front end: build the region similarity graph, train the
//! forecaster for one region, or write a default configuration.
//!
//! ## Usage
//! ```bash
//! covgraph init-config config.json
//! covgraph graph --cases cases.csv --metadata uscounties.csv --daily daily.csv
//! covgraph train --cases cases.csv --metadata uscounties.csv --daily daily.csv \
//!     --region "New York" --checkpoint best.ckpt
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use covgraph::core::{region_index, ForecastConfig};
use covgraph::data::{
    load_dataset, parse_date, DataPaths, DateRange, FeatureSet, SplitWindows,
    WindowSet,
};
use covgraph::gnn::{RegionRollout, Trainer};
use covgraph::graph::{build_graph, AffinityMatrix};
use covgraph::Error;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(
    name = "covgraph",
    about = "Spatio-temporal graph forecaster for regional active case counts"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and print the region similarity graph
    Graph {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Train on one region and report test-split metrics
    Train {
        #[command(flatten)]
        data: DataArgs,

        /// Region (node) to forecast
        #[arg(long)]
        region: String,

        /// Where to write the best checkpoint
        #[arg(long, default_value = "best.ckpt")]
        checkpoint: PathBuf,

        /// Override the configured epoch count
        #[arg(long)]
        epochs: Option<usize>,
    },
    /// Write the default configuration as JSON
    InitConfig {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct DataArgs {
    /// Wide region x date case table
    #[arg(long)]
    cases: PathBuf,

    /// County-level metadata (population, density, lat, lng)
    #[arg(long)]
    metadata: PathBuf,

    /// Supplementary daily table (active, recovered, ...)
    #[arg(long)]
    daily: PathBuf,

    /// JSON configuration; defaults apply to missing keys
    #[arg(long)]
    config: Option<PathBuf>,

    /// First date to keep (YYYY-MM-DD)
    #[arg(long)]
    start: Option<String>,

    /// Last date to keep (YYYY-MM-DD)
    #[arg(long)]
    end: Option<String>,
}

impl DataArgs {
    fn config(&self) -> Result<ForecastConfig> {
        match &self.config {
            Some(path) => ForecastConfig::load_json(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(ForecastConfig::default()),
        }
    }

    fn paths(&self) -> DataPaths {
        DataPaths {
            metadata: self.metadata.clone(),
            cases: self.cases.clone(),
            daily: self.daily.clone(),
        }
    }

    fn range(&self) -> Result<DateRange> {
        let parse = |flag: &str, v: &Option<String>| -> Result<Option<NaiveDate>> {
            v.as_deref()
                .map(|s| parse_date(flag, s))
                .transpose()
                .map_err(Into::into)
        };
        Ok(DateRange {
            start: parse("--start", &self.start)?,
            end: parse("--end", &self.end)?,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match cli.command {
        Command::Graph { data } => run_graph(&data),
        Command::Train {
            data,
            region,
            checkpoint,
            epochs,
        } => run_train(&data, &region, &checkpoint, epochs),
        Command::InitConfig { path } => {
            ForecastConfig::default()
                .save_json(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn run_graph(data: &DataArgs) -> Result<()> {
    let config = data.config()?;
    let (dataset, report) = load_dataset(&data.paths(), &data.range()?)?;
    report.log();

    let affinity = AffinityMatrix::compute(&dataset.regions, &config.gravity)?;
    let built = build_graph(&affinity, &config.graph)?;

    println!(
        "{} regions, {} edges (threshold {}, min degree {}, peak affinity {:.4})",
        built.graph.num_nodes(),
        built.graph.num_edges(),
        config.graph.threshold,
        config.graph.min_degree,
        affinity.max_score()
    );
    for edge in built.graph.edges() {
        println!(
            "{:>24} -> {:<24} {:>12.4}",
            affinity.name(edge.src),
            affinity.name(edge.dst),
            edge.affinity
        );
    }
    for &node in &built.capped {
        println!("capped: {}", affinity.name(node));
    }
    Ok(())
}

fn run_train(data: &DataArgs, region: &str, checkpoint: &Path, epochs: Option<usize>) -> Result<()> {
    let mut config = data.config()?;
    if let Some(epochs) = epochs {
        config.train.epochs = epochs;
    }
    config.validate()?;

    let (dataset, report) = load_dataset(&data.paths(), &data.range()?)?;
    report.log();
    let node = region_index(&dataset.regions, region)
        .ok_or_else(|| Error::UnknownRegion(region.to_string()))?;

    let affinity = AffinityMatrix::compute(&dataset.regions, &config.gravity)?;
    let built = build_graph(&affinity, &config.graph)?;

    let features = FeatureSet::build(&dataset, &config.train.feature_channels)?;
    let splits = SplitWindows::build(&features, &dataset.active, &config.window)?;
    let normalizer = features.infected_normalizer();
    let rollout = |split: &str, windows: &WindowSet| {
        RegionRollout::from_windows(split, windows, &dataset.regions, node, normalizer)
    };

    let train = rollout("train", &splits.train)?;
    let valid = match rollout("validation", &splits.validation) {
        Ok(r) => vec![r],
        Err(err @ Error::InsufficientHistory { .. }) => {
            warn!(error = %err, "Training without validation");
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    let mut trainer = Trainer::new(config, built.graph)?;
    let history = trainer.fit(&[train], &valid, Some(checkpoint))?;
    info!(epochs = history.len(), "Training finished");

    if !trainer.restore_best(&history, checkpoint)? {
        warn!("No clean epoch improved the score; forecasting with final parameters");
    }

    match rollout("test", &splits.test) {
        Ok(test) => {
            let forecast = trainer.forecast(&test)?;
            println!(
                "{}: test loss {:.4}, RMSE {:.4}, direct MAE {:.4}, physics MAE {:.4}",
                forecast.region,
                forecast.metrics.loss,
                forecast.metrics.rmse,
                forecast.metrics.direct_mae,
                forecast.metrics.physics_mae
            );
            if let (Some(first), Some(rate)) = (forecast.direct.first(), forecast.rates.scaled.first()) {
                println!("first window forecast: {:?} (rate {:.4})", first, rate);
            }
        }
        Err(err @ Error::InsufficientHistory { .. }) => {
            warn!(error = %err, "No test windows to evaluate");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

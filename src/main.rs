use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use lineage_growth::dataset::{simulate, SimulateConfig, SubsetQuery};
use lineage_growth::io;
use lineage_growth::stats::log_stats;
use lineage_growth::{fit_bootstrap, fit_svi, BootstrapConfig, FitConfig, InitData};

#[derive(Parser)]
#[command(
    name = "lineage-growth",
    version,
    about = "Estimate relative growth rates of viral lineages from surveillance counts"
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the growth model by stochastic variational inference
    Fit(FitArgs),
    /// Bootstrap uncertainty by refitting over resampled places
    Bootstrap(BootstrapArgs),
    /// Generate a synthetic dataset for smoke tests and demos
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug, Clone)]
struct SubsetArgs {
    /// Keep locations whose name contains any of these substrings
    #[arg(long, value_delimiter = ',')]
    locations: Option<Vec<String>>,

    /// Keep at most this many strains, by descending total count
    #[arg(long)]
    max_strains: Option<usize>,
}

impl SubsetArgs {
    fn query(&self) -> Option<SubsetQuery> {
        if self.locations.is_none() && self.max_strains.is_none() {
            return None;
        }
        Some(SubsetQuery {
            location_queries: self.locations.clone(),
            max_strains: self.max_strains,
        })
    }
}

#[derive(Parser, Debug, Clone)]
struct FitArgs {
    /// Dataset JSON file
    #[arg(long, short)]
    data: Box<str>,

    /// Output JSON file for the fit summary
    #[arg(long, short)]
    output: Option<Box<str>>,

    /// Model variant toggles, e.g. "reparam-biased"
    #[arg(long, default_value = "")]
    model_type: Box<str>,

    /// Guide family: map, normal, full, or composite
    #[arg(long, default_value = "")]
    guide_type: Box<str>,

    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    /// Total learning-rate decay over the whole run
    #[arg(long, default_value_t = 0.1)]
    learning_rate_decay: f64,

    #[arg(long, default_value_t = 3001)]
    num_steps: usize,

    /// Posterior samples for the moment summaries
    #[arg(long, default_value_t = 1000)]
    num_samples: usize,

    #[arg(long, default_value_t = 10.0)]
    clip_norm: f64,

    /// Rank of the full low-rank guide
    #[arg(long, default_value_t = 10)]
    rank: usize,

    #[arg(long, default_value_t = 50)]
    log_every: usize,

    #[arg(long, default_value_t = 20210319)]
    seed: u64,

    /// Abort when the loss trace starts climbing
    #[arg(long)]
    check_loss: bool,

    /// Seed the guide from a preliminary MAP fit
    #[arg(long)]
    warm_start: bool,

    #[command(flatten)]
    subset: SubsetArgs,

    #[arg(long)]
    verbose: bool,
}

impl FitArgs {
    fn config(&self) -> FitConfig {
        FitConfig {
            model_type: self.model_type.to_string(),
            guide_type: self.guide_type.to_string(),
            init_data: if self.warm_start {
                InitData::WarmStart(String::new())
            } else {
                InitData::Empirical
            },
            learning_rate: self.learning_rate,
            learning_rate_decay: self.learning_rate_decay,
            num_steps: self.num_steps,
            num_samples: self.num_samples,
            clip_norm: self.clip_norm,
            rank: self.rank,
            log_every: self.log_every,
            seed: self.seed,
            check_loss: self.check_loss,
            ..FitConfig::default()
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct BootstrapArgs {
    /// Dataset JSON file
    #[arg(long, short)]
    data: Box<str>,

    /// Output JSON file for the bootstrap summary
    #[arg(long, short)]
    output: Option<Box<str>>,

    /// Model variant toggles, e.g. "reparam-biased"
    #[arg(long, default_value = "")]
    model_type: Box<str>,

    /// Guide family for each replicate fit
    #[arg(long, default_value = "map")]
    guide_type: Box<str>,

    #[arg(long, default_value_t = 0.05)]
    learning_rate: f64,

    #[arg(long, default_value_t = 0.1)]
    learning_rate_decay: f64,

    #[arg(long, default_value_t = 3001)]
    num_steps: usize,

    #[arg(long, default_value_t = 10.0)]
    clip_norm: f64,

    #[arg(long, default_value_t = 10)]
    rank: usize,

    /// Number of bootstrap replicates
    #[arg(long, default_value_t = 100)]
    num_samples: usize,

    #[arg(long, default_value_t = 20210319)]
    seed: u64,

    #[command(flatten)]
    subset: SubsetArgs,

    #[arg(long)]
    verbose: bool,
}

impl BootstrapArgs {
    fn config(&self) -> BootstrapConfig {
        BootstrapConfig {
            model_type: self.model_type.to_string(),
            guide_type: self.guide_type.to_string(),
            learning_rate: self.learning_rate,
            learning_rate_decay: self.learning_rate_decay,
            num_steps: self.num_steps,
            clip_norm: self.clip_norm,
            rank: self.rank,
            num_samples: self.num_samples,
            seed: self.seed,
            ..BootstrapConfig::default()
        }
    }
}

#[derive(Parser, Debug, Clone)]
struct SimulateArgs {
    /// Output dataset JSON file
    #[arg(long, short)]
    output: Box<str>,

    #[arg(long, default_value_t = 12)]
    num_times: usize,

    #[arg(long, default_value_t = 3)]
    num_places: usize,

    #[arg(long, default_value_t = 4)]
    num_strains: usize,

    #[arg(long, default_value_t = 3)]
    num_features: usize,

    /// Multinomial total per (time, place) bin
    #[arg(long, default_value_t = 500)]
    counts_per_bin: usize,

    #[arg(long, default_value_t = 20210319)]
    seed: u64,

    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_dataset(
    path: &str,
    subset: &SubsetArgs,
) -> anyhow::Result<lineage_growth::Dataset> {
    let dataset = io::read_dataset(&PathBuf::from(path))?;
    match subset.query() {
        Some(query) => Ok(dataset.subset(&query)?),
        None => Ok(dataset),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Fit(args) => {
            init_logging(args.verbose);
            let dataset = load_dataset(&args.data, &args.subset)?;
            let fit = fit_svi(&dataset, &args.config()).context("SVI fit failed")?;
            log_stats(&dataset, &fit)?;
            if let Some(out) = &args.output {
                io::write_fit_result(&PathBuf::from(out.as_ref()), &fit)?;
            }
            Ok(())
        }
        Commands::Bootstrap(args) => {
            init_logging(args.verbose);
            let dataset = load_dataset(&args.data, &args.subset)?;
            let boot =
                fit_bootstrap(&dataset, &args.config()).context("bootstrap failed")?;
            if let Some(out) = &args.output {
                io::write_bootstrap_result(&PathBuf::from(out.as_ref()), &boot)?;
            }
            Ok(())
        }
        Commands::Simulate(args) => {
            init_logging(args.verbose);
            let mut rng = StdRng::seed_from_u64(args.seed);
            let config = SimulateConfig {
                num_times: args.num_times,
                num_places: args.num_places,
                num_strains: args.num_strains,
                num_features: args.num_features,
                counts_per_bin: args.counts_per_bin,
                rate_coef: None,
                features: None,
            };
            let dataset = simulate(&config, &mut rng)?;
            io::write_dataset(&PathBuf::from(args.output.as_ref()), &dataset)?;
            Ok(())
        }
    }
}

use clap::Parser;
use hsgini::error::{Error, Result};
use hsgini::sampler::nuts::NutsConfig;
use hsgini::sampler::observations::{read_observations_csv, ExpressionData, ObservationColumns};
use hsgini::sampler::{sample_posterior, ModelPriors, SamplerConfig};
use log::{info, warn, LevelFilter};
use rayon::current_num_threads;

#[derive(Parser, Debug)]
#[command(name = "hsgini")]
#[command(about = "Fit a regularized horseshoe model of condition effects on gene expression.")]
struct Args {
    // Long-form expression table (CSV or CSV.gz)
    observations: String,

    #[arg(long, default_value = "hsgini-draws.parquet")]
    output_draws: String,

    #[arg(long, default_value = "Name")]
    gene_name_column: String,

    #[arg(long, default_value = "Locus_tag")]
    locus_tag_column: String,

    #[arg(long, default_value = "headon")]
    orientation_column: String,

    #[arg(long, default_value = "condition")]
    condition_column: String,

    #[arg(long, default_value = "replicate")]
    replicate_column: String,

    #[arg(long, default_value = "log2signal")]
    value_column: String,

    #[arg(long, default_value = "gene_lookup")]
    gene_column: String,

    #[arg(long, default_value = "condition_lookup")]
    condition_index_column: String,

    /// Ignore index columns and number genes and conditions by first appearance
    #[arg(long, default_value_t = false)]
    assign_indices: bool,

    #[arg(long, default_value_t = 10.0)]
    alpha_mean: f64,

    #[arg(long, default_value_t = 10.0)]
    alpha_scale: f64,

    #[arg(long, default_value_t = 1.0)]
    slab_df: f64,

    #[arg(long, default_value_t = 1.0)]
    slab_scale: f64,

    /// Prior guess at the number of conditions strongly affecting each gene
    #[arg(long, default_value_t = 5.0)]
    expected_large_effects: f64,

    #[arg(long, default_value_t = 1.0)]
    sigma_rate: f64,

    #[arg(long, default_value_t = 1000)]
    warmup: usize,

    #[arg(long, default_value_t = 500)]
    draws: usize,

    #[arg(long, default_value_t = 1)]
    chains: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value_t = 10)]
    max_treedepth: usize,

    #[arg(long, default_value_t = 0.8)]
    target_accept: f64,

    /// Keep beta_tilde, lambda, tau_tilde and c2_tilde in the saved draws
    #[arg(long, default_value_t = false)]
    keep_auxiliary: bool,

    #[arg(long, default_value_t = false)]
    no_progress: bool,

    #[arg(short, long, default_value = None)]
    nthreads: Option<usize>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .format_timestamp(None)
        .init();

    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    }
    info!("Using {} threads", current_num_threads());

    let columns = ObservationColumns {
        gene_name: args.gene_name_column,
        locus_tag: args.locus_tag_column,
        orientation: args.orientation_column,
        condition: args.condition_column,
        replicate: args.replicate_column,
        value: args.value_column,
        gene_index: args.gene_column,
        condition_index: args.condition_index_column,
    };
    let records = read_observations_csv(&args.observations, &columns, args.assign_indices)?;
    let data = ExpressionData::from_records(&records)?;
    info!(
        "{} genes across {} conditions",
        data.ngenes(),
        data.nconditions()
    );

    let priors = ModelPriors {
        μ_α: args.alpha_mean,
        σ_α: args.alpha_scale,
        slab_df: args.slab_df,
        slab_scale: args.slab_scale,
        expected_large_effects: args.expected_large_effects,
        λ_σ: args.sigma_rate,
    };
    let config = SamplerConfig {
        nwarmup: args.warmup,
        ndraws: args.draws,
        nchains: args.chains,
        seed: args.seed,
        nuts: NutsConfig {
            max_treedepth: args.max_treedepth,
            target_accept: args.target_accept,
            ..NutsConfig::default()
        },
        keep_auxiliary: args.keep_auxiliary,
        show_progress: !args.no_progress,
    };

    let fit = sample_posterior(&data, priors, &config)?;
    if fit.diagnostics.total_divergences() > 0 {
        warn!("Inspect divergent transitions before trusting downstream summaries");
    }
    fit.draws.write_parquet(&args.output_draws)?;

    Ok(())
}

use clap::Parser;
use hsgini::analysis::baseline::resolve_baseline;
use hsgini::analysis::Analysis;
use hsgini::error::{Error, Result};
use hsgini::genes::label_cds_orientation;
use hsgini::output::{write_gene_info, write_gene_trends, write_gini, write_gini_draws, write_intercepts};
use hsgini::posterior::{PosteriorDraws, B_CONDITION};
use hsgini::sampler::observations::{
    read_cds_csv, read_observations_csv, ExpressionData, ObservationColumns,
};
use hsgini::schemas::OutputFormat;
use log::{info, warn, LevelFilter};

#[derive(Parser, Debug)]
#[command(name = "hsgini-analyze")]
#[command(about = "Summarize condition effects and Gini coefficients from posterior draws.")]
struct Args {
    // Draws written by `hsgini`
    draws: String,

    // The observation table the draws were fit to, for gene and condition names
    observations: String,

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

    #[arg(long, default_value_t = false)]
    assign_indices: bool,

    /// Baseline condition by name
    #[arg(long, default_value = "LBexp")]
    baseline: String,

    /// Baseline condition by index, overriding --baseline
    #[arg(long, default_value = None)]
    baseline_index: Option<usize>,

    /// Probability mass of the highest posterior density intervals
    #[arg(long, default_value_t = 0.9)]
    prob: f64,

    /// CDS annotation (locus_tag, gene, start, end, strand) used to relabel
    /// gene orientation
    #[arg(long, default_value = None)]
    cds_csv: Option<String>,

    /// Gene whose end marks the replication terminus
    #[arg(long, default_value = "rtp")]
    terminus_gene: String,

    #[arg(long, default_value = "hsgini-gene-trends.csv.gz")]
    output_gene_trends: String,

    #[arg(long, default_value = "hsgini-gini.csv.gz")]
    output_gini: String,

    #[arg(long, default_value = "hsgini-intercepts.csv.gz")]
    output_intercepts: String,

    #[arg(long, default_value = None)]
    output_gini_draws: Option<String>,

    #[arg(long, default_value = None)]
    output_gene_info: Option<String>,

    /// Save the draws again with new_alpha and new_beta added
    #[arg(long, default_value = None)]
    output_reparameterized_draws: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    output_fmt: OutputFormat,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .format_timestamp(None)
        .init();

    let draws = PosteriorDraws::read_parquet(&args.draws)?;
    info!(
        "Read {} draws from {} chain(s) in {}",
        draws.ndraws(),
        draws.nchains(),
        args.draws
    );

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
    let mut data = ExpressionData::from_records(&records)?;

    let b = draws.get3(B_CONDITION)?;
    let expected = [draws.ndraws(), data.ngenes(), data.nconditions()];
    if b.shape() != expected.as_slice() {
        return Err(Error::ShapeMismatch {
            context: "b_condition against observations".to_string(),
            expected: expected.to_vec(),
            got: b.shape().to_vec(),
        });
    }

    if let Some(cds_csv) = &args.cds_csv {
        let cds = read_cds_csv(cds_csv)?;
        let labels = label_cds_orientation(&cds, &args.terminus_gene)?;
        let matched = data.genes.relabel_orientation(&cds, &labels);
        if matched < data.ngenes() {
            warn!(
                "{} of {} genes have no CDS record and keep their input orientation",
                data.ngenes() - matched,
                data.ngenes()
            );
        }
    }

    let baseline = resolve_baseline(&data.conditions, Some(args.baseline.as_str()), args.baseline_index)?;
    info!("Baseline condition: {}", data.conditions.name(baseline));

    let analysis = Analysis::run(&draws, baseline, args.prob)?;

    write_gene_trends(
        &args.output_gene_trends,
        args.output_fmt,
        &analysis.effects,
        &data.genes,
        &data.conditions,
    )?;
    write_gini(&args.output_gini, args.output_fmt, &analysis.gini_summary, &data.genes)?;
    write_intercepts(&args.output_intercepts, args.output_fmt, &analysis.intercepts, &data.genes)?;

    if let Some(output_gini_draws) = &args.output_gini_draws {
        write_gini_draws(output_gini_draws, args.output_fmt, analysis.gini.view(), draws.chain())?;
    }

    if let Some(output_gene_info) = &args.output_gene_info {
        write_gene_info(output_gene_info, args.output_fmt, &data.genes)?;
    }

    if let Some(output_draws) = &args.output_reparameterized_draws {
        analysis.with_reparameterized(&draws)?.write_parquet(output_draws)?;
    }

    Ok(())
}

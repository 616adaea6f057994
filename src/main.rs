use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use tree_likelihood::engine::counting::CountingEngine;
use tree_likelihood::io::{read_alignment, read_trees, write_results_tsv};
use tree_likelihood::{
    EncodedAlignment, ErrorKind, LikelihoodError, Orchestrator, RunConfig, SubstitutionModel,
    TreeOutcome, UnknownCharPolicy,
};

/// Compute the log-likelihood of every tree in a Newick file given a
/// nucleotide alignment, under the Jukes-Cantor model.
#[derive(Parser, Debug)]
#[command(name = "tree-lk", version, about = "Log-likelihoods of trees given an alignment")]
struct Args {
    /// Input tree file, one or more `;`-terminated Newick trees (`-` for stdin)
    #[arg(short = 't', long = "tree", default_value = "-")]
    tree: PathBuf,

    /// FASTA alignment file
    #[arg(short = 'a', long = "align")]
    align: PathBuf,

    /// Number of trees evaluated in parallel
    #[arg(short = 'p', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Write a `tree<TAB>log_likelihood` table here instead of printing (gzip if ending in .gz)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// How to encode characters other than A, C, G, T and `-`
    #[arg(long = "unknown-chars", value_enum, default_value_t = UnknownCharPolicy::Adenine)]
    unknown_chars: UnknownCharPolicy,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);

    let config = RunConfig {
        workers: args.threads,
        unknown_chars: args.unknown_chars,
    };

    let t0 = Instant::now();
    let alignment = match load_alignment(&args, &config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Failed to load alignment {:?}: {e}", args.align);
            std::process::exit(exit_code(&e));
        }
    };
    tracing::info!(
        sequences = alignment.sequence_count(),
        patterns = alignment.pattern_count(),
        "Reading in alignment {:.3}s",
        t0.elapsed().as_secs_f64()
    );

    let trees = match read_trees(&args.tree) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Failed to read trees {:?}: {e}", args.tree);
            std::process::exit(2);
        }
    };

    #[cfg(feature = "beagle")]
    let engine = CountingEngine::new(tree_likelihood::engine::beagle::BeagleEngine::default());
    #[cfg(not(feature = "beagle"))]
    let engine = CountingEngine::new(tree_likelihood::CpuEngine);

    let model = SubstitutionModel::jukes_cantor();
    let orchestrator = Orchestrator::new(&alignment, &model, &engine, config.effective_workers());
    if orchestrator.workers() != args.threads {
        tracing::info!(requested = args.threads, "using {} worker(s)", orchestrator.workers());
    }

    let mut collected: Vec<TreeOutcome> = Vec::new();
    let to_file = args.output.is_some();
    let run = orchestrator.evaluate_with(trees, |outcome| {
        if to_file {
            collected.push(outcome);
        } else {
            print_outcome(&outcome);
        }
    });

    if let Err(e) = run {
        eprintln!("Evaluation aborted: {e}");
        std::process::exit(exit_code(&e));
    }
    log_engine_stats(&engine);

    if let Some(output) = &args.output {
        collected.sort_by_key(|o| o.index);
        let t1 = Instant::now();
        if let Err(e) = write_results_tsv(output, &collected) {
            eprintln!("Failed to write output {output:?}: {e}");
            std::process::exit(4);
        }
        tracing::info!("Writing to output {:.3}s", t1.elapsed().as_secs_f64());
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_alignment(args: &Args, config: &RunConfig) -> tree_likelihood::Result<EncodedAlignment> {
    read_alignment(&args.align)?
        .compress()
        .encode(config.unknown_chars)
}

fn print_outcome(outcome: &TreeOutcome) {
    match &outcome.result {
        Ok(lnl) => println!("Tree {}: lk={}", outcome.index, lnl),
        Err(e) => println!("Tree {}: error: {}", outcome.index, e),
    }
}

fn log_engine_stats<E>(engine: &CountingEngine<E>) {
    let stats = engine.stats();
    if stats.live() > 0 {
        tracing::warn!(live = stats.live(), "engine instances not released");
    }
    tracing::debug!(
        created = stats.created,
        failed = stats.failed,
        finalized = stats.finalized,
        "engine instances"
    );
}

fn exit_code(e: &LikelihoodError) -> i32 {
    match e.kind() {
        ErrorKind::Configuration => 3,
        _ => 2,
    }
}

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use sprig::engine::run_inference;
use sprig::io::diff::{read_diff_file, write_diff};
use sprig::io::seqfile::{build_alignment, read_reference, read_sequences};
use sprig::io::SeqType;
use sprig::model::ModelKind;
use sprig::params::Params;
use sprig::progress;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum InputFormat {
    /// FASTA or PHYLIP alignment (sniffed from the first byte).
    Alignment,
    /// Compact reference + per-taxon differences.
    Diff,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Model {
    Jc,
    Gtr,
    Unrest,
}

impl Model {
    fn kind(self) -> ModelKind {
        match self {
            Model::Jc => ModelKind::Jc,
            Model::Gtr => ModelKind::Gtr,
            Model::Unrest => ModelKind::Unrest,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sprig")]
#[command(about = "Likelihood-based phylogenetic placement for closely related genomes", long_about = None)]
struct Cli {
    /// Input alignment or diff file (optionally .gz).
    input_file: PathBuf,
    /// Output tree (Newick).
    #[arg(long, default_value = "tree.nwk")]
    out_tree: PathBuf,
    /// Output for the converged substitution model (JSON).
    #[arg(long)]
    out_model: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = InputFormat::Diff)]
    input_format: InputFormat,
    /// Reference FASTA overriding the one embedded in the input.
    #[arg(long)]
    r#ref: Option<PathBuf>,
    /// dna, protein or binary; detected from the input when omitted.
    #[arg(long)]
    seq_type: Option<String>,
    #[arg(long, value_enum, default_value_t = Model::Unrest)]
    model: Model,
    /// Collapse zero-length internal edges in the output tree.
    #[arg(long)]
    multifurcating: bool,
    /// Convert the input alignment to a diff file and exit.
    #[arg(long)]
    extract_diff: Option<PathBuf>,
    #[arg(long, default_value_t = 1000.0)]
    hamming_weight: f64,
    #[arg(long, default_value_t = 1e-8)]
    threshold_prob: f64,
    #[arg(long, default_value_t = 25)]
    mutation_update_period: u32,
    #[arg(long, default_value_t = 5)]
    max_rounds: u32,
    #[arg(long)]
    no_progress: bool,
}

fn run(cli: &Cli) -> Result<()> {
    let seq_type = cli
        .seq_type
        .as_deref()
        .map(SeqType::parse)
        .transpose()?;
    let ref_override = cli
        .r#ref
        .as_deref()
        .map(|p| read_reference(p, seq_type))
        .transpose()?;
    let seq_type = seq_type.or(ref_override.as_ref().map(|(t, _)| *t));
    let ref_states = ref_override.as_ref().map(|(_, states)| states.as_slice());

    let aln = match cli.input_format {
        InputFormat::Diff => read_diff_file(&cli.input_file, seq_type, ref_states)?,
        InputFormat::Alignment => {
            let sequences = read_sequences(&cli.input_file)?;
            if cli.no_progress {
                build_alignment(&sequences, seq_type, ref_states)?
            } else {
                let pb = progress::spinner("IO", "compressing alignment");
                let aln = build_alignment(&sequences, seq_type, ref_states)?;
                pb.finish_with_message("alignment compressed");
                aln
            }
        }
    };

    if let Some(diff_path) = &cli.extract_diff {
        fs::write(diff_path, write_diff(&aln))
            .with_context(|| format!("failed to write {:?}", diff_path))?;
        println!(
            "wrote {} taxa against a {}-site reference to {:?}",
            aln.taxa.len(),
            aln.genome_length(),
            diff_path
        );
        return Ok(());
    }
    if aln.taxa.len() < 2 {
        bail!("inference needs at least 2 taxa");
    }

    let mut params = Params::default();
    params.hamming_weight = cli.hamming_weight;
    params.threshold_prob = cli.threshold_prob;
    params.mutation_update_period = cli.mutation_update_period;
    params.max_improvement_rounds = cli.max_rounds;
    params.progress = !cli.no_progress;

    let result = run_inference(&aln, cli.model.kind(), &params, cli.multifurcating)?;

    fs::write(&cli.out_tree, format!("{}\n", result.newick))
        .with_context(|| format!("failed to write {:?}", cli.out_tree))?;
    if let Some(model_path) = &cli.out_model {
        let file = fs::File::create(model_path)
            .with_context(|| format!("failed to create {:?}", model_path))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &result.model)
            .with_context(|| format!("failed to write {:?}", model_path))?;
    }
    println!(
        "placed {} taxa ({} as duplicates), log-likelihood {:.4}",
        result.n_placed, result.n_minor, result.log_likelihood
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

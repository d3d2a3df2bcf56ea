use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use comfy_table::Table;
use reward_model_rs::data::{DataSourceConfig, PreferenceSource, Split};
use reward_model_rs::device::{select_device, DeviceChoice};
use reward_model_rs::evaluator::{EvalConfig, EvalReport, Evaluator, DEFAULT_EVAL_BATCH_SIZE};
use reward_model_rs::loss::LossKind;
use reward_model_rs::model::Pooling;
use reward_model_rs::tokenizer::{load_tokenizer, TIKTOKEN_GPT2};
use reward_model_rs::trainer::{StopSignal, TrainConfig, TrainSummary, Trainer};
use reward_model_rs::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "reward-model-rs")]
#[command(about = "Train and evaluate a pairwise preference reward model.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train a reward model on preference pairs
    Train(TrainArgs),
    /// Report pairwise accuracy of a checkpoint
    Eval(EvalArgs),
    /// Train a tiny model, then evaluate it on `train[:8]` and `test[:8]`
    Demo(DemoArgs),
}

#[derive(Debug, Args)]
struct DataArgs {
    /// Preference corpus: a file, a directory of `{split}.jsonl|json|parquet`,
    /// `hf://owner/name`, or `fallback`
    #[arg(long, default_value = "fallback")]
    data: String,
    /// Fail instead of using the built-in corpus when `--data` is unavailable
    #[arg(long)]
    no_fallback: bool,
}

impl DataArgs {
    fn source(&self) -> anyhow::Result<PreferenceSource> {
        let config: DataSourceConfig = self.data.parse()?;
        Ok(PreferenceSource::new(&config, !self.no_fallback)?)
    }
}

#[derive(Debug, Args)]
struct TrainArgs {
    #[arg(long, default_value_t = 300)]
    steps: usize,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    #[arg(long, default_value_t = 256)]
    block_size: usize,
    #[arg(long, default_value_t = 2)]
    n_layer: usize,
    #[arg(long, default_value_t = 2)]
    n_head: usize,
    #[arg(long, default_value_t = 128)]
    n_embd: usize,
    #[arg(long, default_value_t = 0.1)]
    drop_rate: f32,
    /// `bt` (Bradley-Terry) or `margin`
    #[arg(long, default_value = "bt", value_parser = parse_loss)]
    loss: LossKind,
    #[arg(long, default_value_t = 1.0)]
    margin: f32,
    /// `mean` or `last`
    #[arg(long, default_value = "mean", value_parser = parse_pooling)]
    pooling: Pooling,
    /// Tokenizer directory, or `tiktoken:gpt2`
    #[arg(long, alias = "bpe-dir", default_value = TIKTOKEN_GPT2)]
    tokenizer_dir: String,
    #[arg(long, default_value_t = 100)]
    checkpoint_every: usize,
    #[arg(long, default_value_t = 0.0004)]
    lr: f64,
    #[arg(long, default_value_t = 0.1)]
    weight_decay: f64,
    /// Max global gradient norm; `0` disables clipping
    #[arg(long, default_value_t = 1.0)]
    grad_clip: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value = "runs/rm-demo")]
    out_dir: PathBuf,
    #[arg(long, default_value = "train")]
    split: String,
    #[arg(long)]
    limit: Option<usize>,
    /// Continue from this checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    cpu: bool,
    #[command(flatten)]
    data: DataArgs,
}

impl TrainArgs {
    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            steps: self.steps,
            batch_size: self.batch_size,
            block_size: self.block_size,
            n_layer: self.n_layer,
            n_head: self.n_head,
            n_embd: self.n_embd,
            drop_rate: self.drop_rate,
            pooling: self.pooling,
            loss: self.loss,
            margin: self.margin,
            lr: self.lr,
            weight_decay: self.weight_decay,
            grad_clip: (self.grad_clip > 0.).then_some(self.grad_clip),
            checkpoint_every: self.checkpoint_every,
            seed: self.seed,
            out_dir: self.out_dir.clone(),
            split: self.split.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Args)]
struct EvalArgs {
    #[arg(long, default_value = "runs/rm-demo/model_last.safetensors")]
    checkpoint: PathBuf,
    /// Split expression, e.g. `test` or `test[:8]`
    #[arg(long, default_value = "test")]
    split: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long, alias = "bpe-dir", default_value = TIKTOKEN_GPT2)]
    tokenizer_dir: String,
    #[arg(long, default_value_t = DEFAULT_EVAL_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long)]
    cpu: bool,
    #[command(flatten)]
    data: DataArgs,
}

impl EvalArgs {
    fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            checkpoint: self.checkpoint.clone(),
            split: self.split.clone(),
            limit: self.limit,
            batch_size: self.batch_size,
        }
    }
}

#[derive(Debug, Args)]
struct DemoArgs {
    #[arg(long, default_value_t = 300)]
    steps: usize,
    #[arg(long, alias = "bpe-dir", default_value = TIKTOKEN_GPT2)]
    tokenizer_dir: String,
    #[arg(long, default_value = "runs/rm-demo")]
    out_dir: PathBuf,
    #[arg(long)]
    cpu: bool,
    #[command(flatten)]
    data: DataArgs,
}

fn parse_loss(s: &str) -> Result<LossKind, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn parse_pooling(s: &str) -> Result<Pooling, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

fn device_choice(cpu: bool) -> DeviceChoice {
    if cpu {
        DeviceChoice::Cpu
    } else {
        DeviceChoice::CudaIfAvailable
    }
}

/// Raises the returned signal on Ctrl-C.
fn install_stop_handler() -> anyhow::Result<StopSignal> {
    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping after the current step");
        handler_stop.stop();
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(stop)
}

fn train(
    config: TrainConfig,
    tokenizer_dir: &str,
    resume: Option<&PathBuf>,
    source: &PreferenceSource,
    cpu: bool,
    stop: &StopSignal,
) -> anyhow::Result<TrainSummary> {
    let device = select_device(device_choice(cpu))?;
    let tokenizer = load_tokenizer(tokenizer_dir)?;
    let mut trainer = match resume {
        Some(path) => Trainer::resume(path, config, tokenizer, source, &device)?,
        None => Trainer::new(config, tokenizer, source, &device)?,
    };
    let summary = trainer.run(stop)?;
    Ok(summary)
}

fn evaluate(
    config: &EvalConfig,
    tokenizer_dir: &str,
    source: &PreferenceSource,
    cpu: bool,
) -> anyhow::Result<EvalReport> {
    let device = select_device(device_choice(cpu))?;
    let tokenizer = load_tokenizer(tokenizer_dir)?;
    let split: Split = config.split.parse()?;
    let report = Evaluator::from_checkpoint(&config.checkpoint, tokenizer, &device)?
        .batch_size(config.batch_size)
        .evaluate(source, &split, config.limit)?;
    Ok(report)
}

fn summary_table(summary: &TrainSummary) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["steps", "final loss", "stopped early", "checkpoint"]);
    table.add_row(vec![
        summary.steps_completed.to_string(),
        summary
            .final_loss
            .map(|l| format!("{l:.4}"))
            .unwrap_or_else(|| "-".to_string()),
        summary.stopped_early.to_string(),
        summary.checkpoint.display().to_string(),
    ]);
    table
}

fn report_table(rows: &[(String, EvalReport)]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["split", "pairs", "accuracy", "mean margin"]);
    for (split, report) in rows {
        table.add_row(vec![
            split.clone(),
            report.n.to_string(),
            format!("{:.3}", report.accuracy),
            format!("{:.4}", report.mean_margin),
        ]);
    }
    table
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Train(args) => {
            let source = args.data.source()?;
            let stop = install_stop_handler()?;
            let summary = train(
                args.train_config(),
                &args.tokenizer_dir,
                args.resume.as_ref(),
                &source,
                args.cpu,
                &stop,
            )?;
            println!("{}", summary_table(&summary));
        }
        Commands::Eval(args) => {
            let source = args.data.source()?;
            let config = args.eval_config();
            let report = evaluate(&config, &args.tokenizer_dir, &source, args.cpu)?;
            println!("{}", report_table(&[(config.split, report)]));
        }
        Commands::Demo(args) => {
            let source = args.data.source()?;
            let stop = install_stop_handler()?;
            let config = TrainConfig {
                steps: args.steps,
                out_dir: args.out_dir.clone(),
                ..Default::default()
            };
            info!(
                steps = config.steps,
                out_dir = %config.out_dir.display(),
                "Running reward model demo"
            );
            let summary = train(config, &args.tokenizer_dir, None, &source, args.cpu, &stop)?;
            println!("{}", summary_table(&summary));

            let mut rows = vec![];
            for split in ["train[:8]", "test[:8]"] {
                let config = EvalConfig {
                    checkpoint: summary.checkpoint.clone(),
                    split: split.to_string(),
                    ..Default::default()
                };
                let report = evaluate(&config, &args.tokenizer_dir, &source, args.cpu)?;
                rows.push((config.split, report));
            }
            println!("{}", report_table(&rows));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e
                .downcast_ref::<Error>()
                .map(Error::kind)
                .unwrap_or("Error");
            error!(kind, "{e:#}");
            eprintln!("{kind}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{bail, Context, Result};
use chatglm_ggml::{GgmlReader, GgmlRecord, GgmlType, CONFIG_VERSION};
use chatglm_ggml_models::{
    quantization_bit, tokenizer_block, AdapterRegistry, ConvertOptions, ModelAdapter,
    PAST_KEY_VALUES, PREFIX_ENCODER_WEIGHT,
};
use chatglm_ggml_writer::{
    ContainerHeader, ContainerWriter, TensorSummary, WeightProvider, WriteOptions,
};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod checkpoint;
mod lora;

use checkpoint::Checkpoint;
use lora::LoraAdapter;

const DEFAULT_OUTPUT_PATH: &str = "models/chatglm-ggml.bin";

#[derive(Parser)]
#[command(
    name = "chatglm-convert",
    author,
    version,
    about = "Convert ChatGLM checkpoints to GGML containers and inspect the result"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a safetensors checkpoint directory into a GGML container.
    Convert(ConvertArgs),
    /// Print the header and tensor records of a GGML container.
    Info(InfoArgs),
    /// Print aggregate statistics for a GGML container.
    Stats(StatsArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DTypeArg {
    #[value(name = "f32")]
    F32,
    #[value(name = "f16")]
    F16,
    #[value(name = "q8_0")]
    Q8_0,
    #[value(name = "q4_0")]
    Q4_0,
    #[value(name = "q4_1")]
    Q4_1,
    #[value(name = "q5_0")]
    Q5_0,
    #[value(name = "q5_1")]
    Q5_1,
}

impl DTypeArg {
    fn to_dtype(self) -> GgmlType {
        match self {
            Self::F32 => GgmlType::F32,
            Self::F16 => GgmlType::F16,
            Self::Q8_0 => GgmlType::Q8_0,
            Self::Q4_0 => GgmlType::Q4_0,
            Self::Q4_1 => GgmlType::Q4_1,
            Self::Q5_0 => GgmlType::Q5_0,
            Self::Q5_1 => GgmlType::Q5_1,
        }
    }
}

#[derive(Parser)]
struct ConvertArgs {
    /// Checkpoint directory holding `config.json`, the tokenizer and `*.safetensors` shards.
    #[arg(short = 'i', long = "model")]
    model: PathBuf,
    /// Output path for the generated container.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_PATH)]
    output: PathBuf,
    /// Encoding of text weights.
    #[arg(short = 't', long = "type", value_enum, default_value = "q4_0")]
    dtype: DTypeArg,
    /// Encoding of vision tower weights (GLM-4V only).
    #[arg(long, value_enum, default_value = "f16")]
    vision_type: DTypeArg,
    /// Adapter identifier to force (defaults to auto-detect).
    #[arg(long)]
    adapter: Option<String>,
    /// PEFT LoRA adapter directory merged into the base weights before conversion.
    #[arg(short = 'l', long = "lora")]
    lora: Option<PathBuf>,
    /// Maximum parallel jobs (defaults to all cores).
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Parser)]
struct InfoArgs {
    /// Path to the GGML container.
    path: PathBuf,
    /// Show every record (overrides --records).
    #[arg(long)]
    all: bool,
    /// Number of records to print when --all is not set.
    #[arg(
        short = 'n',
        long = "records",
        default_value_t = 5,
        conflicts_with = "all"
    )]
    records: usize,
}

#[derive(Parser)]
struct StatsArgs {
    /// Path to the GGML container.
    path: PathBuf,
    /// Emit JSON summary to stdout (single line).
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Convert(args) => run_convert(args),
        Commands::Info(args) => run_info(args),
        Commands::Stats(args) => run_stats(args),
    }
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let config_path = args.model.join("config.json");
    let config = load_config_value(&config_path)?;
    let registry = AdapterRegistry::global();
    let adapter = select_adapter(registry, args.adapter.as_deref(), &config, &config_path)?;
    let opts = ConvertOptions {
        text: args.dtype.to_dtype(),
        vision: args.vision_type.to_dtype(),
    };
    if !adapter.model_type().has_vision() && args.vision_type != DTypeArg::F16 {
        warn!(
            adapter = adapter.id(),
            "--vision-type is ignored for models without a vision tower"
        );
    }

    let config_block = adapter.config_block(&config, &opts).with_context(|| {
        format!(
            "failed to build config block from {} with adapter {}",
            config_path.display(),
            adapter.id()
        )
    })?;
    let tokenizer_path = args.model.join(adapter.tokenizer_file());
    let tokenizer = fs::read(&tokenizer_path)
        .with_context(|| format!("failed to read tokenizer {}", tokenizer_path.display()))?;
    let tokenizer = tokenizer_block(&tokenizer)?;
    let catalog = adapter.catalog(&config, &opts)?;

    let mut checkpoint = Checkpoint::open(&args.model)?;
    if let Some(dir) = &args.lora {
        let lora = LoraAdapter::open(dir)
            .with_context(|| format!("failed to load LoRA adapter {}", dir.display()))?;
        let merged = lora.merge(&checkpoint)?;
        info!(
            lora = %dir.display(),
            scale = lora.config.scale(),
            tensors = merged.len(),
            "merged LoRA adapter"
        );
        for (name, tensor) in merged {
            checkpoint.insert_extra(name, tensor);
        }
    }
    check_tied_weights(adapter, &checkpoint)?;
    if let Some(prefix) = adapter.prefix_cache(&config)? {
        let embedding = checkpoint
            .load(PREFIX_ENCODER_WEIGHT)?
            .with_context(|| format!("checkpoint has no `{PREFIX_ENCODER_WEIGHT}`"))?;
        let cache = prefix.build(&embedding)?;
        info!(
            pre_seq_len = prefix.pre_seq_len,
            shape = ?cache.shape(),
            "synthesized prefix cache"
        );
        checkpoint.insert_extra(PAST_KEY_VALUES, cache);
    }
    let missing: Vec<&str> = catalog
        .iter()
        .map(|entry| entry.name.as_str())
        .filter(|name| !checkpoint.contains(name))
        .collect();
    if let Some(first) = missing.first() {
        bail!(
            "checkpoint {} lacks {} catalog tensor(s), first missing: `{first}`",
            args.model.display(),
            missing.len()
        );
    }

    let output_dir = match args.output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("failed to create directory {}", output_dir.display()))?;
    info!(
        artifact = %args.output.display(),
        adapter = adapter.id(),
        model_type = %adapter.model_type(),
        dtype = %opts.text,
        vision_dtype = %opts.vision,
        tensors = catalog.len(),
        checkpoint_tensors = checkpoint.len(),
        "starting GGML conversion"
    );

    let pool = match args.jobs {
        Some(threads) if threads > 0 => Some(
            ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .context("failed to initialize rayon thread pool")?,
        ),
        _ => None,
    };
    let write_opts = WriteOptions {
        quantization_bit: quantization_bit(&config),
        chunk_size: determine_chunk_size(catalog.len(), args.jobs),
    };
    let header = ContainerHeader {
        model_type: adapter.model_type(),
        config: &config_block,
        tokenizer: &tokenizer,
    };

    let mut staged = NamedTempFile::new_in(&output_dir).with_context(|| {
        format!(
            "failed to create staging file in {}",
            output_dir.display()
        )
    })?;
    let progress = make_progress_bar(catalog.len());
    let mut stats = ConvertStats::default();
    {
        let mut writer = ContainerWriter::new(BufWriter::new(staged.as_file_mut()));
        writer.write_header(&header)?;
        let mut write = || {
            writer.write_weights(&catalog, &checkpoint, &write_opts, |summary| {
                stats.record(summary);
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
            })
        };
        let written = match &pool {
            Some(pool) => pool.install(write),
            None => write(),
        };
        written.with_context(|| format!("failed to write {}", args.output.display()))?;
        writer.finish()?;
    }
    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }
    staged
        .persist(&args.output)
        .with_context(|| format!("failed to move output into {}", args.output.display()))?;
    info!(
        artifact = %args.output.display(),
        tensors = stats.tensors,
        bytes = stats.bytes,
        adapter = adapter.id(),
        dtype_breakdown = %format_dtype_breakdown(&stats.dtype_counts),
        "GGML conversion complete"
    );
    Ok(())
}

fn select_adapter(
    registry: &AdapterRegistry,
    id: Option<&str>,
    config: &Value,
    config_path: &Path,
) -> Result<&'static dyn ModelAdapter> {
    match id {
        Some(id) => registry.get(id).with_context(|| {
            format!(
                "unknown adapter `{id}`; available adapters: {}",
                format_adapter_list(registry)
            )
        }),
        None => registry.infer_adapter(config).with_context(|| {
            format!(
                "failed to infer model adapter from config {}; pass --adapter to select explicitly (available: {})",
                config_path.display(),
                format_adapter_list(registry)
            )
        }),
    }
}

fn check_tied_weights(adapter: &dyn ModelAdapter, checkpoint: &Checkpoint) -> Result<()> {
    for &(tied, source) in adapter.tied_weights() {
        let Some(tied_tensor) = checkpoint.weight(tied)? else {
            continue;
        };
        let source_tensor = checkpoint
            .weight(source)?
            .with_context(|| format!("checkpoint has `{tied}` but no `{source}`"))?;
        if *tied_tensor != *source_tensor {
            bail!("`{tied}` differs from `{source}`; only tied output projections are supported");
        }
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    if !args.all && args.records == 0 {
        bail!("--records must be greater than zero");
    }
    let reader = GgmlReader::open(&args.path)
        .with_context(|| format!("failed to open container {}", args.path.display()))?;
    info!(
        artifact = %reader.path().display(),
        tensors = reader.records().len(),
        "opened container"
    );
    log_header(&reader);
    let total = reader.records().len();
    if total == 0 {
        info!("no tensor records found");
        return Ok(());
    }
    let limit = if args.all {
        total
    } else {
        args.records.min(total)
    };
    info!(showing = limit, total, "listing tensor records");
    for (idx, record) in reader.records().iter().take(limit).enumerate() {
        log_record(idx, record);
    }
    if !args.all && limit < total {
        let remaining = total - limit;
        warn!(
            remaining,
            "additional record(s) omitted; rerun with --all to display everything"
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct DtypeStats {
    count: usize,
    bytes: u64,
}

#[derive(Serialize)]
struct StatsSummary {
    model_type: String,
    tensor_total: usize,
    bytes_total: u64,
    tokenizer_bytes: usize,
    dtypes: BTreeMap<String, DtypeStats>,
}

fn summarize(reader: &GgmlReader) -> StatsSummary {
    let mut total: u64 = 0;
    let mut by_dtype: BTreeMap<String, DtypeStats> = BTreeMap::new();
    for rec in reader.records() {
        total = total.saturating_add(rec.len);
        let entry = by_dtype
            .entry(rec.dtype.to_string())
            .or_insert(DtypeStats { count: 0, bytes: 0 });
        entry.count += 1;
        entry.bytes = entry.bytes.saturating_add(rec.len);
    }
    StatsSummary {
        model_type: reader.model_type().to_string(),
        tensor_total: reader.records().len(),
        bytes_total: total,
        tokenizer_bytes: reader.tokenizer_bytes().len(),
        dtypes: by_dtype,
    }
}

fn run_stats(args: StatsArgs) -> Result<()> {
    let reader = GgmlReader::open(&args.path)
        .with_context(|| format!("failed to open container {}", args.path.display()))?;
    let summary = summarize(&reader);
    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        info!(
            model_type = %summary.model_type,
            tensors = summary.tensor_total,
            bytes = summary.bytes_total,
            tokenizer_bytes = summary.tokenizer_bytes,
            unique_dtypes = summary.dtypes.len(),
            "container stats"
        );
        for (dtype, st) in &summary.dtypes {
            let pct = if summary.tensor_total > 0 {
                (st.count as f64) * 100.0 / (summary.tensor_total as f64)
            } else {
                0.0
            };
            info!(
                dtype = %dtype,
                count = st.count,
                percent = format!("{pct:.2}"),
                bytes = st.bytes,
                "dtype stats"
            );
        }
    }
    Ok(())
}

fn load_config_value(path: &Path) -> Result<Value> {
    let file =
        File::open(path).with_context(|| format!("failed to open config {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse JSON {}", path.display()))
}

fn make_progress_bar(total: usize) -> Option<ProgressBar> {
    if total == 0 {
        return None;
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} Converting {pos}/{len} tensors [{elapsed_precise}]",
        )
        .unwrap()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    Some(pb)
}

fn format_adapter_list(registry: &AdapterRegistry) -> String {
    registry
        .list()
        .iter()
        .map(|adapter| (*adapter).id())
        .collect::<Vec<_>>()
        .join(", ")
}

fn determine_chunk_size(total: usize, jobs: Option<usize>) -> usize {
    if total == 0 {
        return 1;
    }
    let threads = jobs
        .filter(|&j| j > 0)
        .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
        .unwrap_or(1);
    let chunk = threads.saturating_mul(4);
    chunk.clamp(1, total)
}

#[derive(Default)]
struct ConvertStats {
    tensors: usize,
    bytes: u64,
    dtype_counts: BTreeMap<String, DTypeBreakdown>,
}

#[derive(Default)]
struct DTypeBreakdown {
    tensors: usize,
    bytes: u64,
}

impl ConvertStats {
    fn record(&mut self, summary: &TensorSummary) {
        self.tensors += 1;
        self.bytes = self.bytes.saturating_add(summary.len);
        let entry = self
            .dtype_counts
            .entry(summary.dtype.to_string())
            .or_default();
        entry.tensors += 1;
        entry.bytes = entry.bytes.saturating_add(summary.len);
    }
}

fn format_dtype_breakdown(map: &BTreeMap<String, DTypeBreakdown>) -> String {
    if map.is_empty() {
        return "none".to_string();
    }
    map.iter()
        .map(|(dtype, stats)| {
            format!(
                "{}: {} tensor(s), {} byte(s)",
                dtype, stats.tensors, stats.bytes
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn config_version(reader: &GgmlReader) -> Option<i32> {
    reader
        .config_bytes()
        .get(..4)
        .map(|bytes| i32::from_le_bytes(bytes.try_into().expect("chunk len 4")))
}

fn log_header(reader: &GgmlReader) {
    let version = config_version(reader);
    if version != Some(CONFIG_VERSION) {
        warn!(version = ?version, expected = CONFIG_VERSION, "unexpected config version");
    }
    info!(
        model_type = %reader.model_type(),
        config_version = ?version,
        config_bytes = reader.config_bytes().len(),
        tokenizer_bytes = reader.tokenizer_bytes().len(),
        "container header"
    );
}

fn log_record(idx: usize, record: &GgmlRecord) {
    info!(
        index = idx + 1,
        name = %record.name,
        shape = %format_shape(&record.shape),
        elements = record.elem_count(),
        dtype = %record.dtype,
        offset = record.offset,
        bytes = record.len,
        "tensor record"
    );
}

fn format_shape(shape: &[usize]) -> String {
    let parts: Vec<String> = shape.iter().map(|dim| dim.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

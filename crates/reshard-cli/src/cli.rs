use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use reshard::archive::ArchiveReader;
use reshard::{
    ConversionReport, ConversionRequest, ParallelConfig, ReshardError, ReshardOptions, Resharder,
    Result,
};

/// Reshard a tensor/pipeline-parallel checkpoint into a different layout.
#[derive(Parser, Debug)]
#[command(name = "reshard", version, about, long_about = None)]
pub struct Args {
    /// Source archive directory
    #[arg(long)]
    pub input: PathBuf,

    /// Archive directory to create; must not exist
    #[arg(long, required_unless_present = "inspect")]
    pub output: Option<PathBuf>,

    /// Tensor-parallel degree of the source archive
    #[arg(long, required_unless_present = "inspect")]
    pub source_tensor_parallel: Option<usize>,

    /// Tensor-parallel degree to produce
    #[arg(long, required_unless_present = "inspect")]
    pub target_tensor_parallel: Option<usize>,

    /// Pipeline-parallel degree of the source archive
    #[arg(long, default_value_t = 1)]
    pub source_pipeline_parallel: usize,

    /// Pipeline-parallel degree to produce
    #[arg(long, default_value_t = 1)]
    pub target_pipeline_parallel: usize,

    /// First target pipeline rank holding decoder layers (encoder/decoder models)
    #[arg(long)]
    pub pipeline_split_rank: Option<usize>,

    /// Split rank the source archive is expected to declare
    #[arg(long)]
    pub source_pipeline_split_rank: Option<usize>,

    /// JSON file with conversion options
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker threads (overrides the config file)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Converted parameters buffered ahead of the writer (overrides the config file)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Pad vocabulary tables to a multiple of this times the target TP degree
    #[arg(long)]
    pub vocab_divisible_by: Option<usize>,

    /// Log level, unless RUST_LOG is set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Print a summary of the input archive and exit
    #[arg(long, conflicts_with_all = ["dry_run", "report"])]
    pub inspect: bool,

    /// Convert in memory without writing the output archive
    #[arg(long)]
    pub dry_run: bool,

    /// Write the conversion report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn missing(flag: &str) -> ReshardError {
    ReshardError::InvalidConfig(format!("--{flag} is required"))
}

impl Args {
    /// Options from `--config`, with command line overrides applied.
    pub fn options(&self) -> Result<ReshardOptions> {
        let mut options = match &self.config {
            Some(path) => ReshardOptions::load(path)?,
            None => ReshardOptions::default(),
        };
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            options.queue_capacity = capacity;
        }
        if let Some(divisor) = self.vocab_divisible_by {
            options.make_vocab_size_divisible_by = divisor;
        }
        options.validate()?;
        Ok(options)
    }

    /// The conversion described by the arguments.
    pub fn request(&self) -> Result<ConversionRequest> {
        let output = self.output.clone().ok_or_else(|| missing("output"))?;
        let source_tp = self
            .source_tensor_parallel
            .ok_or_else(|| missing("source-tensor-parallel"))?;
        let target_tp = self
            .target_tensor_parallel
            .ok_or_else(|| missing("target-tensor-parallel"))?;

        Ok(ConversionRequest {
            input: self.input.clone(),
            output,
            source: ParallelConfig {
                tensor_parallel_size: source_tp,
                pipeline_parallel_size: self.source_pipeline_parallel,
                pipeline_split_rank: self.source_pipeline_split_rank,
            },
            target: ParallelConfig {
                tensor_parallel_size: target_tp,
                pipeline_parallel_size: self.target_pipeline_parallel,
                pipeline_split_rank: self.pipeline_split_rank,
            },
            options: self.options()?,
        })
    }
}

/// Process exit status for a failed run.
pub fn exit_code(err: &ReshardError) -> u8 {
    match err {
        ReshardError::ArchiveCorrupt { .. }
        | ReshardError::ShapeMismatch { .. }
        | ReshardError::ReplicaMismatch { .. } => 2,
        ReshardError::IndivisiblePartition { .. } => 3,
        ReshardError::UnknownParameterKind { .. } | ReshardError::AmbiguousParameterKind { .. } => 4,
        ReshardError::InvalidSplitRank { .. } => 5,
        ReshardError::Io { .. } | ReshardError::IoTimeout { .. } => 6,
        ReshardError::ArchiveIncompatible { .. } => 7,
        ReshardError::ArchiveBusy { .. } => 8,
        ReshardError::InvalidConfig(_)
        | ReshardError::ConfigMismatch { .. }
        | ReshardError::OutputExists { .. }
        | ReshardError::Cancelled => 1,
    }
}

/// Runs the command described by `args`.
pub fn run(args: &Args) -> Result<()> {
    if args.inspect {
        let reader = ArchiveReader::open(&args.input)?;
        let mut stdout = std::io::stdout().lock();
        return write_summary(&mut stdout, &reader)
            .map_err(|source| ReshardError::Io {
                path: "<stdout>".into(),
                source,
            });
    }

    let resharder = Resharder::new(args.request()?);
    let report = if args.dry_run {
        resharder.plan()?
    } else {
        resharder.run()?
    };
    log::info!(
        "{} parameters, {} padded, {} shards, {} bytes{}",
        report.parameters.len(),
        report.padding.len(),
        report.shards_written,
        report.bytes_written,
        if report.dry_run { " (dry run, nothing written)" } else { "" }
    );

    if let Some(path) = &args.report {
        save_report(path, &report)?;
    }
    Ok(())
}

fn save_report(path: &Path, report: &ConversionReport) -> Result<()> {
    let io_err = |source: std::io::Error| ReshardError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    serde_json::to_writer_pretty(&mut writer, report).map_err(|err| io_err(err.into()))?;
    writer.flush().map_err(io_err)
}

/// Human-readable description of an archive.
pub fn write_summary<W: Write>(out: &mut W, reader: &ArchiveReader) -> std::io::Result<()> {
    let manifest = reader.manifest();
    let model = &manifest.model_config;

    writeln!(out, "archive:    {}", reader.root().display())?;
    writeln!(out, "format:     v{}", manifest.format_version)?;
    writeln!(out, "layout:     {}", manifest.parallel_config)?;
    write!(
        out,
        "model:      {} layers, hidden {}, {} heads, vocab {}",
        model.num_layers, model.hidden_size, model.num_attention_heads, model.vocab_size
    )?;
    match model.num_decoder_layers {
        Some(decoder) => writeln!(out, ", {decoder} decoder layers")?,
        None => writeln!(out)?,
    }

    for shard in &manifest.shards {
        writeln!(
            out,
            "  {}  tp={} pp={}  encoder {:?} decoder {:?}  {} parameters  {} bytes",
            shard.file_name,
            shard.tensor_rank,
            shard.pipeline_rank,
            shard.layers.encoder,
            shard.layers.decoder,
            shard.parameters.len(),
            shard.byte_len
        )?;
    }
    writeln!(
        out,
        "total:      {} shards, {} bytes",
        manifest.shards.len(),
        manifest.total_bytes()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use reshard::archive::write_checkpoint;
    use reshard::sharding::Partition;
    use reshard::{Checkpoint, DType, ModelConfig, ReshardEngine, Shard, TensorData};

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("reshard").chain(args.iter().copied())).unwrap()
    }

    fn tensor(shape: Vec<usize>) -> TensorData {
        let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|v| v as f32).collect();
        TensorData::new(DType::F32, shape, bytemuck::cast_slice(&values).to_vec()).unwrap()
    }

    /// A TP=2 single-stage GPT checkpoint with two layers.
    fn write_fixture(path: &std::path::Path) {
        let engine = ReshardEngine::new(1);
        let model = ModelConfig {
            num_layers: 2,
            num_decoder_layers: None,
            hidden_size: 4,
            num_attention_heads: 2,
            vocab_size: 8,
        };
        let full = [
            ("embedding.word_embeddings.weight", Partition::VocabRow { vocab_size: 8 }, vec![8, 4]),
            ("encoder.layers.0.mlp.dense_h_to_4h.weight", Partition::Row, vec![16, 4]),
            ("encoder.layers.1.mlp.dense_4h_to_h.weight", Partition::Column, vec![4, 16]),
            ("encoder.final_layernorm.weight", Partition::Replicated, vec![4]),
        ];

        let mut shards = vec![Shard::new(0, 0), Shard::new(1, 0)];
        for (name, partition, shape) in full {
            let split = engine.split(name, partition, tensor(shape), 2).unwrap();
            for (shard, part) in shards.iter_mut().zip(split.shards) {
                shard.push(name, part);
            }
        }
        let checkpoint = Checkpoint {
            parallel_config: ParallelConfig::new(2, 1),
            model_config: model,
            shards,
        };
        write_checkpoint(&checkpoint, path).unwrap();
    }

    #[test]
    fn test_parse_conversion_flags() {
        let args = parse(&[
            "--input",
            "in",
            "--output",
            "out",
            "--source-tensor-parallel",
            "2",
            "--target-tensor-parallel",
            "1",
            "--target-pipeline-parallel",
            "4",
            "--pipeline-split-rank",
            "2",
            "--workers",
            "3",
            "--vocab-divisible-by",
            "64",
        ]);
        let request = args.request().unwrap();

        assert_eq!(request.source, ParallelConfig::new(2, 1));
        assert_eq!(request.target, ParallelConfig::new(1, 4).with_split_rank(2));
        assert_eq!(request.options.workers, 3);
        assert_eq!(request.options.make_vocab_size_divisible_by, 64);
        assert_eq!(request.options.queue_capacity, 8);
    }

    #[test]
    fn test_inspect_needs_only_input() {
        let args = parse(&["--input", "in", "--inspect"]);
        assert!(args.inspect);
        assert!(args.request().is_err());

        assert!(Args::try_parse_from(["reshard", "--input", "in"]).is_err());
        assert!(Args::try_parse_from(["reshard", "--input", "in", "--inspect", "--dry-run"]).is_err());
    }

    #[test]
    fn test_config_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.json");
        std::fs::write(&path, r#"{"workers": 2, "queue_capacity": 32}"#).unwrap();
        let args = parse(&[
            "--input",
            "in",
            "--inspect",
            "--config",
            path.to_str().unwrap(),
            "--queue-capacity",
            "4",
        ]);

        let options = args.options().unwrap();
        assert_eq!(options.workers, 2);
        assert_eq!(options.queue_capacity, 4);
        assert_eq!(options.make_vocab_size_divisible_by, 128);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let cases = [
            (ReshardError::ArchiveCorrupt { path: "a".into(), reason: String::new() }, 2),
            (
                ReshardError::IndivisiblePartition {
                    name: "w".into(),
                    shape: vec![30],
                    what: "dim 0".into(),
                    extent: 30,
                    degree: 7,
                },
                3,
            ),
            (ReshardError::UnknownParameterKind { name: "w".into() }, 4),
            (
                ReshardError::InvalidSplitRank {
                    split_rank: Some(0),
                    pipeline_parallel_size: 2,
                    reason: String::new(),
                },
                5,
            ),
            (ReshardError::IoTimeout { path: "a".into(), attempts: 3 }, 6),
            (ReshardError::ArchiveIncompatible { found: 9, supported: 1 }, 7),
            (ReshardError::ArchiveBusy { path: "a".into() }, 8),
            (ReshardError::Cancelled, 1),
        ];

        for (err, code) in cases {
            assert_eq!(exit_code(&err), code, "{err}");
        }
    }

    #[test]
    fn test_convert_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tp2");
        let output = dir.path().join("tp1-pp2");
        let report = dir.path().join("report.json");
        write_fixture(&input);

        let args = parse(&[
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--source-tensor-parallel",
            "2",
            "--target-tensor-parallel",
            "1",
            "--target-pipeline-parallel",
            "2",
            "--vocab-divisible-by",
            "1",
            "--report",
            report.to_str().unwrap(),
        ]);
        run(&args).unwrap();

        let reader = ArchiveReader::open(&output).unwrap();
        assert_eq!(reader.manifest().parallel_config, ParallelConfig::new(1, 2));
        assert_eq!(
            reader
                .read_parameter(0, 1, "encoder.layers.0.mlp.dense_4h_to_h.weight")
                .unwrap(),
            tensor(vec![4, 16])
        );

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&report).unwrap()).unwrap();
        assert_eq!(json["parameters"].as_array().unwrap().len(), 4);
        assert_eq!(json["shards_written"], 2);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tp2");
        let output = dir.path().join("out");
        write_fixture(&input);

        let args = parse(&[
            "--input",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
            "--source-tensor-parallel",
            "2",
            "--target-tensor-parallel",
            "4",
            "--dry-run",
        ]);
        run(&args).unwrap();

        assert!(!output.exists());
    }

    #[test]
    fn test_inspect_summary() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("tp2");
        write_fixture(&input);

        let reader = ArchiveReader::open(&input).unwrap();
        let mut out = Vec::new();
        write_summary(&mut out, &reader).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("layout:     TP=2 PP=1"));
        assert!(text.contains("tp01_pp000.bin"));
        assert!(text.contains("total:      2 shards"));
    }
}

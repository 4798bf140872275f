use clap::{ArgGroup, Parser};
use glam::{Mat4, Vec3};
use ksplat_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use ksplat_lib::sort::{SortEngineConfig, SortParams, SortPoll, SortWorker, SortWorkerConfig, TransportMode};
use ksplat_lib::{
    compress, compress_bundle, compress_bundle_async, decompress, load_scene, BundleScene,
    CompressionOptions, MergedSplats, SceneFormat, SplatScene, SplatTree, SplatTreeConfig,
};
use std::cmp::min;
use std::error::Error;
use std::fs;
use std::process;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ksplat",
    version = "0.1",
    about = "Converts Gaussian splat scenes to and from the ksplat format"
)]
#[command(group(
    ArgGroup::new("mode").required(true).args(&["compress", "decompress", "stats"])
))]
struct Cli {
    #[arg(short = 'e', long = "compress", help = "Convert .ply/.splat input to ksplat.")]
    compress: bool,

    #[arg(short = 'd', long = "decompress", help = "Convert ksplat input to .splat rows.")]
    decompress: bool,

    #[arg(
        short = 's',
        long = "stats",
        help = "Print scene statistics and time one full depth sort."
    )]
    stats: bool,

    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        required = true,
        help = "Path to the input file."
    )]
    input: String,

    #[arg(
        short = 'o',
        long = "output",
        value_name = "OUTPUT",
        required_unless_present = "stats",
        help = "Path to the output file."
    )]
    output: Option<String>,

    #[arg(
        short = 'l',
        long = "level",
        value_name = "LEVEL",
        default_value = "0",
        help = "ksplat compression level (0 or 1)."
    )]
    level: u8,

    #[arg(
        short = 'm',
        long = "min-alpha",
        value_name = "ALPHA",
        default_value = "1",
        help = "Drop splats with opacity below this value."
    )]
    minimum_alpha: u8,

    #[arg(long = "block-size", value_name = "SIZE", default_value = "5.0")]
    block_size: f32,

    #[arg(long = "bucket-size", value_name = "COUNT", default_value = "256")]
    bucket_size: u32,

    #[arg(
        short = 'b',
        long = "bundle",
        help = "Wrap the ksplat output in a zstd-compressed scene bundle."
    )]
    bundle: bool,

    #[arg(
        short = 'c',
        long = "compression-level",
        value_name = "LEVEL",
        default_value = "3",
        help = "Set the zstd level for bundles."
    )]
    compression_level: u32,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Set the workers count for ZSTD."
    )]
    workers: u32,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Write bundles through the asynchronous encoder."
    )]
    async_mode: bool,
}

fn print_stats(raw_data: &[u8], format: SceneFormat, options: &CompressionOptions) -> Result<(), Box<dyn Error + Send + Sync>> {
    let buffer = load_scene(raw_data, format, options)?;
    let header = *buffer.header();
    println!(
        "Splats: {} | Buckets: {} x {} | Level: {} | Block size: {}",
        header.splat_count,
        header.bucket_count,
        header.bucket_size,
        header.compression_level,
        header.bucket_block_size
    );

    let splats = MergedSplats::merge(&[SplatScene::new(buffer)], false)?;
    let start = Instant::now();
    let tree = SplatTree::build(&splats, SplatTreeConfig::default(), |i| splats.passes_alpha(i));
    println!(
        "Octree: {} nodes, {} leaves, {} indexed splats ({} ms)",
        tree.nodes().len(),
        tree.count_leaves(),
        tree.indexed_count(),
        start.elapsed().as_millis()
    );

    let candidates: Vec<u32> = (0..splats.splat_count() as u32)
        .filter(|&i| splats.passes_alpha(i))
        .collect();
    if candidates.is_empty() {
        return Ok(());
    }
    let center = splats
        .centers
        .chunks_exact(3)
        .fold(Vec3::ZERO, |acc, c| acc + Vec3::from_slice(c))
        / splats.splat_count() as f32;
    let eye = center + Vec3::new(0.0, 0.0, 10.0);
    let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0) * Mat4::look_at_rh(eye, center, Vec3::Y);

    let mut worker = SortWorker::spawn(
        splats.splat_count(),
        SortWorkerConfig {
            transport: TransportMode::Shared,
            engine: SortEngineConfig::default(),
            ..Default::default()
        },
    )?;
    worker.set_data(splats.centers.clone(), splats.transform_indexes.clone())?;
    let start = Instant::now();
    worker.request_sort(SortParams::full(view_proj, candidates.len()), &candidates, None)?;
    if let SortPoll::Done(outcome) = worker.wait()? {
        println!(
            "Sorted {} splats in {} ms (worker {} ms)",
            outcome.sorted.len(),
            start.elapsed().as_millis(),
            outcome.sort_time.as_millis()
        );
    }
    worker.shutdown();
    Ok(())
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.bundle && !cli.compress {
        eprintln!("Error: --bundle (-b) can only be used with compression (-e).");
        process::exit(1);
    }

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });
    let format = SceneFormat::from_path(&cli.input)?;
    let options = CompressionOptions {
        compression_level: cli.level,
        minimum_alpha: cli.minimum_alpha,
        block_size: cli.block_size,
        bucket_size: cli.bucket_size,
    };

    tracing::debug!(?format, ?options, "parsed arguments");

    if cli.stats {
        return print_stats(&raw_data, format, &options);
    }

    let output = cli.output.as_deref().unwrap_or_default();
    let op = if cli.compress {
        "Compression"
    } else {
        "Decompression"
    };
    println!("Mode: {} | Input: {} | Output: {}", op, cli.input, output);

    let cmp_level = min(cli.compression_level, ZSTD_MAX_COMPRESSION_LVL);
    let start = Instant::now();

    let mut result = Vec::new();
    if cli.compress {
        compress(&raw_data, format, &options, &mut result)?;
        if cli.bundle {
            let scene = BundleScene {
                transform: Mat4::IDENTITY,
                buffer: ksplat_lib::SplatBuffer::from_bytes(result)?,
            };
            let mut packed = Vec::new();
            if cli.async_mode {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()?;
                rt.block_on(compress_bundle_async(&[scene], cmp_level, cli.workers, &mut packed))?;
            } else {
                compress_bundle(&[scene], cmp_level, cli.workers, &mut packed)?;
            }
            result = packed;
        }
    } else {
        let rows = decompress(&raw_data, &mut result)?;
        println!("Rows: {}", rows);
    }

    let elapsed = start.elapsed().as_millis();
    println!("{} Time: {} ms", op, elapsed);

    fs::write(output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", output);

    Ok(())
}

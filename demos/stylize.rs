// Copyright 2025 Irreducible Inc.

//! Runs one image through a style-transfer model on the CPU backend.
//!
//! Parameters are read from `<params>/<model>/...`, one raw `f32` file per array. The input and
//! output images are raw planar RGB `f32` files, channel after channel. Without an input file a
//! random image is used, which is enough for timing and memory measurements.
//!
//! Set `STYLENET_TRUNCATE_TILES=1` to skip the rows left over after the last full tile.

use std::{
	path::{Path, PathBuf},
	time::Instant,
};

use anyhow::{bail, ensure, Context, Result};
use bytesize::ByteSize;
use clap::{builder::PossibleValuesParser, value_parser, Parser, ValueEnum};
use rand::{rngs::StdRng, Rng, SeedableRng};
use stylenet_compute::cpu::CpuLayer;
use stylenet_nn::{
	params::{decode_f32, DirectoryParameterSource},
	Layer, ModelConfig, ModelVariant, StyleModel, TileRemainder, Timings, DEFAULT_MODEL,
	DEFAULT_TILE_HEIGHT, IMAGE_CHANNELS, MODEL_NAMES,
};
use stylenet_utils::{env::boolean_env_flag_set, rayon::adjust_thread_pool, tracing::init_tracing};
use tracing::info;

const TRUNCATE_TILES_ENV: &str = "STYLENET_TRUNCATE_TILES";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Variant {
	/// Whole-image layers
	Reference,
	/// Row-tiled layers with chained residual blocks
	Tiled,
}

#[derive(Debug, Parser)]
struct Args {
	/// Directory holding one parameter directory per model
	#[arg(long)]
	params: PathBuf,
	/// The style to apply
	#[arg(long, default_value = DEFAULT_MODEL, value_parser = PossibleValuesParser::new(MODEL_NAMES))]
	model: String,
	/// Raw planar RGB f32 image; a random image is used when omitted
	#[arg(long)]
	input: Option<PathBuf>,
	#[arg(long, default_value_t = 256, value_parser = value_parser!(u32).range(1..))]
	height: u32,
	#[arg(long, default_value_t = 256, value_parser = value_parser!(u32).range(1..))]
	width: u32,
	#[arg(long, value_enum, default_value_t = Variant::Tiled)]
	variant: Variant,
	/// Tile height in input rows
	#[arg(long, default_value_t = DEFAULT_TILE_HEIGHT as u64, value_parser = value_parser!(u64).range(1..))]
	tile_height: u64,
	/// Device memory budget, for instance `64MiB`
	#[arg(long)]
	memory_limit: Option<ByteSize>,
	/// Where to write the raw planar RGB f32 result
	#[arg(long)]
	output: Option<PathBuf>,
	/// Number of forward passes to time
	#[arg(long, default_value_t = 1, value_parser = value_parser!(u32).range(1..))]
	repeat: u32,
}

fn read_image(path: &Path, height: usize, width: usize) -> Result<Vec<f32>> {
	let bytes =
		std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
	let image = decode_f32(&path.to_string_lossy(), &bytes)?;
	ensure!(
		image.len() == IMAGE_CHANNELS * height * width,
		"{} holds {} values, a {IMAGE_CHANNELS}x{height}x{width} image needs {}",
		path.display(),
		image.len(),
		IMAGE_CHANNELS * height * width
	);
	Ok(image)
}

fn main() -> Result<()> {
	if let Err(err) = adjust_thread_pool() {
		bail!("failed to initialize the thread pool: {err}");
	}

	let args = Args::parse();
	init_tracing();

	let (height, width) = (args.height as usize, args.width as usize);
	let config = ModelConfig {
		variant: match args.variant {
			Variant::Reference => ModelVariant::Reference,
			Variant::Tiled => ModelVariant::Tiled,
		},
		tile_height: args.tile_height as usize,
		tile_remainder: if boolean_env_flag_set(TRUNCATE_TILES_ENV) {
			TileRemainder::Truncate
		} else {
			TileRemainder::Partial
		},
		..Default::default()
	};
	let hal = match args.memory_limit {
		Some(limit) => CpuLayer::with_memory_limit(limit.as_u64() as usize),
		None => CpuLayer::default(),
	};

	let image = match &args.input {
		Some(path) => read_image(path, height, width)?,
		None => {
			let mut rng = StdRng::seed_from_u64(0);
			(0..IMAGE_CHANNELS * height * width)
				.map(|_| rng.gen_range(0.0..255.0))
				.collect()
		}
	};

	let mut model = StyleModel::new(&hal, config)?;
	let source = DirectoryParameterSource::new(&args.params);
	model
		.load_parameters(&hal, &source, &args.model)
		.with_context(|| format!("failed to load {} from {}", args.model, args.params.display()))?;
	let resident = hal.memory().live_bytes();
	info!(model = %args.model, parameters = %ByteSize(resident as u64), ?config, "model ready");

	// Discard the load-time counters.
	model.accumulate_benchmark(&mut Timings::default());
	hal.memory().reset_peak();

	let start = Instant::now();
	let mut result = None;
	for _ in 0..args.repeat {
		result = Some(model.forward_host(&hal, &image, height, width)?);
	}
	let elapsed = start.elapsed() / args.repeat;
	let Some((output, out_height, out_width)) = result else {
		bail!("no forward pass was run");
	};

	let mut timings = Timings::default();
	model.accumulate_benchmark(&mut timings);
	let working_set = hal.memory().peak_bytes() - resident;

	println!("{}: {height}x{width} -> {out_height}x{out_width}", args.model);
	println!("forward pass: {:.3} ms", elapsed.as_secs_f64() * 1e3);
	println!("parameters:   {}", ByteSize(resident as u64));
	println!("working set:  {}", ByteSize(working_set as u64));
	println!("time per kernel over {} passes:\n{timings}", args.repeat);

	if let Some(path) = &args.output {
		std::fs::write(path, bytemuck::cast_slice::<f32, u8>(&output))
			.with_context(|| format!("failed to write {}", path.display()))?;
	}
	Ok(())
}

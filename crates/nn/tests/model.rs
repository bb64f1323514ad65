// Copyright 2025 Irreducible Inc.

use stylenet_compute::cpu::CpuLayer;
use stylenet_compute_test_utils::reference::{self, random_parameters, zero_parameters, Image};
use stylenet_nn::{
	params::MemoryParameterSource, Layer, ModelConfig, StyleModel, TileRemainder, Timings,
	DEFAULT_MODEL,
};

fn loaded_model(
	hal: &CpuLayer,
	config: ModelConfig,
	source: &MemoryParameterSource,
	model: &str,
) -> StyleModel<CpuLayer> {
	let mut style = StyleModel::new(hal, config).unwrap();
	style.load_parameters(hal, source, model).unwrap();
	style
}

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
	assert_eq!(actual.len(), expected.len());
	for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
		assert!(
			(a - e).abs() <= tolerance * e.abs().max(1.0),
			"mismatch at {i}: {a} != {e}"
		);
	}
}

#[test]
fn test_zero_weights_produce_output_bias() {
	let hal = CpuLayer::default();
	let bias = [0.25, -1.5, 3.0];
	let source = MemoryParameterSource::from(zero_parameters("kanagawa", bias));
	let image = Image::random(3, 256, 256, 1);

	let mut model = loaded_model(&hal, ModelConfig::tiled(), &source, "kanagawa");
	let (output, height, width) = model.forward_host(&hal, &image.data, 256, 256).unwrap();
	assert_eq!((height, width), (256, 256));
	assert_eq!(output.len(), 3 * 256 * 256);
	for (plane, &b) in output.chunks(256 * 256).zip(&bias) {
		assert!(plane.iter().all(|&x| x == b));
	}
}

#[test]
fn test_matches_naive_forward() {
	let hal = CpuLayer::default();
	let params = random_parameters(DEFAULT_MODEL, 5);
	let source = MemoryParameterSource::from(params.clone());
	let image = Image::random(3, 20, 12, 2);
	let expected = reference::forward(&params, DEFAULT_MODEL, &image, 0.0);
	assert_eq!((expected.height, expected.width), (20, 12));

	let configs = [
		ModelConfig::default(),
		ModelConfig {
			tile_height: 8,
			..ModelConfig::tiled()
		},
		ModelConfig {
			tile_height: 4,
			..ModelConfig::tiled()
		},
		ModelConfig {
			tile_height: 1,
			..ModelConfig::tiled()
		},
	];
	for config in configs {
		let mut model = loaded_model(&hal, config, &source, DEFAULT_MODEL);
		let (output, height, width) = model.forward_host(&hal, &image.data, 20, 12).unwrap();
		assert_eq!((height, width), (20, 12));
		assert_close(&output, &expected.data, 1e-3);
	}
}

#[test]
fn test_full_size_matches_naive_forward() {
	const SIZE: usize = 256;
	let hal = CpuLayer::default();
	let params = random_parameters(DEFAULT_MODEL, 11);
	let source = MemoryParameterSource::from(params.clone());
	let image = Image::random(3, SIZE, SIZE, 6);
	let expected = reference::forward(&params, DEFAULT_MODEL, &image, 0.0);
	assert_eq!((expected.channels, expected.height, expected.width), (3, SIZE, SIZE));

	let plane = SIZE * SIZE;
	let channel_sums = |data: &[f32]| {
		data.chunks(plane)
			.map(|c| c.iter().map(|&x| x as f64).sum::<f64>())
			.collect::<Vec<_>>()
	};
	let expected_sums = channel_sums(&expected.data);
	// Non-trivial weights give an output that varies across the image.
	for channel in expected.data.chunks(plane) {
		assert!(channel.iter().all(|x| x.is_finite()));
		assert!(channel.iter().any(|&x| x != channel[0]));
	}

	for config in [ModelConfig::default(), ModelConfig::tiled()] {
		let mut model = loaded_model(&hal, config, &source, DEFAULT_MODEL);
		let (output, height, width) = model.forward_host(&hal, &image.data, SIZE, SIZE).unwrap();
		assert_eq!((height, width), (SIZE, SIZE));
		assert_close(&output, &expected.data, 1e-3);
		for (sum, want) in channel_sums(&output).iter().zip(&expected_sums) {
			assert!(
				(sum - want).abs() <= 1e-3 * want.abs().max(plane as f64),
				"{config:?}: channel sum {sum} != {want}"
			);
		}
	}
}

#[test]
fn test_tiled_agrees_with_reference() {
	let hal = CpuLayer::default();
	let source = MemoryParameterSource::from(random_parameters("seurat", 9));
	let image = Image::random(3, 64, 40, 3);

	let mut reference = loaded_model(&hal, ModelConfig::default(), &source, "seurat");
	let (expected, _, _) = reference.forward_host(&hal, &image.data, 64, 40).unwrap();

	for tile_height in [16, 24, 64] {
		let config = ModelConfig {
			tile_height,
			..ModelConfig::tiled()
		};
		let mut tiled = loaded_model(&hal, config, &source, "seurat");
		let (output, _, _) = tiled.forward_host(&hal, &image.data, 64, 40).unwrap();
		assert_close(&output, &expected, 1e-4);
	}
}

#[test]
fn test_truncated_tiles_match_on_tile_multiples() {
	let hal = CpuLayer::default();
	let source = MemoryParameterSource::from(random_parameters("candy", 4));
	let image = Image::random(3, 32, 16, 8);

	let mut reference = loaded_model(&hal, ModelConfig::default(), &source, "candy");
	let (expected, _, _) = reference.forward_host(&hal, &image.data, 32, 16).unwrap();

	let config = ModelConfig {
		tile_height: 8,
		tile_remainder: TileRemainder::Truncate,
		..ModelConfig::tiled()
	};
	let mut truncated = loaded_model(&hal, config, &source, "candy");
	let (output, _, _) = truncated.forward_host(&hal, &image.data, 32, 16).unwrap();
	assert_close(&output, &expected, 1e-4);
}

#[test]
fn test_accumulated_timings() {
	let hal = CpuLayer::default();
	let source = MemoryParameterSource::from(random_parameters("fur", 1));
	let image = Image::random(3, 16, 16, 1);
	let mut model = loaded_model(&hal, ModelConfig::tiled(), &source, "fur");
	model.forward_host(&hal, &image.data, 16, 16).unwrap();

	let mut timings = Timings::default();
	model.accumulate_benchmark(&mut timings);
	for duration in [timings.im2col, timings.sgemm, timings.col2im, timings.normalize] {
		assert!(!duration.is_zero());
	}
	assert!(timings.total() > timings.sgemm);

	let mut again = Timings::default();
	model.accumulate_benchmark(&mut again);
	assert_eq!(again, Timings::default());
}

// Copyright 2025 Irreducible Inc.

//! Direct nested-loop evaluation of the style network.
//!
//! Nothing here shares code with the GEMM path beyond the output-size formulas, so agreement
//! between the two is meaningful.

use std::collections::BTreeMap;

use rand::{prelude::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use stylenet_math::{conv_outsize, deconv_outsize, Activation};

/// Planar image with its dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
	pub channels: usize,
	pub height: usize,
	pub width: usize,
	pub data: Vec<f32>,
}

impl Image {
	pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Self {
		assert_eq!(data.len(), channels * height * width);
		Self {
			channels,
			height,
			width,
			data,
		}
	}

	pub fn random(channels: usize, height: usize, width: usize, seed: u64) -> Self {
		let mut rng = StdRng::seed_from_u64(seed);
		let data = (0..channels * height * width)
			.map(|_| rng.gen_range(0.0..1.0))
			.collect();
		Self::new(channels, height, width, data)
	}

	fn at(&self, c: usize, y: usize, x: usize) -> f32 {
		self.data[(c * self.height + y) * self.width + x]
	}
}

/// Direct convolution. `weights` is `[out_channels, in_channels, kernel, kernel]`.
///
/// Output channels are evaluated in parallel.
pub fn conv2d(
	input: &Image,
	weights: &[f32],
	bias: &[f32],
	kernel: usize,
	stride: usize,
	pad: usize,
) -> Image {
	let out_channels = bias.len();
	assert_eq!(weights.len(), out_channels * input.channels * kernel * kernel);
	let out_h = conv_outsize(input.height, kernel, stride, pad).unwrap();
	let out_w = conv_outsize(input.width, kernel, stride, pad).unwrap();

	let mut data = vec![0.0; out_channels * out_h * out_w];
	data.par_chunks_mut(out_h * out_w).enumerate().for_each(|(oc, plane)| {
		for oy in 0..out_h {
			for ox in 0..out_w {
				let mut acc = bias[oc];
				for ic in 0..input.channels {
					for ky in 0..kernel {
						for kx in 0..kernel {
							let y = (oy * stride + ky) as isize - pad as isize;
							let x = (ox * stride + kx) as isize - pad as isize;
							if y < 0
								|| x < 0 || y as usize >= input.height
								|| x as usize >= input.width
							{
								continue;
							}
							let w = weights[((oc * input.channels + ic) * kernel + ky) * kernel + kx];
							acc += w * input.at(ic, y as usize, x as usize);
						}
					}
				}
				plane[oy * out_w + ox] = acc;
			}
		}
	});
	Image::new(out_channels, out_h, out_w, data)
}

/// Direct transposed convolution. `weights` is `[in_channels, out_channels, kernel, kernel]`.
///
/// Every output channel scatters from all inputs on its own, in parallel.
pub fn deconv2d(
	input: &Image,
	weights: &[f32],
	bias: &[f32],
	kernel: usize,
	stride: usize,
	pad: usize,
) -> Image {
	let out_channels = bias.len();
	assert_eq!(weights.len(), input.channels * out_channels * kernel * kernel);
	let out_h = deconv_outsize(input.height, kernel, stride, pad).unwrap();
	let out_w = deconv_outsize(input.width, kernel, stride, pad).unwrap();

	let mut data = vec![0.0; out_channels * out_h * out_w];
	data.par_chunks_mut(out_h * out_w).enumerate().for_each(|(oc, plane)| {
		for ic in 0..input.channels {
			for iy in 0..input.height {
				for ix in 0..input.width {
					let value = input.at(ic, iy, ix);
					for ky in 0..kernel {
						for kx in 0..kernel {
							let y = (iy * stride + ky) as isize - pad as isize;
							let x = (ix * stride + kx) as isize - pad as isize;
							if y < 0 || x < 0 || y as usize >= out_h || x as usize >= out_w {
								continue;
							}
							let w = weights[((ic * out_channels + oc) * kernel + ky) * kernel + kx];
							plane[y as usize * out_w + x as usize] += w * value;
						}
					}
				}
			}
		}
		plane.iter_mut().for_each(|x| *x += bias[oc]);
	});
	Image::new(out_channels, out_h, out_w, data)
}

pub fn batch_norm(
	image: &mut Image,
	gamma: &[f32],
	beta: &[f32],
	mean: &[f32],
	var: &[f32],
	eps: f32,
) {
	let plane = image.height * image.width;
	for (c, values) in image.data.chunks_mut(plane).enumerate() {
		for x in values {
			*x = gamma[c] * (*x - mean[c]) / (var[c] + eps).sqrt() + beta[c];
		}
	}
}

pub fn activate(image: &mut Image, activation: Activation) {
	activation.apply_slice(&mut image.data);
}

/// A convolutional stage of the network: parameter group, channels and window.
#[derive(Debug, Clone, Copy)]
pub struct Stage {
	pub name: &'static str,
	pub in_channels: usize,
	pub out_channels: usize,
	pub kernel: usize,
	pub stride: usize,
	pub pad: usize,
}

const fn stage(
	name: &'static str,
	in_channels: usize,
	out_channels: usize,
	kernel: usize,
	stride: usize,
	pad: usize,
) -> Stage {
	Stage {
		name,
		in_channels,
		out_channels,
		kernel,
		stride,
		pad,
	}
}

pub const ENCODER: [Stage; 3] = [
	stage("c1", 3, 32, 9, 1, 4),
	stage("c2", 32, 64, 4, 2, 1),
	stage("c3", 64, 128, 4, 2, 1),
];
pub const DECODER: [Stage; 3] = [
	stage("d1", 128, 64, 4, 2, 1),
	stage("d2", 64, 32, 4, 2, 1),
	stage("d3", 32, 3, 9, 1, 4),
];
pub const RESIDUAL_BLOCKS: usize = 5;
pub const RESIDUAL_CHANNELS: usize = 128;

pub type Parameters = BTreeMap<String, Vec<f32>>;

/// Every parameter array of a model together with its length.
pub fn parameter_shapes(model: &str) -> Vec<(String, usize)> {
	let mut shapes = Vec::new();
	let mut push_conv = |prefix: String, s: &Stage| {
		shapes.push((
			format!("{prefix}/W"),
			s.in_channels * s.out_channels * s.kernel * s.kernel,
		));
		shapes.push((format!("{prefix}/b"), s.out_channels));
	};
	for s in ENCODER.iter().chain(&DECODER) {
		push_conv(format!("{model}/{}", s.name), s);
	}
	for block in 1..=RESIDUAL_BLOCKS {
		for j in 1..=2 {
			let s = stage("", RESIDUAL_CHANNELS, RESIDUAL_CHANNELS, 3, 1, 1);
			push_conv(format!("{model}/r{block}/c{j}"), &s);
		}
	}

	let mut push_norm = |prefix: String, channels: usize| {
		for field in ["gamma", "beta", "avg_mean", "avg_var"] {
			shapes.push((format!("{prefix}/{field}"), channels));
		}
	};
	let norm_channels = [32, 64, 128, 64, 32];
	for (i, &channels) in norm_channels.iter().enumerate() {
		push_norm(format!("{model}/b{}", i + 1), channels);
	}
	for block in 1..=RESIDUAL_BLOCKS {
		for j in 1..=2 {
			push_norm(format!("{model}/r{block}/b{j}"), RESIDUAL_CHANNELS);
		}
	}
	shapes
}

/// Deterministic parameters that keep activations in a moderate range through the whole network.
pub fn random_parameters(model: &str, seed: u64) -> Parameters {
	let mut rng = StdRng::seed_from_u64(seed);
	parameter_shapes(model)
		.into_iter()
		.map(|(path, len)| {
			let field = path.rsplit('/').next().unwrap_or_default();
			let values: Vec<f32> = match field {
				"W" => {
					let fan_in = fan_in(&path, len);
					let scale = 1.0 / (fan_in as f32).sqrt();
					(0..len).map(|_| rng.gen_range(-scale..scale)).collect()
				}
				"gamma" | "avg_var" => (0..len).map(|_| rng.gen_range(0.5..1.5)).collect(),
				_ => (0..len).map(|_| rng.gen_range(-0.1..0.1)).collect(),
			};
			(path, values)
		})
		.collect()
}

/// Parameters with zero weights and biases and unit batch normalization, so that the output is
/// the final bias `output_bias` everywhere.
pub fn zero_parameters(model: &str, output_bias: [f32; 3]) -> Parameters {
	parameter_shapes(model)
		.into_iter()
		.map(|(path, len)| {
			let values = if path == format!("{model}/d3/b") {
				output_bias.to_vec()
			} else if path.ends_with("/gamma") || path.ends_with("/avg_var") {
				vec![1.0; len]
			} else {
				vec![0.0; len]
			};
			(path, values)
		})
		.collect()
}

fn fan_in(path: &str, len: usize) -> usize {
	let segments = path.split('/').collect::<Vec<_>>();
	let top_level = segments.len() == 3;
	let s = ENCODER
		.iter()
		.chain(&DECODER)
		.find(|s| top_level && s.name == segments[1]);
	match s {
		// Every output pixel of a transposed convolution sees (kernel / stride)^2 taps per channel.
		Some(s) if s.name.starts_with('d') => {
			s.in_channels * (s.kernel / s.stride) * (s.kernel / s.stride)
		}
		Some(s) => s.in_channels * s.kernel * s.kernel,
		None => len / RESIDUAL_CHANNELS,
	}
}

fn param<'a>(params: &'a Parameters, path: &str) -> &'a [f32] {
	params
		.get(path)
		.unwrap_or_else(|| panic!("missing parameter {path}"))
}

fn norm(params: &Parameters, prefix: &str, image: &mut Image, eps: f32) {
	batch_norm(
		image,
		param(params, &format!("{prefix}/gamma")),
		param(params, &format!("{prefix}/beta")),
		param(params, &format!("{prefix}/avg_mean")),
		param(params, &format!("{prefix}/avg_var")),
		eps,
	);
}

/// Full forward pass of the style network with batch-norm epsilon `eps`.
pub fn forward(params: &Parameters, model: &str, input: &Image, eps: f32) -> Image {
	let mut x = input.clone();
	for (i, s) in ENCODER.iter().enumerate() {
		let prefix = format!("{model}/{}", s.name);
		x = conv2d(
			&x,
			param(params, &format!("{prefix}/W")),
			param(params, &format!("{prefix}/b")),
			s.kernel,
			s.stride,
			s.pad,
		);
		activate(&mut x, Activation::Elu);
		norm(params, &format!("{model}/b{}", i + 1), &mut x, eps);
	}

	for block in 1..=RESIDUAL_BLOCKS {
		let prefix = format!("{model}/r{block}");
		let mut y = x.clone();
		for j in 1..=2 {
			y = conv2d(
				&y,
				param(params, &format!("{prefix}/c{j}/W")),
				param(params, &format!("{prefix}/c{j}/b")),
				3,
				1,
				1,
			);
			norm(params, &format!("{prefix}/b{j}"), &mut y, eps);
			if j == 1 {
				activate(&mut y, Activation::Relu);
			}
		}
		for (a, b) in y.data.iter_mut().zip(&x.data) {
			*a += b;
		}
		x = y;
	}

	for (i, s) in DECODER.iter().enumerate() {
		let prefix = format!("{model}/{}", s.name);
		x = deconv2d(
			&x,
			param(params, &format!("{prefix}/W")),
			param(params, &format!("{prefix}/b")),
			s.kernel,
			s.stride,
			s.pad,
		);
		if i + 1 < DECODER.len() {
			activate(&mut x, Activation::Elu);
			norm(params, &format!("{model}/b{}", ENCODER.len() + i + 1), &mut x, eps);
		}
	}
	x
}

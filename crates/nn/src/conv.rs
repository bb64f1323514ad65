// Copyright 2025 Irreducible Inc.

use std::fmt;

use getset::CopyGetters;
use stylenet_compute::{DeviceBuffer, KernelLayer, Region, Transpose};
use stylenet_math::{padded_contraction_len, Activation, Window};
use stylenet_utils::ensure;
use tracing::{debug, instrument, trace};

use crate::{
	params::ParameterSource, timing::timed, Error, FeatureMap, Layer, TilePlan, TilePolicy,
	Timings,
};

/// Transient buffers of a convolution over images of one size.
///
/// The column buffer and tile output hold a single band of rows. A workspace can be reused by
/// any convolution with the same channels, window and tile policy, which is how the chained
/// residual block keeps one set of buffers for all of its layers.
#[derive(Debug, CopyGetters)]
pub struct ConvWorkspace<B> {
	#[getset(get_copy = "pub")]
	height: usize,
	#[getset(get_copy = "pub")]
	width: usize,
	#[getset(get_copy = "pub")]
	out_height: usize,
	#[getset(get_copy = "pub")]
	out_width: usize,
	in_channels: usize,
	window: Window,
	plan: TilePlan,
	padded: B,
	col: B,
	tile_output: Option<B>,
}

impl<B> ConvWorkspace<B> {
	pub fn plan(&self) -> &TilePlan {
		&self.plan
	}
}

/// A 2D convolution computed as `weights x im2col(input)^T`, optionally in bands of output rows.
///
/// Weights are stored as `[out_channels, padded_contraction_len(in_channels * taps)]` with zero
/// padding columns, matching the zero padding columns of the column buffer.
#[derive(CopyGetters)]
pub struct Convolution2D<H: KernelLayer> {
	#[getset(get_copy = "pub")]
	in_channels: usize,
	#[getset(get_copy = "pub")]
	out_channels: usize,
	#[getset(get_copy = "pub")]
	window: Window,
	#[getset(get_copy = "pub")]
	policy: TilePolicy,
	#[getset(get_copy = "pub")]
	activation: Activation,
	/// Dimensions of the most recent output.
	#[getset(get_copy = "pub")]
	output_dims: Option<(usize, usize)>,
	weights: H::Buffer,
	bias: H::Buffer,
	timings: Timings,
}

impl<H: KernelLayer> Convolution2D<H> {
	/// Creates the layer with zero weights and bias.
	pub fn new(
		hal: &H,
		in_channels: usize,
		out_channels: usize,
		window: Window,
		policy: TilePolicy,
	) -> Result<Self, Error> {
		ensure!(
			in_channels > 0 && out_channels > 0,
			Error::InvalidConfig("convolution needs at least one channel".into())
		);
		ensure!(
			window.stride_y > 0 && window.stride_x > 0,
			Error::Math(stylenet_math::Error::ZeroStride)
		);
		policy.validate()?;

		let contraction = padded_contraction_len(in_channels * window.taps());
		Ok(Self {
			in_channels,
			out_channels,
			window,
			policy,
			activation: Activation::Identity,
			output_dims: None,
			weights: hal.alloc(out_channels, contraction)?,
			bias: hal.alloc(out_channels, 1)?,
			timings: Timings::default(),
		})
	}

	/// Applies `activation` to the output after the bias.
	pub fn with_activation(mut self, activation: Activation) -> Self {
		self.activation = activation;
		self
	}

	/// Length of a column buffer row without the alignment padding.
	pub fn contraction_len(&self) -> usize {
		self.in_channels * self.window.taps()
	}

	pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize), Error> {
		Ok(self.window.conv_out_dims(height, width)?)
	}

	/// Allocates the transient buffers for `height` x `width` inputs.
	pub fn workspace(
		&self,
		hal: &H,
		height: usize,
		width: usize,
	) -> Result<ConvWorkspace<H::Buffer>, Error> {
		let (out_height, out_width) = self.output_size(height, width)?;
		let plan = TilePlan::for_convolution(self.policy, &self.window, height, out_height)?;
		let (padded_h, padded_w) = self.window.padded_dims(height, width);
		debug!(
			height,
			width,
			out_height,
			out_width,
			tiles = plan.bands().len(),
			tile_rows = plan.tile_rows(),
			"convolution workspace"
		);

		let padded = hal.alloc(self.in_channels, padded_h * padded_w)?;
		let col = hal.alloc(
			plan.tile_rows() * out_width,
			padded_contraction_len(self.contraction_len()),
		)?;
		let tile_output = if plan.is_whole(out_height) {
			None
		} else {
			Some(hal.alloc(self.out_channels, plan.tile_rows() * out_width)?)
		};

		Ok(ConvWorkspace {
			height,
			width,
			out_height,
			out_width,
			in_channels: self.in_channels,
			window: self.window,
			plan,
			padded,
			col,
			tile_output,
		})
	}

	/// Convolves `input` into a newly allocated feature map.
	#[instrument(skip_all, name = "Convolution2D::forward", level = "debug")]
	pub fn forward(
		&mut self,
		hal: &H,
		input: &FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		input.expect_channels(self.in_channels, "convolution")?;
		let (height, width) = input.dims();
		let (out_height, out_width) = self.output_size(height, width)?;

		let output = match self.policy {
			TilePolicy::Untiled => {
				let col = self.unfold(hal, input.buffer(), height, width, out_height, out_width)?;
				let mut output = hal.alloc(self.out_channels, out_height * out_width)?;
				timed(hal, &mut self.timings.sgemm, || {
					hal.sgemm(
						Transpose::NoTrans,
						Transpose::Trans,
						1.0,
						&self.weights,
						&col,
						0.0,
						&mut output,
					)
				})?;
				output
			}
			TilePolicy::Rows { .. } => {
				let mut workspace = self.workspace(hal, height, width)?;
				let mut output = hal.alloc(self.out_channels, out_height * out_width)?;
				self.forward_into(hal, input.buffer(), &mut output, &mut workspace)?;
				output
			}
		};

		let mut output = FeatureMap::new(output, out_height, out_width)?;
		if self.policy == TilePolicy::Untiled {
			self.finish_output(hal, output.buffer_mut())?;
		}
		self.output_dims = Some((out_height, out_width));
		Ok(output)
	}

	/// Convolves `input` into `output`, both sized for `workspace`.
	pub fn forward_into(
		&mut self,
		hal: &H,
		input: &H::Buffer,
		output: &mut H::Buffer,
		workspace: &mut ConvWorkspace<H::Buffer>,
	) -> Result<(), Error> {
		self.pad_input(hal, input, workspace)?;
		self.convolve_padded(hal, workspace, output)?;
		self.finish_output(hal, output)
	}

	/// Replaces the contents of `buffer` with their convolution.
	///
	/// Only valid for layers that map images onto images of the same shape.
	pub fn forward_in_place(
		&mut self,
		hal: &H,
		buffer: &mut H::Buffer,
		workspace: &mut ConvWorkspace<H::Buffer>,
	) -> Result<(), Error> {
		ensure!(
			self.in_channels == self.out_channels
				&& (workspace.height, workspace.width)
					== (workspace.out_height, workspace.out_width),
			Error::ShapeMismatch("in-place convolution must preserve the feature map shape".into())
		);
		self.pad_input(hal, buffer, workspace)?;
		self.convolve_padded(hal, workspace, buffer)?;
		self.finish_output(hal, buffer)
	}

	/// Pads and unfolds the whole image, releasing the padded copy before returning.
	fn unfold(
		&mut self,
		hal: &H,
		input: &H::Buffer,
		height: usize,
		width: usize,
		out_height: usize,
		out_width: usize,
	) -> Result<H::Buffer, Error> {
		let (padded_h, padded_w) = self.window.padded_dims(height, width);
		let mut padded = hal.alloc(self.in_channels, padded_h * padded_w)?;
		let mut col = hal.alloc(
			out_height * out_width,
			padded_contraction_len(self.contraction_len()),
		)?;
		timed(hal, &mut self.timings.im2col, || {
			hal.pad(input, height, width, &self.window, &mut padded)?;
			hal.im2col(&padded, height, width, &self.window, 0..out_height, &mut col)
		})?;
		Ok(col)
	}

	fn pad_input(
		&mut self,
		hal: &H,
		input: &H::Buffer,
		workspace: &mut ConvWorkspace<H::Buffer>,
	) -> Result<(), Error> {
		ensure!(
			workspace.in_channels == self.in_channels && workspace.window == self.window,
			Error::ShapeMismatch("workspace belongs to a different convolution".into())
		);
		ensure!(
			input.rows() == self.in_channels,
			Error::ShapeMismatch(format!(
				"convolution expects {} input channels, got {}",
				self.in_channels,
				input.rows()
			))
		);
		timed(hal, &mut self.timings.im2col, || {
			hal.pad(input, workspace.height, workspace.width, &self.window, &mut workspace.padded)
		})
	}

	fn convolve_padded(
		&mut self,
		hal: &H,
		workspace: &mut ConvWorkspace<H::Buffer>,
		output: &mut H::Buffer,
	) -> Result<(), Error> {
		let ConvWorkspace {
			height,
			width,
			out_height,
			out_width,
			plan,
			padded,
			col,
			tile_output,
			..
		} = workspace;
		ensure!(
			output.rows() == self.out_channels && output.cols() == *out_height * *out_width,
			Error::ShapeMismatch(format!(
				"convolution output buffer is {}x{}, expected {}x{}",
				output.rows(),
				output.cols(),
				self.out_channels,
				*out_height * *out_width
			))
		);

		// Rows past the last tile hold only the bias.
		if plan.covered_rows() < *out_height {
			timed(hal, &mut self.timings.copy, || hal.fill(output, 0.0))?;
		}

		for (index, band) in plan.bands().iter().enumerate() {
			trace!(index, rows = ?band, "convolution tile");
			timed(hal, &mut self.timings.im2col, || {
				hal.im2col(padded, *height, *width, &self.window, band.clone(), col)
			})?;

			match tile_output {
				None => timed(hal, &mut self.timings.sgemm, || {
					hal.sgemm(
						Transpose::NoTrans,
						Transpose::Trans,
						1.0,
						&self.weights,
						col,
						0.0,
						output,
					)
				})?,
				Some(tile) => {
					timed(hal, &mut self.timings.sgemm, || {
						hal.sgemm(
							Transpose::NoTrans,
							Transpose::Trans,
							1.0,
							&self.weights,
							col,
							0.0,
							tile,
						)
					})?;
					let region = Region::columns(
						band.start * *out_width,
						band.len() * *out_width,
						self.out_channels,
					);
					timed(hal, &mut self.timings.copy, || {
						hal.copy_2d_range(tile, 0, 0, output, region)
					})?;
				}
			}
		}
		Ok(())
	}

	fn finish_output(&mut self, hal: &H, output: &mut H::Buffer) -> Result<(), Error> {
		timed(hal, &mut self.timings.bias, || hal.add_bias(output, &self.bias))?;
		if self.activation != Activation::Identity {
			timed(hal, &mut self.timings.activation, || hal.activate(output, self.activation))?;
		}
		Ok(())
	}
}

impl<H: KernelLayer> fmt::Debug for Convolution2D<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Convolution2D")
			.field("in_channels", &self.in_channels)
			.field("out_channels", &self.out_channels)
			.field("window", &self.window)
			.field("policy", &self.policy)
			.field("activation", &self.activation)
			.finish_non_exhaustive()
	}
}

impl<H: KernelLayer> Layer<H> for Convolution2D<H> {
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		let contraction = self.contraction_len();
		let weights = source.read_exact(&format!("{path}/W"), self.out_channels * contraction)?;
		let bias = source.read_exact(&format!("{path}/b"), self.out_channels)?;

		// Upload unpadded, then widen each row to the aligned contraction length.
		let mut staging = hal.alloc(self.out_channels, contraction)?;
		hal.copy_h2d(&weights, &mut staging)?;
		hal.copy_2d_range(
			&staging,
			0,
			0,
			&mut self.weights,
			Region::columns(0, contraction, self.out_channels),
		)?;
		hal.copy_h2d(&bias, &mut self.bias)?;

		debug!(path, in_channels = self.in_channels, out_channels = self.out_channels, "loaded convolution");
		Ok(())
	}

	fn process(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		self.forward(hal, &input)
	}

	fn accumulate_benchmark(&mut self, sink: &mut Timings) {
		self.timings.drain_into(sink);
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use stylenet_compute::cpu::CpuLayer;
	use stylenet_compute_test_utils::reference::{conv2d, Image};

	use super::*;
	use crate::{params::MemoryParameterSource, TileRemainder};

	fn ramp_weights(len: usize) -> Vec<f32> {
		(0..len).map(|i| ((i * 7) % 11) as f32 / 11.0 - 0.5).collect()
	}

	fn loaded_conv(
		hal: &CpuLayer,
		in_channels: usize,
		out_channels: usize,
		window: Window,
		policy: TilePolicy,
	) -> (Convolution2D<CpuLayer>, Vec<f32>, Vec<f32>) {
		let mut conv = Convolution2D::new(hal, in_channels, out_channels, window, policy).unwrap();
		let weights = ramp_weights(out_channels * conv.contraction_len());
		let bias = (0..out_channels).map(|i| i as f32 * 0.1).collect::<Vec<_>>();
		let mut source = MemoryParameterSource::new();
		source.insert("conv/W", weights.clone());
		source.insert("conv/b", bias.clone());
		conv.load_parameters(hal, &source, "conv").unwrap();
		(conv, weights, bias)
	}

	fn assert_close(actual: &[f32], expected: &[f32]) {
		assert_eq!(actual.len(), expected.len());
		for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
			assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "mismatch at {i}: {a} != {e}");
		}
	}

	#[test]
	fn test_matches_direct_convolution() {
		let hal = CpuLayer::default();
		for (k, s, p) in [(9, 1, 4), (4, 2, 1), (3, 1, 1)] {
			let (mut conv, weights, bias) =
				loaded_conv(&hal, 3, 5, Window::square(k, s, p), TilePolicy::Untiled);
			let image = Image::random(3, 12, 10, k as u64);
			let input = FeatureMap::upload(&hal, &image.data, 3, 12, 10).unwrap();

			let output = conv.process(&hal, input).unwrap();
			let expected = conv2d(&image, &weights, &bias, k, s, p);
			assert_eq!(output.dims(), (expected.height, expected.width));
			assert_eq!(conv.output_dims(), Some(output.dims()));
			assert_close(&output.download(&hal).unwrap(), &expected.data);
		}
	}

	#[test]
	fn test_tiled_matches_untiled() {
		let hal = CpuLayer::default();
		let window = Window::square(4, 2, 1);
		let image = Image::random(4, 32, 12, 3);

		let (mut untiled, _, _) = loaded_conv(&hal, 4, 6, window, TilePolicy::Untiled);
		let input = FeatureMap::upload(&hal, &image.data, 4, 32, 12).unwrap();
		let expected = untiled.forward(&hal, &input).unwrap().download(&hal).unwrap();

		for height in [1, 2, 8, 16, 32, 64] {
			let (mut tiled, _, _) = loaded_conv(&hal, 4, 6, window, TilePolicy::rows(height));
			let output = tiled.forward(&hal, &input).unwrap();
			assert_close(&output.download(&hal).unwrap(), &expected);
		}
	}

	#[test]
	fn test_partial_and_truncated_remainder() {
		let hal = CpuLayer::default();
		let window = Window::square(3, 1, 1);
		let image = Image::random(2, 20, 6, 4);
		let input = FeatureMap::upload(&hal, &image.data, 2, 20, 6).unwrap();

		let (mut untiled, _, bias) = loaded_conv(&hal, 2, 3, window, TilePolicy::Untiled);
		let expected = untiled.forward(&hal, &input).unwrap().download(&hal).unwrap();

		let (mut partial, _, _) = loaded_conv(&hal, 2, 3, window, TilePolicy::rows(8));
		let output = partial.forward(&hal, &input).unwrap();
		assert_close(&output.download(&hal).unwrap(), &expected);

		let truncate = TilePolicy::Rows {
			height: 8,
			remainder: TileRemainder::Truncate,
		};
		let (mut truncated, _, _) = loaded_conv(&hal, 2, 3, window, truncate);
		let output = truncated.forward(&hal, &input).unwrap().download(&hal).unwrap();
		for (c, (plane, expected_plane)) in output.chunks(120).zip(expected.chunks(120)).enumerate()
		{
			assert_close(&plane[..16 * 6], &expected_plane[..16 * 6]);
			assert!(plane[16 * 6..].iter().all(|&x| x == bias[c]));
		}
	}

	#[test]
	fn test_in_place_with_shared_workspace() {
		let hal = CpuLayer::default();
		let window = Window::square(3, 1, 1);
		let image = Image::random(4, 10, 7, 5);
		let (mut conv, _, _) = loaded_conv(&hal, 4, 4, window, TilePolicy::rows(4));
		let input = FeatureMap::upload(&hal, &image.data, 4, 10, 7).unwrap();
		let expected = conv.forward(&hal, &input).unwrap().download(&hal).unwrap();

		let mut workspace = conv.workspace(&hal, 10, 7).unwrap();
		assert_eq!(workspace.plan().bands().len(), 3);
		let mut buffer = input.into_buffer();
		conv.forward_in_place(&hal, &mut buffer, &mut workspace).unwrap();
		assert_close(buffer.as_slice(), &expected);
	}

	#[test]
	fn test_rejects_mismatched_parameters_and_inputs() {
		let hal = CpuLayer::default();
		let mut conv =
			Convolution2D::new(&hal, 3, 2, Window::square(3, 1, 1), TilePolicy::Untiled).unwrap();
		let mut source = MemoryParameterSource::new();
		source.insert("conv/W", vec![0.0; 2 * 27 - 1]);
		source.insert("conv/b", vec![0.0; 2]);
		assert_matches!(
			conv.load_parameters(&hal, &source, "conv"),
			Err(Error::ParameterLength {
				expected: 54,
				actual: 53,
				..
			})
		);

		let input = FeatureMap::zeros(&hal, 4, 5, 5).unwrap();
		assert_matches!(conv.forward(&hal, &input), Err(Error::ShapeMismatch(_)));

		let input = FeatureMap::zeros(&hal, 3, 0, 5).unwrap();
		assert_matches!(
			conv.forward(&hal, &input),
			Err(Error::Math(stylenet_math::Error::NonPositiveDimension { .. }))
		);
	}

	#[test]
	fn test_transient_buffers_are_released() {
		let hal = CpuLayer::default();
		let (mut conv, _, _) = loaded_conv(&hal, 3, 8, Window::square(4, 2, 1), TilePolicy::rows(4));
		let resident = hal.memory().live_bytes();

		let input = FeatureMap::zeros(&hal, 3, 16, 16).unwrap();
		let output = conv.process(&hal, input).unwrap();
		assert_eq!(hal.memory().live_bytes(), resident + 8 * 8 * 8 * 4);

		drop(output);
		assert_eq!(hal.memory().live_bytes(), resident);

		let mut timings = Timings::default();
		conv.accumulate_benchmark(&mut timings);
		assert!(timings.sgemm > std::time::Duration::ZERO);
	}
}

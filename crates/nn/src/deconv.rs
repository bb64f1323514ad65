// Copyright 2025 Irreducible Inc.

use std::{fmt, ops::Range};

use getset::CopyGetters;
use stylenet_compute::{KernelLayer, Region, Transpose};
use stylenet_math::{padded_contraction_len, Activation, Matrix, Window};
use stylenet_utils::ensure;
use tracing::{debug, instrument, trace};

use crate::{
	params::ParameterSource, timing::timed, Error, FeatureMap, Layer, TilePlan, TilePolicy,
	Timings,
};

/// A 2D transposed convolution computed as `col = weights^T x input`, then col2im and a crop of
/// the padding border.
///
/// Weights are stored transposed, `[padded_contraction_len(out_channels * taps), in_channels]`.
/// When tiled, bands of input rows are multiplied separately and scattered into the one
/// full-size padded output.
#[derive(CopyGetters)]
pub struct Deconvolution2D<H: KernelLayer> {
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
	#[getset(get_copy = "pub")]
	output_dims: Option<(usize, usize)>,
	weights: H::Buffer,
	bias: H::Buffer,
	timings: Timings,
}

impl<H: KernelLayer> Deconvolution2D<H> {
	pub fn new(
		hal: &H,
		in_channels: usize,
		out_channels: usize,
		window: Window,
		policy: TilePolicy,
	) -> Result<Self, Error> {
		ensure!(
			in_channels > 0 && out_channels > 0,
			Error::InvalidConfig("transposed convolution needs at least one channel".into())
		);
		ensure!(
			window.stride_y > 0 && window.stride_x > 0,
			Error::Math(stylenet_math::Error::ZeroStride)
		);
		policy.validate()?;

		let col_rows = padded_contraction_len(out_channels * window.taps());
		Ok(Self {
			in_channels,
			out_channels,
			window,
			policy,
			activation: Activation::Identity,
			output_dims: None,
			weights: hal.alloc(col_rows, in_channels)?,
			bias: hal.alloc(out_channels, 1)?,
			timings: Timings::default(),
		})
	}

	pub fn with_activation(mut self, activation: Activation) -> Self {
		self.activation = activation;
		self
	}

	/// Rows of the column buffer that carry window contributions.
	pub fn col_rows(&self) -> usize {
		self.out_channels * self.window.taps()
	}

	pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize), Error> {
		Ok(self.window.deconv_out_dims(height, width)?)
	}

	#[instrument(skip_all, name = "Deconvolution2D::forward", level = "debug")]
	pub fn forward(
		&mut self,
		hal: &H,
		input: &FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		input.expect_channels(self.in_channels, "transposed convolution")?;
		let (height, width) = input.dims();
		let (out_height, out_width) = self.output_size(height, width)?;
		let plan = TilePlan::for_transposed_convolution(self.policy, height)?;
		debug!(
			height,
			width,
			out_height,
			out_width,
			tiles = plan.bands().len(),
			"transposed convolution"
		);

		let (padded_h, padded_w) = self.window.padded_dims(out_height, out_width);
		let mut padded = hal.alloc(self.out_channels, padded_h * padded_w)?;
		let col_rows = padded_contraction_len(self.col_rows());
		let mut col = hal.alloc(col_rows, plan.tile_rows() * width)?;

		if plan.is_whole(height) {
			self.scatter_band(
				hal,
				input.buffer(),
				&mut col,
				0..height,
				width,
				(out_height, out_width),
				&mut padded,
			)?;
		} else {
			let mut tile_input = hal.alloc(self.in_channels, plan.tile_rows() * width)?;
			for (index, band) in plan.bands().iter().enumerate() {
				trace!(index, rows = ?band, "transposed convolution tile");
				let region = Region::columns(0, band.len() * width, self.in_channels);
				timed(hal, &mut self.timings.copy, || {
					hal.copy_2d_range(input.buffer(), band.start * width, 0, &mut tile_input, region)
				})?;
				self.scatter_band(
					hal,
					&tile_input,
					&mut col,
					band.clone(),
					width,
					(out_height, out_width),
					&mut padded,
				)?;
			}
		}
		drop(col);

		let mut output = hal.alloc(self.out_channels, out_height * out_width)?;
		timed(hal, &mut self.timings.col2im, || {
			hal.unpad(&padded, out_height, out_width, &self.window, &mut output)
		})?;
		drop(padded);

		timed(hal, &mut self.timings.bias, || hal.add_bias(&mut output, &self.bias))?;
		if self.activation != Activation::Identity {
			timed(hal, &mut self.timings.activation, || hal.activate(&mut output, self.activation))?;
		}

		self.output_dims = Some((out_height, out_width));
		FeatureMap::new(output, out_height, out_width)
	}

	/// Multiplies the input rows `band`, held at the start of `input`, and scatters them into
	/// the padded output of an `out_dims` image.
	#[allow(clippy::too_many_arguments)]
	fn scatter_band(
		&mut self,
		hal: &H,
		input: &H::Buffer,
		col: &mut H::Buffer,
		band: Range<usize>,
		width: usize,
		out_dims: (usize, usize),
		padded: &mut H::Buffer,
	) -> Result<(), Error> {
		timed(hal, &mut self.timings.sgemm, || {
			hal.sgemm(Transpose::NoTrans, Transpose::NoTrans, 1.0, &self.weights, input, 0.0, col)
		})?;
		let (out_height, out_width) = out_dims;
		timed(hal, &mut self.timings.col2im, || {
			hal.col2im(
				col,
				band.len(),
				width,
				&self.window,
				band.start,
				padded,
				out_height,
				out_width,
			)
		})
	}
}

impl<H: KernelLayer> fmt::Debug for Deconvolution2D<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Deconvolution2D")
			.field("in_channels", &self.in_channels)
			.field("out_channels", &self.out_channels)
			.field("window", &self.window)
			.field("policy", &self.policy)
			.field("activation", &self.activation)
			.finish_non_exhaustive()
	}
}

impl<H: KernelLayer> Layer<H> for Deconvolution2D<H> {
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		let col_rows = self.col_rows();
		let weights = source.read_exact(&format!("{path}/W"), self.in_channels * col_rows)?;
		let bias = source.read_exact(&format!("{path}/b"), self.out_channels)?;

		// Stored as [in_channels, out_channels * taps]; the GEMM wants the transpose.
		let transposed = Matrix::new(self.in_channels, col_rows, &weights)?.transpose();
		let mut staging = hal.alloc(col_rows, self.in_channels)?;
		hal.copy_h2d(transposed.elements(), &mut staging)?;
		hal.copy_2d_range(
			&staging,
			0,
			0,
			&mut self.weights,
			Region::full(col_rows, self.in_channels),
		)?;
		hal.copy_h2d(&bias, &mut self.bias)?;

		debug!(
			path,
			in_channels = self.in_channels,
			out_channels = self.out_channels,
			"loaded transposed convolution"
		);
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

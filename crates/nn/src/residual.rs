// Copyright 2025 Irreducible Inc.

use std::fmt;

use stylenet_compute::KernelLayer;
use stylenet_math::{Activation, Window};
use stylenet_utils::ensure;
use tracing::instrument;

use crate::{
	params::ParameterSource, timing::timed, BatchNormalization, Convolution2D, Error, FeatureMap,
	Layer, TilePolicy, Timings,
};

/// Window of both convolutions of a residual block.
pub const RESIDUAL_WINDOW: Window = Window::square(3, 1, 1);

/// `x + bn2(conv2(relu(bn1(conv1(x)))))` with 3x3 same-size convolutions.
pub struct ResidualBlock<H: KernelLayer> {
	pub(crate) conv1: Convolution2D<H>,
	pub(crate) bn1: BatchNormalization<H>,
	pub(crate) conv2: Convolution2D<H>,
	pub(crate) bn2: BatchNormalization<H>,
	timings: Timings,
}

impl<H: KernelLayer> ResidualBlock<H> {
	pub fn new(hal: &H, channels: usize, policy: TilePolicy, eps: f32) -> Result<Self, Error> {
		Ok(Self {
			conv1: Convolution2D::new(hal, channels, channels, RESIDUAL_WINDOW, policy)?,
			bn1: BatchNormalization::new(hal, channels, eps)?,
			conv2: Convolution2D::new(hal, channels, channels, RESIDUAL_WINDOW, policy)?,
			bn2: BatchNormalization::new(hal, channels, eps)?,
			timings: Timings::default(),
		})
	}

	pub fn channels(&self) -> usize {
		self.conv1.in_channels()
	}

	/// ReLU after the first normalization.
	pub(crate) fn rectify(&mut self, hal: &H, buffer: &mut H::Buffer) -> Result<(), Error> {
		timed(hal, &mut self.timings.activation, || hal.activate(buffer, Activation::Relu))
	}

	pub(crate) fn add_skip(
		&mut self,
		hal: &H,
		buffer: &mut H::Buffer,
		skip: &H::Buffer,
	) -> Result<(), Error> {
		timed(hal, &mut self.timings.residual, || hal.add_assign(buffer, skip))
	}
}

impl<H: KernelLayer> fmt::Debug for ResidualBlock<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ResidualBlock")
			.field("conv1", &self.conv1)
			.field("bn1", &self.bn1)
			.field("conv2", &self.conv2)
			.field("bn2", &self.bn2)
			.finish_non_exhaustive()
	}
}

impl<H: KernelLayer> Layer<H> for ResidualBlock<H> {
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		self.conv1.load_parameters(hal, source, &format!("{path}/c1"))?;
		self.bn1.load_parameters(hal, source, &format!("{path}/b1"))?;
		self.conv2.load_parameters(hal, source, &format!("{path}/c2"))?;
		self.bn2.load_parameters(hal, source, &format!("{path}/b2"))
	}

	#[instrument(skip_all, name = "ResidualBlock::process", level = "debug")]
	fn process(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		let mut y = self.conv1.forward(hal, &input)?;
		self.bn1.apply(hal, y.buffer_mut())?;
		self.rectify(hal, y.buffer_mut())?;
		let mut y = self.conv2.process(hal, y)?;
		self.bn2.apply(hal, y.buffer_mut())?;

		ensure!(
			(y.channels(), y.height(), y.width())
				== (input.channels(), input.height(), input.width()),
			Error::ShapeMismatch(format!(
				"residual branch produced {}x{}x{}, skip is {}x{}x{}",
				y.channels(),
				y.height(),
				y.width(),
				input.channels(),
				input.height(),
				input.width()
			))
		);
		self.add_skip(hal, y.buffer_mut(), input.buffer())?;
		Ok(y)
	}

	fn accumulate_benchmark(&mut self, sink: &mut Timings) {
		self.conv1.accumulate_benchmark(sink);
		self.bn1.accumulate_benchmark(sink);
		self.conv2.accumulate_benchmark(sink);
		self.bn2.accumulate_benchmark(sink);
		self.timings.drain_into(sink);
	}
}

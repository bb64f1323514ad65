// Copyright 2025 Irreducible Inc.

use std::fmt;

use stylenet_compute::KernelLayer;
use stylenet_utils::{bail, ensure};
use tracing::{debug, instrument};

use crate::{
	params::ParameterSource, Error, FeatureMap, Layer, ResidualBlock, TilePolicy, Timings,
};

/// A sequence of residual blocks run on two ping-pong buffers and one shared convolution
/// workspace.
///
/// Produces the same result as running the blocks one after the other, without allocating per
/// block. Every convolution must map images onto images of the same shape.
pub struct ResidualBlockChained<H: KernelLayer> {
	blocks: Vec<ResidualBlock<H>>,
}

impl<H: KernelLayer> ResidualBlockChained<H> {
	pub fn new(
		hal: &H,
		channels: usize,
		count: usize,
		policy: TilePolicy,
		eps: f32,
	) -> Result<Self, Error> {
		let blocks = (0..count)
			.map(|_| ResidualBlock::new(hal, channels, policy, eps))
			.collect::<Result<Vec<_>, _>>()?;
		Self::from_blocks(blocks)
	}

	/// Chains existing blocks, which must all have the same channels, tile policy and
	/// shape-preserving windows.
	pub fn from_blocks(blocks: Vec<ResidualBlock<H>>) -> Result<Self, Error> {
		let Some(first) = blocks.first() else {
			bail!(Error::InvalidConfig("a residual chain needs at least one block".into()));
		};
		let (channels, window, policy) =
			(first.channels(), first.conv1.window(), first.conv1.policy());
		for block in &blocks {
			for conv in [&block.conv1, &block.conv2] {
				ensure!(
					conv.window().preserves_dims(),
					Error::InvalidConfig(format!(
						"residual convolution window {:?} does not preserve the image shape",
						conv.window()
					))
				);
				ensure!(
					conv.in_channels() == channels
						&& conv.out_channels() == channels
						&& conv.window() == window
						&& conv.policy() == policy,
					Error::InvalidConfig(
						"chained residual blocks must share channels, window and tiling".into()
					)
				);
			}
		}
		Ok(Self { blocks })
	}

	pub fn len(&self) -> usize {
		self.blocks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}

	pub fn channels(&self) -> usize {
		self.blocks.first().map_or(0, ResidualBlock::channels)
	}
}

impl<H: KernelLayer> fmt::Debug for ResidualBlockChained<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ResidualBlockChained")
			.field("blocks", &self.blocks)
			.finish()
	}
}

impl<H: KernelLayer> Layer<H> for ResidualBlockChained<H> {
	/// Loads block `i` from `{path}/r{i}`, counting from one.
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		for (i, block) in self.blocks.iter_mut().enumerate() {
			block.load_parameters(hal, source, &format!("{path}/r{}", i + 1))?;
		}
		Ok(())
	}

	#[instrument(skip_all, name = "ResidualBlockChained::process", level = "debug")]
	fn process(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		let channels = self.channels();
		input.expect_channels(channels, "residual chain")?;
		let (height, width) = input.dims();
		let Some(first) = self.blocks.first() else {
			return Ok(input);
		};
		let mut workspace = first.conv1.workspace(hal, height, width)?;
		debug!(blocks = self.blocks.len(), height, width, "chained residual blocks");

		let mut current = input.into_buffer();
		let mut branch = hal.alloc(channels, height * width)?;
		for block in &mut self.blocks {
			block.conv1.forward_into(hal, &current, &mut branch, &mut workspace)?;
			block.bn1.apply(hal, &mut branch)?;
			block.rectify(hal, &mut branch)?;
			block.conv2.forward_in_place(hal, &mut branch, &mut workspace)?;
			block.bn2.apply(hal, &mut branch)?;
			block.add_skip(hal, &mut branch, &current)?;
			std::mem::swap(&mut current, &mut branch);
		}
		drop(branch);

		FeatureMap::new(current, height, width)
	}

	fn accumulate_benchmark(&mut self, sink: &mut Timings) {
		for block in &mut self.blocks {
			block.accumulate_benchmark(sink);
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use stylenet_compute::cpu::CpuLayer;
	use stylenet_compute_test_utils::reference::{random_parameters, Image};
	use stylenet_math::Window;

	use super::*;
	use crate::{params::MemoryParameterSource, Convolution2D};

	const CHANNELS: usize = 128;

	#[test]
	fn test_matches_independent_blocks() {
		let hal = CpuLayer::default();
		let source = MemoryParameterSource::from(random_parameters("m", 11));
		let image = Image::random(CHANNELS, 6, 5, 3);

		for policy in [TilePolicy::Untiled, TilePolicy::rows(4)] {
			let mut chain = ResidualBlockChained::new(&hal, CHANNELS, 5, policy, 0.0).unwrap();
			chain.load_parameters(&hal, &source, "m").unwrap();
			assert_eq!(chain.len(), 5);

			let mut blocks = (1..=5)
				.map(|i| {
					let mut block = ResidualBlock::new(&hal, CHANNELS, policy, 0.0).unwrap();
					block.load_parameters(&hal, &source, &format!("m/r{i}")).unwrap();
					block
				})
				.collect::<Vec<_>>();

			let input = FeatureMap::upload(&hal, &image.data, CHANNELS, 6, 5).unwrap();
			let chained = chain.process(&hal, input).unwrap().download(&hal).unwrap();

			let mut x = FeatureMap::upload(&hal, &image.data, CHANNELS, 6, 5).unwrap();
			for block in &mut blocks {
				x = block.process(&hal, x).unwrap();
			}
			let expected = x.download(&hal).unwrap();
			for (a, e) in chained.iter().zip(&expected) {
				assert!((a - e).abs() <= 1e-5 * e.abs().max(1.0), "{a} != {e}");
			}
		}
	}

	#[test]
	fn test_releases_ping_pong_buffers() {
		let hal = CpuLayer::default();
		let mut chain = ResidualBlockChained::new(&hal, 8, 3, TilePolicy::rows(2), 1e-3).unwrap();
		let resident = hal.memory().live_bytes();

		let input = FeatureMap::zeros(&hal, 8, 5, 5).unwrap();
		let output = chain.process(&hal, input).unwrap();
		assert_eq!(output.dims(), (5, 5));
		assert_eq!(hal.memory().live_bytes(), resident + 8 * 25 * 4);
	}

	#[test]
	fn test_rejects_incompatible_blocks() {
		let hal = CpuLayer::default();
		assert_matches!(
			ResidualBlockChained::<CpuLayer>::from_blocks(vec![]),
			Err(Error::InvalidConfig(_))
		);

		let mut block = ResidualBlock::new(&hal, 4, TilePolicy::Untiled, 0.0).unwrap();
		block.conv2 =
			Convolution2D::new(&hal, 4, 4, Window::square(3, 2, 1), TilePolicy::Untiled).unwrap();
		assert_matches!(
			ResidualBlockChained::from_blocks(vec![block]),
			Err(Error::InvalidConfig(_))
		);

		let blocks = vec![
			ResidualBlock::new(&hal, 4, TilePolicy::Untiled, 0.0).unwrap(),
			ResidualBlock::new(&hal, 4, TilePolicy::rows(8), 0.0).unwrap(),
		];
		assert_matches!(ResidualBlockChained::from_blocks(blocks), Err(Error::InvalidConfig(_)));

		let mut chain = ResidualBlockChained::new(&hal, 4, 2, TilePolicy::Untiled, 0.0).unwrap();
		let input = FeatureMap::zeros(&hal, 3, 4, 4).unwrap();
		assert_matches!(chain.process(&hal, input), Err(Error::ShapeMismatch(_)));
	}
}

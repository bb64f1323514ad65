// Copyright 2025 Irreducible Inc.

use getset::CopyGetters;
use stylenet_compute::{ComputeLayer, DeviceBuffer};
use stylenet_utils::ensure;

use crate::Error;

/// A `channels` x `height` x `width` activation tensor in device memory.
///
/// The buffer has one row per channel holding the row-major spatial plane. Feature maps are
/// moved from stage to stage; dropping one releases its memory.
#[derive(Debug, CopyGetters)]
pub struct FeatureMap<B> {
	buffer: B,
	#[getset(get_copy = "pub")]
	channels: usize,
	#[getset(get_copy = "pub")]
	height: usize,
	#[getset(get_copy = "pub")]
	width: usize,
}

impl<B: DeviceBuffer> FeatureMap<B> {
	pub fn new(buffer: B, height: usize, width: usize) -> Result<Self, Error> {
		ensure!(
			buffer.cols() == height * width,
			Error::ShapeMismatch(format!(
				"buffer with {} columns cannot hold a {height}x{width} plane",
				buffer.cols()
			))
		);
		Ok(Self {
			channels: buffer.rows(),
			buffer,
			height,
			width,
		})
	}

	/// Allocates a zero-filled feature map.
	pub fn zeros<H>(hal: &H, channels: usize, height: usize, width: usize) -> Result<Self, Error>
	where
		H: ComputeLayer<Buffer = B>,
	{
		let buffer = hal.alloc(channels, height * width)?;
		Self::new(buffer, height, width)
	}

	/// Uploads a planar, channel-major host image.
	pub fn upload<H>(
		hal: &H,
		data: &[f32],
		channels: usize,
		height: usize,
		width: usize,
	) -> Result<Self, Error>
	where
		H: ComputeLayer<Buffer = B>,
	{
		ensure!(
			data.len() == channels * height * width,
			Error::ShapeMismatch(format!(
				"{} values do not form a {channels}x{height}x{width} image",
				data.len()
			))
		);
		let mut map = Self::zeros(hal, channels, height, width)?;
		hal.copy_h2d(data, &mut map.buffer)?;
		Ok(map)
	}

	pub fn download<H>(&self, hal: &H) -> Result<Vec<f32>, Error>
	where
		H: ComputeLayer<Buffer = B>,
	{
		let mut data = vec![0.0; self.buffer.len()];
		hal.copy_d2h(&self.buffer, &mut data)?;
		Ok(data)
	}

	pub fn dims(&self) -> (usize, usize) {
		(self.height, self.width)
	}

	pub fn buffer(&self) -> &B {
		&self.buffer
	}

	pub fn buffer_mut(&mut self) -> &mut B {
		&mut self.buffer
	}

	pub fn into_buffer(self) -> B {
		self.buffer
	}

	pub(crate) fn expect_channels(&self, expected: usize, stage: &str) -> Result<(), Error> {
		ensure!(
			self.channels == expected,
			Error::ShapeMismatch(format!(
				"{stage} expects {expected} input channels, got {}",
				self.channels
			))
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use stylenet_compute::cpu::CpuLayer;

	use super::*;

	#[test]
	fn test_upload_download() {
		let hal = CpuLayer::default();
		let data = (0..24).map(|i| i as f32).collect::<Vec<_>>();
		let map = FeatureMap::upload(&hal, &data, 2, 3, 4).unwrap();
		assert_eq!((map.channels(), map.height(), map.width()), (2, 3, 4));
		assert_eq!(map.buffer().rows(), 2);
		assert_eq!(map.download(&hal).unwrap(), data);

		drop(map);
		assert_eq!(hal.memory().live_bytes(), 0);
	}

	#[test]
	fn test_shape_checks() {
		let hal = CpuLayer::default();
		assert_matches!(
			FeatureMap::upload(&hal, &[0.0; 5], 1, 2, 3),
			Err(Error::ShapeMismatch(_))
		);
		let buffer = hal.alloc(3, 10).unwrap();
		assert_matches!(FeatureMap::new(buffer, 3, 3), Err(Error::ShapeMismatch(_)));
	}
}

// Copyright 2025 Irreducible Inc.

use std::fmt;

use getset::CopyGetters;
use stylenet_compute::KernelLayer;
use stylenet_utils::ensure;
use tracing::debug;

use crate::{params::ParameterSource, timing::timed, Error, FeatureMap, Layer, Timings};

/// Per-channel affine normalization with stored statistics,
/// `gamma * (x - avg_mean) / sqrt(avg_var + eps) + beta`, applied in place.
#[derive(CopyGetters)]
pub struct BatchNormalization<H: KernelLayer> {
	#[getset(get_copy = "pub")]
	channels: usize,
	#[getset(get_copy = "pub")]
	eps: f32,
	gamma: H::Buffer,
	beta: H::Buffer,
	mean: H::Buffer,
	var: H::Buffer,
	timings: Timings,
}

impl<H: KernelLayer> BatchNormalization<H> {
	/// Creates the layer with zero statistics; `eps` is added to the variance.
	pub fn new(hal: &H, channels: usize, eps: f32) -> Result<Self, Error> {
		ensure!(
			channels > 0,
			Error::InvalidConfig("batch normalization needs at least one channel".into())
		);
		ensure!(
			eps >= 0.0 && eps.is_finite(),
			Error::InvalidConfig(format!("invalid batch normalization epsilon {eps}"))
		);
		Ok(Self {
			channels,
			eps,
			gamma: hal.alloc(channels, 1)?,
			beta: hal.alloc(channels, 1)?,
			mean: hal.alloc(channels, 1)?,
			var: hal.alloc(channels, 1)?,
			timings: Timings::default(),
		})
	}

	/// Normalizes a `[channels, height * width]` buffer in place.
	pub fn apply(&mut self, hal: &H, buffer: &mut H::Buffer) -> Result<(), Error> {
		timed(hal, &mut self.timings.normalize, || {
			hal.batch_norm(buffer, &self.gamma, &self.beta, &self.mean, &self.var, self.eps)
		})
	}
}

impl<H: KernelLayer> fmt::Debug for BatchNormalization<H> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("BatchNormalization")
			.field("channels", &self.channels)
			.field("eps", &self.eps)
			.finish_non_exhaustive()
	}
}

impl<H: KernelLayer> Layer<H> for BatchNormalization<H> {
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized,
	{
		let slots = [
			("gamma", &mut self.gamma),
			("beta", &mut self.beta),
			("avg_mean", &mut self.mean),
			("avg_var", &mut self.var),
		];
		for (name, buffer) in slots {
			let values = source.read_exact(&format!("{path}/{name}"), self.channels)?;
			hal.copy_h2d(&values, buffer)?;
		}
		debug!(path, channels = self.channels, "loaded batch normalization");
		Ok(())
	}

	fn process(
		&mut self,
		hal: &H,
		mut input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error> {
		input.expect_channels(self.channels, "batch normalization")?;
		self.apply(hal, input.buffer_mut())?;
		Ok(input)
	}

	fn accumulate_benchmark(&mut self, sink: &mut Timings) {
		self.timings.drain_into(sink);
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use stylenet_compute::cpu::CpuLayer;
	use stylenet_compute_test_utils::reference::{batch_norm, Image};

	use super::*;
	use crate::params::MemoryParameterSource;

	fn source(gamma: &[f32], beta: &[f32], mean: &[f32], var: &[f32]) -> MemoryParameterSource {
		let mut source = MemoryParameterSource::new();
		source.insert("b1/gamma", gamma.to_vec());
		source.insert("b1/beta", beta.to_vec());
		source.insert("b1/avg_mean", mean.to_vec());
		source.insert("b1/avg_var", var.to_vec());
		source
	}

	#[test]
	fn test_identity_statistics() {
		let hal = CpuLayer::default();
		let mut norm = BatchNormalization::new(&hal, 2, 0.0).unwrap();
		norm.load_parameters(&hal, &source(&[1.0; 2], &[0.0; 2], &[0.0; 2], &[1.0; 2]), "b1")
			.unwrap();

		let image = Image::random(2, 3, 3, 1);
		let input = FeatureMap::upload(&hal, &image.data, 2, 3, 3).unwrap();
		let output = norm.process(&hal, input).unwrap();
		assert_eq!(output.download(&hal).unwrap(), image.data);
	}

	#[test]
	fn test_matches_reference() {
		let hal = CpuLayer::default();
		let gamma = [0.5, 2.0, 1.0];
		let beta = [0.1, -0.2, 0.0];
		let mean = [1.0, 0.0, -3.0];
		let var = [4.0, 0.25, 1.0];
		let mut norm = BatchNormalization::new(&hal, 3, 1e-5).unwrap();
		norm.load_parameters(&hal, &source(&gamma, &beta, &mean, &var), "b1")
			.unwrap();

		let mut image = Image::random(3, 4, 2, 7);
		let input = FeatureMap::upload(&hal, &image.data, 3, 4, 2).unwrap();
		let output = norm.process(&hal, input).unwrap().download(&hal).unwrap();
		batch_norm(&mut image, &gamma, &beta, &mean, &var, 1e-5);
		for (a, e) in output.iter().zip(&image.data) {
			assert!((a - e).abs() < 1e-5);
		}
	}

	#[test]
	fn test_errors() {
		let hal = CpuLayer::default();
		assert_matches!(BatchNormalization::new(&hal, 2, -1.0), Err(Error::InvalidConfig(_)));

		let mut norm = BatchNormalization::new(&hal, 2, 0.0).unwrap();
		let mut params = source(&[1.0; 2], &[0.0; 2], &[0.0; 2], &[1.0; 2]);
		params.remove("b1/avg_var");
		assert_matches!(norm.load_parameters(&hal, &params, "b1"), Err(Error::ParameterIo { .. }));

		let input = FeatureMap::zeros(&hal, 3, 2, 2).unwrap();
		assert_matches!(norm.process(&hal, input), Err(Error::ShapeMismatch(_)));
	}
}

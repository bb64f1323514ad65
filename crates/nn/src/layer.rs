// Copyright 2025 Irreducible Inc.

use stylenet_compute::KernelLayer;

use crate::{params::ParameterSource, Error, FeatureMap, Timings};

/// A stage of the network.
pub trait Layer<H: KernelLayer> {
	/// Reads this stage's parameters from the arrays below `path` and uploads them.
	fn load_parameters<S>(&mut self, hal: &H, source: &S, path: &str) -> Result<(), Error>
	where
		S: ParameterSource + ?Sized;

	/// Runs the stage on `input`, which is released once the output exists.
	fn process(
		&mut self,
		hal: &H,
		input: FeatureMap<H::Buffer>,
	) -> Result<FeatureMap<H::Buffer>, Error>;

	/// Adds the time spent since the last call to `sink` and resets the counters.
	fn accumulate_benchmark(&mut self, sink: &mut Timings);
}

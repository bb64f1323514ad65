// Copyright 2025 Irreducible Inc.

use std::{
	fmt,
	ops::AddAssign,
	time::{Duration, Instant},
};

use stylenet_compute::ComputeLayer;

use crate::Error;

/// Wall-clock time a layer spent in each kind of backend work.
///
/// Every layer keeps its own counters; callers collect them with
/// [`Layer::accumulate_benchmark`](crate::Layer::accumulate_benchmark), which also resets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
	/// Padding and im2col.
	pub im2col: Duration,
	pub sgemm: Duration,
	/// col2im and cropping.
	pub col2im: Duration,
	/// Tile extraction and assembly.
	pub copy: Duration,
	pub bias: Duration,
	pub normalize: Duration,
	pub activation: Duration,
	/// Skip connections.
	pub residual: Duration,
}

impl Timings {
	pub fn total(&self) -> Duration {
		self.im2col
			+ self.sgemm
			+ self.col2im
			+ self.copy
			+ self.bias
			+ self.normalize
			+ self.activation
			+ self.residual
	}

	/// Adds these counters to `sink` and zeroes them.
	pub fn drain_into(&mut self, sink: &mut Self) {
		*sink += std::mem::take(self);
	}
}

impl AddAssign for Timings {
	fn add_assign(&mut self, rhs: Self) {
		self.im2col += rhs.im2col;
		self.sgemm += rhs.sgemm;
		self.col2im += rhs.col2im;
		self.copy += rhs.copy;
		self.bias += rhs.bias;
		self.normalize += rhs.normalize;
		self.activation += rhs.activation;
		self.residual += rhs.residual;
	}
}

impl fmt::Display for Timings {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let entries = [
			("im2col", self.im2col),
			("sgemm", self.sgemm),
			("col2im", self.col2im),
			("copy", self.copy),
			("bias", self.bias),
			("normalize", self.normalize),
			("activation", self.activation),
			("residual", self.residual),
		];
		for (name, duration) in entries {
			writeln!(f, "{name:>12}: {:>10.3} ms", duration.as_secs_f64() * 1e3)?;
		}
		write!(f, "{:>12}: {:>10.3} ms", "total", self.total().as_secs_f64() * 1e3)
	}
}

/// Runs one backend operation and charges its duration, including completion, to `slot`.
pub(crate) fn timed<H, T>(
	hal: &H,
	slot: &mut Duration,
	op: impl FnOnce() -> Result<T, stylenet_compute::Error>,
) -> Result<T, Error>
where
	H: ComputeLayer,
{
	let start = Instant::now();
	let out = op()?;
	hal.finish()?;
	*slot += start.elapsed();
	Ok(out)
}

// Copyright 2024 Irreducible Inc.

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("argument {arg} does not have expected length {expected}")]
	IncorrectArgumentLength { arg: String, expected: usize },
	#[error("stride must be non-zero")]
	ZeroStride,
	#[error(
		"{op} output size is non-positive for input size {size} \
		 (kernel {kernel}, stride {stride}, pad {pad})"
	)]
	NonPositiveDimension {
		op: &'static str,
		size: usize,
		kernel: usize,
		stride: usize,
		pad: usize,
	},
}

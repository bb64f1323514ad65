// Copyright 2025 Irreducible Inc.

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("compute error: {0}")]
	Compute(#[from] stylenet_compute::Error),
	#[error("math error: {0}")]
	Math(#[from] stylenet_math::Error),
	#[error("failed to read parameter {path}: {source}")]
	ParameterIo {
		path: String,
		source: std::io::Error,
	},
	#[error("parameter {path} holds {actual} values, expected {expected}")]
	ParameterLength {
		path: String,
		expected: usize,
		actual: usize,
	},
	#[error("parameter {path} is {bytes} bytes, not a whole number of f32 values")]
	ParameterEncoding { path: String, bytes: usize },
	#[error("model parameters have not been loaded")]
	NotLoaded,
	#[error("shape mismatch: {0}")]
	ShapeMismatch(String),
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
}

// Copyright 2025 Irreducible Inc.

//! Sources of trained parameter arrays.
//!
//! A parameter is a flat array of native-endian `f32` values without any header, addressed by a
//! slash-separated path such as `candy/r3/b1/avg_var`.

use std::{
	collections::BTreeMap,
	io,
	mem::size_of,
	path::{Path, PathBuf},
};

use auto_impl::auto_impl;
use stylenet_utils::ensure;
use tracing::debug;

use crate::Error;

#[auto_impl(&, Box)]
pub trait ParameterSource {
	/// Reads the whole array stored at `path`.
	fn read(&self, path: &str) -> Result<Vec<f32>, Error>;

	/// Reads the array at `path` and checks that it holds exactly `expected` values.
	fn read_exact(&self, path: &str, expected: usize) -> Result<Vec<f32>, Error> {
		let values = self.read(path)?;
		ensure!(
			values.len() == expected,
			Error::ParameterLength {
				path: path.to_string(),
				expected,
				actual: values.len(),
			}
		);
		Ok(values)
	}
}

/// Decodes a raw parameter file.
pub fn decode_f32(path: &str, bytes: &[u8]) -> Result<Vec<f32>, Error> {
	ensure!(
		bytes.len() % size_of::<f32>() == 0,
		Error::ParameterEncoding {
			path: path.to_string(),
			bytes: bytes.len(),
		}
	);
	Ok(bytemuck::pod_collect_to_vec(bytes))
}

/// Parameters stored as one file per array below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryParameterSource {
	root: PathBuf,
}

impl DirectoryParameterSource {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}
}

impl ParameterSource for DirectoryParameterSource {
	fn read(&self, path: &str) -> Result<Vec<f32>, Error> {
		let file = path
			.split('/')
			.fold(self.root.clone(), |file, segment| file.join(segment));
		let bytes = std::fs::read(&file).map_err(|source| Error::ParameterIo {
			path: path.to_string(),
			source,
		})?;
		debug!(path, bytes = bytes.len(), "read parameter file");
		decode_f32(path, &bytes)
	}
}

/// Parameters held in memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemoryParameterSource {
	arrays: BTreeMap<String, Vec<f32>>,
}

impl MemoryParameterSource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, path: impl Into<String>, values: Vec<f32>) {
		self.arrays.insert(path.into(), values);
	}

	pub fn remove(&mut self, path: &str) -> Option<Vec<f32>> {
		self.arrays.remove(path)
	}

	pub fn get_mut(&mut self, path: &str) -> Option<&mut Vec<f32>> {
		self.arrays.get_mut(path)
	}

	pub fn len(&self) -> usize {
		self.arrays.len()
	}

	pub fn is_empty(&self) -> bool {
		self.arrays.is_empty()
	}
}

impl From<BTreeMap<String, Vec<f32>>> for MemoryParameterSource {
	fn from(arrays: BTreeMap<String, Vec<f32>>) -> Self {
		Self { arrays }
	}
}

impl FromIterator<(String, Vec<f32>)> for MemoryParameterSource {
	fn from_iter<T: IntoIterator<Item = (String, Vec<f32>)>>(iter: T) -> Self {
		Self {
			arrays: iter.into_iter().collect(),
		}
	}
}

impl ParameterSource for MemoryParameterSource {
	fn read(&self, path: &str) -> Result<Vec<f32>, Error> {
		self.arrays
			.get(path)
			.cloned()
			.ok_or_else(|| Error::ParameterIo {
				path: path.to_string(),
				source: io::Error::new(io::ErrorKind::NotFound, "no such parameter"),
			})
	}
}

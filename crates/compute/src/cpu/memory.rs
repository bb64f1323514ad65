// Copyright 2025 Irreducible Inc.

use std::mem::size_of;

use crate::{alloc::MemoryLease, memory::DeviceBuffer};

/// A row-major buffer in host memory.
#[derive(Debug)]
pub struct CpuBuffer {
	data: Vec<f32>,
	rows: usize,
	cols: usize,
	_lease: MemoryLease,
}

impl CpuBuffer {
	pub(super) fn zeroed(rows: usize, cols: usize, lease: MemoryLease) -> Self {
		debug_assert_eq!(lease.bytes(), Self::size_in_bytes(rows, cols));
		Self {
			data: vec![0.0; rows * cols],
			rows,
			cols,
			_lease: lease,
		}
	}

	pub(super) const fn size_in_bytes(rows: usize, cols: usize) -> usize {
		rows * cols * size_of::<f32>()
	}

	pub fn as_slice(&self) -> &[f32] {
		&self.data
	}

	pub fn as_mut_slice(&mut self) -> &mut [f32] {
		&mut self.data
	}

	pub fn row(&self, i: usize) -> &[f32] {
		&self.data[i * self.cols..(i + 1) * self.cols]
	}
}

impl DeviceBuffer for CpuBuffer {
	fn rows(&self) -> usize {
		self.rows
	}

	fn cols(&self) -> usize {
		self.cols
	}

	fn len(&self) -> usize {
		self.data.len()
	}
}

// Copyright 2025 Irreducible Inc.

use std::{mem::size_of, sync::Arc};

use rayon::prelude::*;
use stylenet_utils::{bail, ensure};
use tracing::{trace, warn};

use super::{
	gemm::{self, MatRef},
	memory::CpuBuffer,
};
use crate::{
	alloc::MemoryTracker,
	layer::{ComputeLayer, Error, Transpose},
	memory::{DeviceBuffer, Region},
};

#[derive(Debug, Default, Clone)]
pub struct CpuLayer {
	memory: Arc<MemoryTracker>,
}

impl CpuLayer {
	/// A backend whose allocations fail once `bytes` bytes are live.
	pub fn with_memory_limit(bytes: usize) -> Self {
		Self {
			memory: Arc::new(MemoryTracker::with_limit(bytes)),
		}
	}

	pub fn memory(&self) -> &MemoryTracker {
		&self.memory
	}
}

fn check_len(what: &str, actual: usize, expected: usize) -> Result<(), Error> {
	ensure!(
		actual == expected,
		Error::InputValidation(format!("{what} has length {actual}, expected {expected}"))
	);
	Ok(())
}

fn mat_ref(buffer: &CpuBuffer) -> MatRef<'_> {
	MatRef {
		data: buffer.as_slice(),
		rows: buffer.rows(),
		cols: buffer.cols(),
	}
}

impl ComputeLayer for CpuLayer {
	type Buffer = CpuBuffer;

	fn alloc(&self, rows: usize, cols: usize) -> Result<CpuBuffer, Error> {
		let Some(bytes) = rows
			.checked_mul(cols)
			.and_then(|len| len.checked_mul(size_of::<f32>()))
		else {
			bail!(Error::InputValidation(format!("{rows}x{cols} buffer size overflows")));
		};
		debug_assert_eq!(bytes, CpuBuffer::size_in_bytes(rows, cols));

		let lease = self
			.memory
			.acquire(bytes)
			.inspect_err(|err| warn!(rows, cols, %err, "device allocation failed"))?;
		trace!(rows, cols, live_bytes = self.memory.live_bytes(), "allocated buffer");
		Ok(CpuBuffer::zeroed(rows, cols, lease))
	}

	fn copy_h2d(&self, src: &[f32], dst: &mut CpuBuffer) -> Result<(), Error> {
		check_len("host source", src.len(), dst.len())?;
		dst.as_mut_slice().copy_from_slice(src);
		Ok(())
	}

	fn copy_d2h(&self, src: &CpuBuffer, dst: &mut [f32]) -> Result<(), Error> {
		check_len("host destination", dst.len(), src.len())?;
		dst.copy_from_slice(src.as_slice());
		Ok(())
	}

	fn copy_2d_range(
		&self,
		src: &CpuBuffer,
		src_x: usize,
		src_y: usize,
		dst: &mut CpuBuffer,
		region: Region,
	) -> Result<(), Error> {
		let src_region = Region {
			x: src_x,
			y: src_y,
			..region
		};
		ensure!(
			src_region.fits_in(src.rows(), src.cols()),
			Error::InputValidation(format!(
				"source range {src_region:?} exceeds {}x{} buffer",
				src.rows(),
				src.cols()
			))
		);
		ensure!(
			region.fits_in(dst.rows(), dst.cols()),
			Error::InputValidation(format!(
				"destination range {region:?} exceeds {}x{} buffer",
				dst.rows(),
				dst.cols()
			))
		);

		let (src_cols, dst_cols) = (src.cols(), dst.cols());
		let src_data = src.as_slice();
		let dst_data = dst.as_mut_slice();
		for row in 0..region.height {
			let from = (src_y + row) * src_cols + src_x;
			let to = (region.y + row) * dst_cols + region.x;
			dst_data[to..to + region.width].copy_from_slice(&src_data[from..from + region.width]);
		}
		Ok(())
	}

	fn fill(&self, buffer: &mut CpuBuffer, value: f32) -> Result<(), Error> {
		buffer.as_mut_slice().par_iter_mut().for_each(|x| *x = value);
		Ok(())
	}

	fn sgemm(
		&self,
		trans_a: Transpose,
		trans_b: Transpose,
		alpha: f32,
		a: &CpuBuffer,
		b: &CpuBuffer,
		beta: f32,
		c: &mut CpuBuffer,
	) -> Result<(), Error> {
		let (m, k) = trans_a.apply(a.rows(), a.cols());
		let (k_b, n) = trans_b.apply(b.rows(), b.cols());
		ensure!(
			k == k_b && c.rows() == m && c.cols() == n,
			Error::InputValidation(format!(
				"sgemm shapes: op(a) is {m}x{k}, op(b) is {k_b}x{n}, c is {}x{}",
				c.rows(),
				c.cols()
			))
		);

		gemm::sgemm(trans_a, trans_b, alpha, mat_ref(a), mat_ref(b), beta, c.as_mut_slice());
		Ok(())
	}
}

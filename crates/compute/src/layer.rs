// Copyright 2025 Irreducible Inc.

use std::ops::Range;

use stylenet_math::{Activation, Window};
use stylenet_utils::ensure;

use super::{
	alloc::Error as AllocError,
	memory::{DeviceBuffer, Region},
};

/// Whether a GEMM operand is read as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
	NoTrans,
	Trans,
}

impl Transpose {
	/// Dimensions of `op(X)` for a stored `rows` x `cols` matrix `X`.
	pub const fn apply(self, rows: usize, cols: usize) -> (usize, usize) {
		match self {
			Self::NoTrans => (rows, cols),
			Self::Trans => (cols, rows),
		}
	}
}

/// A hardware abstraction layer (HAL) for the memory and matrix operations of a forward pass.
///
/// All calls are synchronous from the caller's point of view; a backend that queues work must
/// make results visible before a transfer back to the host returns.
pub trait ComputeLayer {
	/// The device memory.
	type Buffer: DeviceBuffer;

	/// Allocates a zero-filled `rows` x `cols` buffer.
	///
	/// The memory is released when the buffer is dropped.
	///
	/// ## Throws
	///
	/// * [`Error::Alloc`] when the device budget is exhausted
	fn alloc(&self, rows: usize, cols: usize) -> Result<Self::Buffer, Error>;

	/// Copy data from the host to the device.
	///
	/// ## Preconditions
	///
	/// * `src` and `dst` must have the same length.
	fn copy_h2d(&self, src: &[f32], dst: &mut Self::Buffer) -> Result<(), Error>;

	/// Copy data from the device to the host.
	///
	/// ## Preconditions
	///
	/// * `src` and `dst` must have the same length.
	fn copy_d2h(&self, src: &Self::Buffer, dst: &mut [f32]) -> Result<(), Error>;

	/// Copies the `region.height` x `region.width` rectangle of `src` whose top-left corner is
	/// `(src_y, src_x)` into `region` of `dst`.
	fn copy_2d_range(
		&self,
		src: &Self::Buffer,
		src_x: usize,
		src_y: usize,
		dst: &mut Self::Buffer,
		region: Region,
	) -> Result<(), Error>;

	/// Copy data between disjoint device buffers of the same shape.
	fn copy_d2d(&self, src: &Self::Buffer, dst: &mut Self::Buffer) -> Result<(), Error> {
		ensure!(
			src.rows() == dst.rows() && src.cols() == dst.cols(),
			Error::InputValidation(format!(
				"copy between {}x{} and {}x{} buffers",
				src.rows(),
				src.cols(),
				dst.rows(),
				dst.cols()
			))
		);
		self.copy_2d_range(src, 0, 0, dst, Region::full(src.rows(), src.cols()))
	}

	fn fill(&self, buffer: &mut Self::Buffer, value: f32) -> Result<(), Error>;

	/// Single-precision general matrix multiply, `c = alpha * op(a) * op(b) + beta * c`.
	///
	/// When `beta` is zero the previous contents of `c` are ignored, even if they are not finite.
	/// Every product term is accumulated, so non-finite entries of `a` or `b` propagate into `c`
	/// even where the matching entry of the other operand is zero.
	#[allow(clippy::too_many_arguments)]
	fn sgemm(
		&self,
		trans_a: Transpose,
		trans_b: Transpose,
		alpha: f32,
		a: &Self::Buffer,
		b: &Self::Buffer,
		beta: f32,
		c: &mut Self::Buffer,
	) -> Result<(), Error>;

	/// Blocks until all previously issued work has completed.
	fn finish(&self) -> Result<(), Error> {
		Ok(())
	}
}

/// Data-layout and element-wise kernels run between the matrix multiplications.
///
/// Images are feature-map buffers: one row per channel, `height * width` columns. A padded image
/// has the border of the [`Window`] added on every side.
pub trait KernelLayer: ComputeLayer {
	/// Writes `image` into the center of `padded`; the border is left as is.
	fn pad(
		&self,
		image: &Self::Buffer,
		height: usize,
		width: usize,
		window: &Window,
		padded: &mut Self::Buffer,
	) -> Result<(), Error>;

	/// Crops the border of `padded` into `image`, `height` x `width` being the cropped size.
	fn unpad(
		&self,
		padded: &Self::Buffer,
		height: usize,
		width: usize,
		window: &Window,
		image: &mut Self::Buffer,
	) -> Result<(), Error>;

	/// Unfolds the convolution windows of the output rows `out_rows` of a padded
	/// `height` x `width` image.
	///
	/// Output location `(oh, ow)` becomes row `(oh - out_rows.start) * out_w + ow` of `col`, its
	/// first `channels * taps` columns in `(channel, kernel row, kernel column)` order. Columns
	/// past those are not written.
	fn im2col(
		&self,
		padded: &Self::Buffer,
		height: usize,
		width: usize,
		window: &Window,
		out_rows: Range<usize>,
		col: &mut Self::Buffer,
	) -> Result<(), Error>;

	/// Scatter-adds the window contributions in `col` onto a padded image whose unpadded size is
	/// `height` x `width`.
	///
	/// Row `(channel, kernel row, kernel column)` of `col` holds, at column `ih * col_w + iw`,
	/// the contribution of input location `(row_offset + ih, iw)`.
	#[allow(clippy::too_many_arguments)]
	fn col2im(
		&self,
		col: &Self::Buffer,
		col_h: usize,
		col_w: usize,
		window: &Window,
		row_offset: usize,
		padded: &mut Self::Buffer,
		height: usize,
		width: usize,
	) -> Result<(), Error>;

	/// Adds `bias[r]` to every element of row `r`; `bias` is a column vector.
	fn add_bias(&self, buffer: &mut Self::Buffer, bias: &Self::Buffer) -> Result<(), Error>;

	/// Normalizes every row with its own statistics,
	/// `gamma * (x - mean) / sqrt(var + eps) + beta`.
	#[allow(clippy::too_many_arguments)]
	fn batch_norm(
		&self,
		buffer: &mut Self::Buffer,
		gamma: &Self::Buffer,
		beta: &Self::Buffer,
		mean: &Self::Buffer,
		var: &Self::Buffer,
		eps: f32,
	) -> Result<(), Error>;

	fn activate(&self, buffer: &mut Self::Buffer, activation: Activation) -> Result<(), Error>;

	/// Element-wise `dst += src`.
	fn add_assign(&self, dst: &mut Self::Buffer, src: &Self::Buffer) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("input validation: {0}")]
	InputValidation(String),
	#[error("allocation error: {0}")]
	Alloc(#[from] AllocError),
	#[error("device error: {0}")]
	DeviceError(Box<dyn std::error::Error + Send + Sync + 'static>),
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::cpu::CpuLayer;

	#[test]
	fn test_transpose_dims() {
		assert_eq!(Transpose::NoTrans.apply(2, 3), (2, 3));
		assert_eq!(Transpose::Trans.apply(2, 3), (3, 2));
	}

	#[test]
	fn test_copy_d2d_rejects_shape_mismatch() {
		let hal = CpuLayer::default();
		let src = hal.alloc(2, 3).unwrap();
		let mut dst = hal.alloc(3, 2).unwrap();
		assert_matches!(hal.copy_d2d(&src, &mut dst), Err(Error::InputValidation(_)));
	}

	#[test]
	fn test_out_of_memory_surfaces_as_alloc_error() {
		let hal = CpuLayer::with_memory_limit(64);
		let _held = hal.alloc(4, 4).unwrap();
		assert_matches!(hal.alloc(1, 1), Err(Error::Alloc(AllocError::OutOfMemory { .. })));
	}
}

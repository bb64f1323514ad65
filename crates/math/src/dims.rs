// Copyright 2024 Irreducible Inc.

use stylenet_utils::{bail, checked_arithmetics::round_up_to_multiple, ensure};

use crate::Error;

/// Vectorized GEMM implementations require the contraction dimension to be a multiple of this.
pub const GEMM_ALIGNMENT: usize = 8;

/// Output size of a convolution along one axis, `floor((size + 2p - k) / s) + 1`.
///
/// ## Throws
///
/// * [`Error::ZeroStride`] if `stride` is zero
/// * [`Error::NonPositiveDimension`] if the kernel does not fit in the padded input
pub fn conv_outsize(size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize, Error> {
	ensure!(stride != 0, Error::ZeroStride);

	let span = size + 2 * pad;
	if size == 0 || span < kernel {
		bail!(Error::NonPositiveDimension {
			op: "convolution",
			size,
			kernel,
			stride,
			pad,
		});
	}
	Ok((span - kernel) / stride + 1)
}

/// Output size of a transposed convolution along one axis, `s * (size - 1) + k - 2p`.
///
/// ## Throws
///
/// * [`Error::ZeroStride`] if `stride` is zero
/// * [`Error::NonPositiveDimension`] if the cropped output would be empty
pub fn deconv_outsize(
	size: usize,
	kernel: usize,
	stride: usize,
	pad: usize,
) -> Result<usize, Error> {
	ensure!(stride != 0, Error::ZeroStride);

	let full = if size == 0 {
		0
	} else {
		stride * (size - 1) + kernel
	};
	if full <= 2 * pad {
		bail!(Error::NonPositiveDimension {
			op: "transposed convolution",
			size,
			kernel,
			stride,
			pad,
		});
	}
	Ok(full - 2 * pad)
}

/// Width of a contraction dimension after zero-padding it to [`GEMM_ALIGNMENT`].
pub const fn padded_contraction_len(len: usize) -> usize {
	round_up_to_multiple(len, GEMM_ALIGNMENT)
}

/// Sliding-window geometry of a 2D (transposed) convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
	pub kernel_h: usize,
	pub kernel_w: usize,
	pub stride_y: usize,
	pub stride_x: usize,
	pub pad_h: usize,
	pub pad_w: usize,
}

impl Window {
	/// Square kernel with the same stride and padding along both axes.
	pub const fn square(kernel: usize, stride: usize, pad: usize) -> Self {
		Self {
			kernel_h: kernel,
			kernel_w: kernel,
			stride_y: stride,
			stride_x: stride,
			pad_h: pad,
			pad_w: pad,
		}
	}

	/// Number of kernel taps per channel.
	pub const fn taps(&self) -> usize {
		self.kernel_h * self.kernel_w
	}

	/// Dimensions of an `h` x `w` image after bordering it with the padding.
	pub const fn padded_dims(&self, h: usize, w: usize) -> (usize, usize) {
		(h + 2 * self.pad_h, w + 2 * self.pad_w)
	}

	pub fn conv_out_dims(&self, h: usize, w: usize) -> Result<(usize, usize), Error> {
		Ok((
			conv_outsize(h, self.kernel_h, self.stride_y, self.pad_h)?,
			conv_outsize(w, self.kernel_w, self.stride_x, self.pad_w)?,
		))
	}

	pub fn deconv_out_dims(&self, h: usize, w: usize) -> Result<(usize, usize), Error> {
		Ok((
			deconv_outsize(h, self.kernel_h, self.stride_y, self.pad_h)?,
			deconv_outsize(w, self.kernel_w, self.stride_x, self.pad_w)?,
		))
	}

	/// Whether a convolution with this window maps every `h` x `w` image onto itself.
	pub const fn preserves_dims(&self) -> bool {
		self.stride_y == 1
			&& self.stride_x == 1
			&& self.kernel_h == 2 * self.pad_h + 1
			&& self.kernel_w == 2 * self.pad_w + 1
	}
}

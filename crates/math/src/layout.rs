// Copyright 2024 Irreducible Inc.

//! Data rearrangement between planar images and GEMM operands.
//!
//! Images are planar and channel-major: element `(c, y, x)` of a `channels` x `h` x `w` image
//! lives at `(c * h + y) * w + x`.

use std::ops::Range;

use stylenet_utils::bail;

use crate::{Error, Window};

fn check_len(arg: &str, data: &[f32], expected: usize) -> Result<(), Error> {
	if data.len() != expected {
		bail!(Error::IncorrectArgumentLength {
			arg: arg.into(),
			expected,
		});
	}
	Ok(())
}

/// Copies `image` into the center of `padded`, leaving the border untouched.
///
/// ## Preconditions
///
/// * `image.len() == channels * h * w`
/// * `padded.len() == channels * (h + 2 * pad_h) * (w + 2 * pad_w)`
pub fn pad_into(
	image: &[f32],
	channels: usize,
	h: usize,
	w: usize,
	pad_h: usize,
	pad_w: usize,
	padded: &mut [f32],
) {
	let padded_h = h + 2 * pad_h;
	let padded_w = w + 2 * pad_w;
	debug_assert_eq!(image.len(), channels * h * w);
	debug_assert_eq!(padded.len(), channels * padded_h * padded_w);

	for c in 0..channels {
		for y in 0..h {
			let src = (c * h + y) * w;
			let dst = (c * padded_h + y + pad_h) * padded_w + pad_w;
			padded[dst..dst + w].copy_from_slice(&image[src..src + w]);
		}
	}
}

/// Crops the `pad_h`/`pad_w` border off `padded` into `image`.
pub fn unpad_into(
	padded: &[f32],
	channels: usize,
	h: usize,
	w: usize,
	pad_h: usize,
	pad_w: usize,
	image: &mut [f32],
) {
	let padded_h = h + 2 * pad_h;
	let padded_w = w + 2 * pad_w;
	debug_assert_eq!(image.len(), channels * h * w);
	debug_assert_eq!(padded.len(), channels * padded_h * padded_w);

	for c in 0..channels {
		for y in 0..h {
			let src = (c * padded_h + y + pad_h) * padded_w + pad_w;
			let dst = (c * h + y) * w;
			image[dst..dst + w].copy_from_slice(&padded[src..src + w]);
		}
	}
}

/// Returns `image` bordered with `pad_h` rows and `pad_w` columns of zeros on each side.
pub fn pad(
	image: &[f32],
	channels: usize,
	h: usize,
	w: usize,
	pad_h: usize,
	pad_w: usize,
) -> Result<Vec<f32>, Error> {
	check_len("image", image, channels * h * w)?;

	let mut padded = vec![0.0; channels * (h + 2 * pad_h) * (w + 2 * pad_w)];
	pad_into(image, channels, h, w, pad_h, pad_w, &mut padded);
	Ok(padded)
}

/// Inverse of [`pad`]: `h` and `w` are the dimensions of the image without its border.
pub fn unpad(
	padded: &[f32],
	channels: usize,
	h: usize,
	w: usize,
	pad_h: usize,
	pad_w: usize,
) -> Result<Vec<f32>, Error> {
	check_len("padded", padded, channels * (h + 2 * pad_h) * (w + 2 * pad_w))?;

	let mut image = vec![0.0; channels * h * w];
	unpad_into(padded, channels, h, w, pad_h, pad_w, &mut image);
	Ok(image)
}

/// Unfolds the sliding windows for a band of output rows of an already padded image.
///
/// Each output location `(oh, ow)` with `oh` in `out_rows` becomes one row of `col`, starting at
/// `((oh - out_rows.start) * out_w + ow) * col_stride`. The row holds `channels * taps` values in
/// `(channel, kernel row, kernel column)` order; entries past that up to `col_stride` are left
/// untouched, so the GEMM alignment padding stays zero across calls.
///
/// The loops run output row, output column, channel, kernel row, each kernel row being a single
/// contiguous `kernel_w` copy out of the padded image.
#[allow(clippy::too_many_arguments)]
pub fn im2col_rows(
	padded: &[f32],
	channels: usize,
	padded_h: usize,
	padded_w: usize,
	window: &Window,
	out_rows: Range<usize>,
	out_w: usize,
	col: &mut [f32],
	col_stride: usize,
) {
	let taps = window.taps();
	debug_assert!(col_stride >= channels * taps);
	debug_assert!(col.len() >= out_rows.len() * out_w * col_stride);
	debug_assert_eq!(padded.len(), channels * padded_h * padded_w);

	let first_row = out_rows.start;
	for oh in out_rows {
		let img_y = oh * window.stride_y;
		for ow in 0..out_w {
			let img_x = ow * window.stride_x;
			let col_row = ((oh - first_row) * out_w + ow) * col_stride;
			for c in 0..channels {
				let img_start = (c * padded_h + img_y) * padded_w + img_x;
				let col_start = col_row + c * taps;
				for kh in 0..window.kernel_h {
					let src = img_start + kh * padded_w;
					let dst = col_start + kh * window.kernel_w;
					col[dst..dst + window.kernel_w]
						.copy_from_slice(&padded[src..src + window.kernel_w]);
				}
			}
		}
	}
}

/// Scatter-adds a column matrix back into a padded image.
///
/// `col` holds `channels * taps` rows of `col_stride` elements each. Within a row, entry
/// `ih * col_w + iw` is the contribution of input location `(row_offset + ih, iw)` for that
/// `(channel, kernel row, kernel column)` tap. Contributions are added to `padded`, never
/// written over, so overlapping windows and successive row bands accumulate.
#[allow(clippy::too_many_arguments)]
pub fn col2im_accumulate(
	col: &[f32],
	channels: usize,
	col_h: usize,
	col_w: usize,
	col_stride: usize,
	window: &Window,
	row_offset: usize,
	padded: &mut [f32],
	padded_h: usize,
	padded_w: usize,
) {
	let taps = window.taps();
	debug_assert!(col_stride >= col_h * col_w);
	debug_assert!(col.len() >= channels * taps * col_stride);
	debug_assert_eq!(padded.len(), channels * padded_h * padded_w);

	for c in 0..channels {
		let img_start = c * padded_h * padded_w;
		for kh in 0..window.kernel_h {
			for kw in 0..window.kernel_w {
				let col_start = (c * taps + kh * window.kernel_w + kw) * col_stride;
				for ih in 0..col_h {
					let img_row =
						img_start + ((row_offset + ih) * window.stride_y + kh) * padded_w + kw;
					let src = &col[col_start + ih * col_w..col_start + (ih + 1) * col_w];
					for (iw, &value) in src.iter().enumerate() {
						padded[img_row + iw * window.stride_x] += value;
					}
				}
			}
		}
	}
}

/// Unfolds every convolution window of `image` into a `[out_h * out_w, channels * taps]` matrix.
///
/// Returns the column matrix together with the output dimensions.
pub fn im2col(
	image: &[f32],
	channels: usize,
	h: usize,
	w: usize,
	window: &Window,
) -> Result<(Vec<f32>, usize, usize), Error> {
	let (out_h, out_w) = window.conv_out_dims(h, w)?;
	let (padded_h, padded_w) = window.padded_dims(h, w);
	let padded = pad(image, channels, h, w, window.pad_h, window.pad_w)?;

	let row_len = channels * window.taps();
	let mut col = vec![0.0; out_h * out_w * row_len];
	im2col_rows(
		&padded,
		channels,
		padded_h,
		padded_w,
		window,
		0..out_h,
		out_w,
		&mut col,
		row_len,
	);
	Ok((col, out_h, out_w))
}

/// Folds a `[channels * taps, col_h * col_w]` matrix into an image by summing the windows.
///
/// Returns the image together with its dimensions, `deconv_outsize` of the column dimensions.
pub fn col2im(
	col: &[f32],
	channels: usize,
	col_h: usize,
	col_w: usize,
	window: &Window,
) -> Result<(Vec<f32>, usize, usize), Error> {
	check_len("col", col, channels * window.taps() * col_h * col_w)?;

	let (img_h, img_w) = window.deconv_out_dims(col_h, col_w)?;
	let (padded_h, padded_w) = window.padded_dims(img_h, img_w);
	let mut padded = vec![0.0; channels * padded_h * padded_w];
	col2im_accumulate(
		col,
		channels,
		col_h,
		col_w,
		col_h * col_w,
		window,
		0,
		&mut padded,
		padded_h,
		padded_w,
	);

	let image = unpad(&padded, channels, img_h, img_w, window.pad_h, window.pad_w)?;
	Ok((image, img_h, img_w))
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use proptest::prelude::*;
	use rand::{prelude::StdRng, Rng, SeedableRng};

	use super::*;
	use crate::Matrix;

	fn random_image(len: usize, seed: u64) -> Vec<f32> {
		let mut rng = StdRng::seed_from_u64(seed);
		(0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
	}

	#[test]
	fn test_pad_places_image_in_center() {
		let image = [1.0, 2.0, 3.0, 4.0];
		let padded = pad(&image, 1, 2, 2, 1, 2).unwrap();
		#[rustfmt::skip]
		let expected = [
			0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
			0.0, 0.0, 1.0, 2.0, 0.0, 0.0,
			0.0, 0.0, 3.0, 4.0, 0.0, 0.0,
			0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
		];
		assert_eq!(padded, expected);
	}

	#[test]
	fn test_pad_keeps_channels_apart() {
		let image = [1.0, 2.0];
		let padded = pad(&image, 2, 1, 1, 1, 0).unwrap();
		assert_eq!(padded, [0.0, 1.0, 0.0, 0.0, 2.0, 0.0]);
	}

	#[test]
	fn test_pad_rejects_wrong_length() {
		assert_matches!(
			pad(&[0.0; 5], 1, 2, 2, 1, 1),
			Err(Error::IncorrectArgumentLength { expected: 4, .. })
		);
	}

	#[test]
	fn test_im2col_single_channel() {
		#[rustfmt::skip]
		let image = [
			1.0, 2.0, 3.0,
			4.0, 5.0, 6.0,
			7.0, 8.0, 9.0,
		];
		let (col, out_h, out_w) = im2col(&image, 1, 3, 3, &Window::square(2, 1, 0)).unwrap();
		assert_eq!((out_h, out_w), (2, 2));
		#[rustfmt::skip]
		let expected = [
			1.0, 2.0, 4.0, 5.0,
			2.0, 3.0, 5.0, 6.0,
			4.0, 5.0, 7.0, 8.0,
			5.0, 6.0, 8.0, 9.0,
		];
		assert_eq!(col, expected);
	}

	#[test]
	fn test_im2col_with_padding_and_stride() {
		let image = [1.0, 2.0, 3.0, 4.0];
		let (col, out_h, out_w) = im2col(&image, 1, 2, 2, &Window::square(2, 2, 1)).unwrap();
		assert_eq!((out_h, out_w), (2, 2));
		#[rustfmt::skip]
		let expected = [
			0.0, 0.0, 0.0, 1.0,
			0.0, 0.0, 2.0, 0.0,
			0.0, 3.0, 0.0, 0.0,
			4.0, 0.0, 0.0, 0.0,
		];
		assert_eq!(col, expected);
	}

	#[test]
	fn test_im2col_rows_leaves_alignment_padding() {
		let image = random_image(2 * 4 * 4, 1);
		let window = Window::square(3, 1, 1);
		let padded = pad(&image, 2, 4, 4, 1, 1).unwrap();
		let col_stride = 24;
		let mut col = vec![0.0; 4 * 4 * col_stride];
		im2col_rows(&padded, 2, 6, 6, &window, 0..4, 4, &mut col, col_stride);

		let (reference, _, _) = im2col(&image, 2, 4, 4, &window).unwrap();
		for (row, expected) in col.chunks(col_stride).zip(reference.chunks(18)) {
			assert_eq!(&row[..18], expected);
			assert!(row[18..].iter().all(|&x| x == 0.0));
		}
	}

	#[test]
	fn test_im2col_rows_band_matches_full() {
		let image = random_image(3 * 9 * 5, 2);
		let window = Window::square(4, 2, 1);
		let (full, out_h, out_w) = im2col(&image, 3, 9, 5, &window).unwrap();
		let (padded_h, padded_w) = window.padded_dims(9, 5);
		let padded = pad(&image, 3, 9, 5, 1, 1).unwrap();

		let row_len = 3 * window.taps();
		let mut band = vec![0.0; 2 * out_w * row_len];
		im2col_rows(&padded, 3, padded_h, padded_w, &window, 2..out_h, out_w, &mut band, row_len);
		assert_eq!(band, full[2 * out_w * row_len..]);
	}

	#[test]
	fn test_col2im_sums_overlapping_windows() {
		// Every tap of a 2x2 kernel with stride 1 contributes a 1 to the output.
		let col = vec![1.0; 4 * 2 * 2];
		let (image, h, w) = col2im(&col, 1, 2, 2, &Window::square(2, 1, 0)).unwrap();
		assert_eq!((h, w), (3, 3));
		#[rustfmt::skip]
		let expected = [
			1.0, 2.0, 1.0,
			2.0, 4.0, 2.0,
			1.0, 2.0, 1.0,
		];
		assert_eq!(image, expected);
	}

	#[test]
	fn test_col2im_accumulate_in_bands() {
		let window = Window::square(4, 2, 1);
		let (channels, col_h, col_w) = (2, 6, 3);
		let col = random_image(channels * window.taps() * col_h * col_w, 3);
		let (expected, img_h, img_w) = col2im(&col, channels, col_h, col_w, &window).unwrap();

		let (padded_h, padded_w) = window.padded_dims(img_h, img_w);
		let mut padded = vec![0.0; channels * padded_h * padded_w];
		let band_rows = 4;
		for start in (0..col_h).step_by(band_rows) {
			let rows = band_rows.min(col_h - start);
			let stride = band_rows * col_w;
			let mut band = vec![0.0; channels * window.taps() * stride];
			for tap_row in 0..channels * window.taps() {
				let src = tap_row * col_h * col_w + start * col_w;
				band[tap_row * stride..tap_row * stride + rows * col_w]
					.copy_from_slice(&col[src..src + rows * col_w]);
			}
			col2im_accumulate(
				&band,
				channels,
				rows,
				col_w,
				stride,
				&window,
				start,
				&mut padded,
				padded_h,
				padded_w,
			);
		}

		let image = unpad(&padded, channels, img_h, img_w, 1, 1).unwrap();
		for (a, b) in image.iter().zip(&expected) {
			assert!((a - b).abs() < 1e-5, "{a} != {b}");
		}
	}

	#[test]
	fn test_col2im_inverts_im2col_without_overlap() {
		let window = Window::square(2, 2, 0);
		let (channels, h, w) = (3, 6, 4);
		let image = random_image(channels * h * w, 4);

		let (col, out_h, out_w) = im2col(&image, channels, h, w, &window).unwrap();
		let col = Matrix::new(out_h * out_w, channels * window.taps(), &col)
			.unwrap()
			.transpose();
		let (restored, img_h, img_w) =
			col2im(col.elements(), channels, out_h, out_w, &window).unwrap();

		assert_eq!((img_h, img_w), (h, w));
		assert_eq!(restored, image);
	}

	proptest! {
		#[test]
		fn test_unpad_inverts_pad(
			channels in 1usize..4,
			h in 1usize..12,
			w in 1usize..12,
			pad_h in 0usize..5,
			pad_w in 0usize..5,
			seed in any::<u64>(),
		) {
			let image = random_image(channels * h * w, seed);
			let padded = pad(&image, channels, h, w, pad_h, pad_w).unwrap();
			prop_assert_eq!(unpad(&padded, channels, h, w, pad_h, pad_w).unwrap(), image);
		}
	}
}

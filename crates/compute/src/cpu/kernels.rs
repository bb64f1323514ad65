// Copyright 2025 Irreducible Inc.

use std::ops::Range;

use itertools::izip;
use rayon::prelude::*;
use stylenet_math::{col2im_accumulate, im2col_rows, pad_into, unpad_into, Activation, Window};
use stylenet_utils::ensure;

use super::{layer::CpuLayer, memory::CpuBuffer};
use crate::{
	layer::{Error, KernelLayer},
	memory::DeviceBuffer,
};

fn check_shape(what: &str, buffer: &CpuBuffer, rows: usize, cols: usize) -> Result<(), Error> {
	ensure!(
		buffer.rows() == rows && buffer.cols() == cols,
		Error::InputValidation(format!(
			"{what} is {}x{}, expected {rows}x{cols}",
			buffer.rows(),
			buffer.cols()
		))
	);
	Ok(())
}

fn check_column_vector(what: &str, buffer: &CpuBuffer, rows: usize) -> Result<(), Error> {
	check_shape(what, buffer, rows, 1)
}

impl KernelLayer for CpuLayer {
	fn pad(
		&self,
		image: &CpuBuffer,
		height: usize,
		width: usize,
		window: &Window,
		padded: &mut CpuBuffer,
	) -> Result<(), Error> {
		let channels = image.rows();
		let (padded_h, padded_w) = window.padded_dims(height, width);
		check_shape("image", image, channels, height * width)?;
		check_shape("padded image", padded, channels, padded_h * padded_w)?;

		pad_into(
			image.as_slice(),
			channels,
			height,
			width,
			window.pad_h,
			window.pad_w,
			padded.as_mut_slice(),
		);
		Ok(())
	}

	fn unpad(
		&self,
		padded: &CpuBuffer,
		height: usize,
		width: usize,
		window: &Window,
		image: &mut CpuBuffer,
	) -> Result<(), Error> {
		let channels = padded.rows();
		let (padded_h, padded_w) = window.padded_dims(height, width);
		check_shape("padded image", padded, channels, padded_h * padded_w)?;
		check_shape("image", image, channels, height * width)?;

		unpad_into(
			padded.as_slice(),
			channels,
			height,
			width,
			window.pad_h,
			window.pad_w,
			image.as_mut_slice(),
		);
		Ok(())
	}

	fn im2col(
		&self,
		padded: &CpuBuffer,
		height: usize,
		width: usize,
		window: &Window,
		out_rows: Range<usize>,
		col: &mut CpuBuffer,
	) -> Result<(), Error> {
		let channels = padded.rows();
		let (padded_h, padded_w) = window.padded_dims(height, width);
		check_shape("padded image", padded, channels, padded_h * padded_w)?;
		ensure!(
			window.stride_y > 0 && window.stride_x > 0,
			Error::InputValidation("stride must be non-zero".into())
		);
		ensure!(
			padded_h >= window.kernel_h && padded_w >= window.kernel_w,
			Error::InputValidation(format!(
				"{}x{} kernel does not fit in {padded_h}x{padded_w} image",
				window.kernel_h, window.kernel_w
			))
		);

		let out_h = (padded_h - window.kernel_h) / window.stride_y + 1;
		let out_w = (padded_w - window.kernel_w) / window.stride_x + 1;
		ensure!(
			out_rows.start <= out_rows.end && out_rows.end <= out_h,
			Error::InputValidation(format!("output rows {out_rows:?} exceed {out_h}"))
		);
		ensure!(
			col.rows() >= out_rows.len() * out_w && col.cols() >= channels * window.taps(),
			Error::InputValidation(format!(
				"{}x{} column buffer cannot hold {} rows of {} taps",
				col.rows(),
				col.cols(),
				out_rows.len() * out_w,
				channels * window.taps()
			))
		);

		let col_stride = col.cols();
		im2col_rows(
			padded.as_slice(),
			channels,
			padded_h,
			padded_w,
			window,
			out_rows,
			out_w,
			col.as_mut_slice(),
			col_stride,
		);
		Ok(())
	}

	fn col2im(
		&self,
		col: &CpuBuffer,
		col_h: usize,
		col_w: usize,
		window: &Window,
		row_offset: usize,
		padded: &mut CpuBuffer,
		height: usize,
		width: usize,
	) -> Result<(), Error> {
		let channels = padded.rows();
		let (padded_h, padded_w) = window.padded_dims(height, width);
		check_shape("padded image", padded, channels, padded_h * padded_w)?;
		ensure!(
			col.rows() >= channels * window.taps() && col.cols() >= col_h * col_w,
			Error::InputValidation(format!(
				"{}x{} column buffer is smaller than {}x{}",
				col.rows(),
				col.cols(),
				channels * window.taps(),
				col_h * col_w
			))
		);
		if col_h == 0 || col_w == 0 {
			return Ok(());
		}
		let last_row = (row_offset + col_h - 1) * window.stride_y + window.kernel_h;
		let last_col = (col_w - 1) * window.stride_x + window.kernel_w;
		ensure!(
			last_row <= padded_h && last_col <= padded_w,
			Error::InputValidation(format!(
				"windows at rows {row_offset}..{} reach past the {padded_h}x{padded_w} image",
				row_offset + col_h
			))
		);

		let col_stride = col.cols();
		col2im_accumulate(
			col.as_slice(),
			channels,
			col_h,
			col_w,
			col_stride,
			window,
			row_offset,
			padded.as_mut_slice(),
			padded_h,
			padded_w,
		);
		Ok(())
	}

	fn add_bias(&self, buffer: &mut CpuBuffer, bias: &CpuBuffer) -> Result<(), Error> {
		check_column_vector("bias", bias, buffer.rows())?;
		let cols = buffer.cols();
		if cols == 0 {
			return Ok(());
		}

		buffer
			.as_mut_slice()
			.par_chunks_mut(cols)
			.zip(bias.as_slice())
			.for_each(|(row, &b)| row.iter_mut().for_each(|x| *x += b));
		Ok(())
	}

	fn batch_norm(
		&self,
		buffer: &mut CpuBuffer,
		gamma: &CpuBuffer,
		beta: &CpuBuffer,
		mean: &CpuBuffer,
		var: &CpuBuffer,
		eps: f32,
	) -> Result<(), Error> {
		let channels = buffer.rows();
		check_column_vector("gamma", gamma, channels)?;
		check_column_vector("beta", beta, channels)?;
		check_column_vector("mean", mean, channels)?;
		check_column_vector("variance", var, channels)?;
		let cols = buffer.cols();
		if cols == 0 {
			return Ok(());
		}

		let rows = buffer.as_mut_slice().par_chunks_mut(cols).zip(
			izip!(gamma.as_slice(), beta.as_slice(), mean.as_slice(), var.as_slice())
				.collect::<Vec<_>>(),
		);
		rows.for_each(|(row, (&gamma, &beta, &mean, &var))| {
			let scale = gamma / (var + eps).sqrt();
			for x in row {
				*x = (*x - mean) * scale + beta;
			}
		});
		Ok(())
	}

	fn activate(&self, buffer: &mut CpuBuffer, activation: Activation) -> Result<(), Error> {
		if activation == Activation::Identity {
			return Ok(());
		}
		buffer
			.as_mut_slice()
			.par_chunks_mut(1 << 12)
			.for_each(|chunk| activation.apply_slice(chunk));
		Ok(())
	}

	fn add_assign(&self, dst: &mut CpuBuffer, src: &CpuBuffer) -> Result<(), Error> {
		check_shape("addend", src, dst.rows(), dst.cols())?;

		dst.as_mut_slice()
			.par_iter_mut()
			.zip(src.as_slice())
			.for_each(|(x, &y)| *x += y);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use stylenet_math::{col2im, im2col, pad};

	use super::*;
	use crate::layer::ComputeLayer;

	fn upload(hal: &CpuLayer, rows: usize, cols: usize, data: &[f32]) -> CpuBuffer {
		let mut buffer = hal.alloc(rows, cols).unwrap();
		hal.copy_h2d(data, &mut buffer).unwrap();
		buffer
	}

	fn ramp(len: usize) -> Vec<f32> {
		(0..len).map(|i| (i % 13) as f32 - 6.0).collect()
	}

	#[test]
	fn test_im2col_matches_host_reference() {
		let hal = CpuLayer::default();
		let window = Window::square(3, 2, 1);
		let (channels, h, w) = (2, 7, 5);
		let image = ramp(channels * h * w);
		let (expected, out_h, out_w) = im2col(&image, channels, h, w, &window).unwrap();

		let (padded_h, padded_w) = window.padded_dims(h, w);
		let padded_host = pad(&image, channels, h, w, 1, 1).unwrap();
		let padded = upload(&hal, channels, padded_h * padded_w, &padded_host);
		let row_len = channels * window.taps();
		let mut col = hal.alloc(out_h * out_w, 24).unwrap();
		hal.im2col(&padded, h, w, &window, 0..out_h, &mut col)
			.unwrap();

		for i in 0..out_h * out_w {
			assert_eq!(&col.row(i)[..row_len], &expected[i * row_len..(i + 1) * row_len]);
			assert!(col.row(i)[row_len..].iter().all(|&x| x == 0.0));
		}
	}

	#[test]
	fn test_im2col_rejects_rows_past_output() {
		let hal = CpuLayer::default();
		let window = Window::square(3, 1, 1);
		let padded = hal.alloc(1, 36).unwrap();
		let mut col = hal.alloc(64, 9).unwrap();
		assert_matches!(
			hal.im2col(&padded, 4, 4, &window, 2..5, &mut col),
			Err(Error::InputValidation(_))
		);
	}

	#[test]
	fn test_col2im_and_unpad_match_host_reference() {
		let hal = CpuLayer::default();
		let window = Window::square(4, 2, 1);
		let (channels, col_h, col_w) = (3, 4, 5);
		let col_host = ramp(channels * window.taps() * col_h * col_w);
		let (expected, h, w) = col2im(&col_host, channels, col_h, col_w, &window).unwrap();

		let col = upload(&hal, channels * window.taps(), col_h * col_w, &col_host);
		let (padded_h, padded_w) = window.padded_dims(h, w);
		let mut padded = hal.alloc(channels, padded_h * padded_w).unwrap();
		hal.col2im(&col, col_h, col_w, &window, 0, &mut padded, h, w)
			.unwrap();
		let mut image = hal.alloc(channels, h * w).unwrap();
		hal.unpad(&padded, h, w, &window, &mut image).unwrap();

		assert_eq!(image.as_slice(), expected.as_slice());
	}

	#[test]
	fn test_add_bias_per_row() {
		let hal = CpuLayer::default();
		let mut buffer = upload(&hal, 2, 3, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
		let bias = upload(&hal, 2, 1, &[10.0, -1.0]);
		hal.add_bias(&mut buffer, &bias).unwrap();
		assert_eq!(buffer.as_slice(), &[10.0, 11.0, 12.0, 2.0, 3.0, 4.0]);

		let wrong = upload(&hal, 3, 1, &[0.0; 3]);
		assert_matches!(hal.add_bias(&mut buffer, &wrong), Err(Error::InputValidation(_)));
	}

	#[test]
	fn test_batch_norm_per_row() {
		let hal = CpuLayer::default();
		let mut buffer = upload(&hal, 2, 2, &[1.0, 3.0, 5.0, 9.0]);
		let gamma = upload(&hal, 2, 1, &[2.0, 1.0]);
		let beta = upload(&hal, 2, 1, &[0.5, 0.0]);
		let mean = upload(&hal, 2, 1, &[1.0, 5.0]);
		let var = upload(&hal, 2, 1, &[4.0, 16.0]);
		hal.batch_norm(&mut buffer, &gamma, &beta, &mean, &var, 0.0)
			.unwrap();
		assert_eq!(buffer.as_slice(), &[0.5, 2.5, 0.0, 1.0]);
	}

	#[test]
	fn test_activate_and_add_assign() {
		let hal = CpuLayer::default();
		let mut buffer = upload(&hal, 1, 4, &[-1.0, 0.0, 1.0, 2.0]);
		hal.activate(&mut buffer, Activation::Relu).unwrap();
		assert_eq!(buffer.as_slice(), &[0.0, 0.0, 1.0, 2.0]);

		let other = upload(&hal, 1, 4, &[1.0, 1.0, 1.0, 1.0]);
		hal.add_assign(&mut buffer, &other).unwrap();
		assert_eq!(buffer.as_slice(), &[1.0, 1.0, 2.0, 3.0]);

		let transposed = upload(&hal, 4, 1, &[0.0; 4]);
		assert_matches!(hal.add_assign(&mut buffer, &transposed), Err(Error::InputValidation(_)));
	}
}

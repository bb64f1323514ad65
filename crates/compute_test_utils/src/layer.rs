// Copyright 2025 Irreducible Inc.

use rand::{prelude::StdRng, Rng, SeedableRng};
use stylenet_compute::{ComputeLayer, DeviceBuffer, KernelLayer, Region, Transpose};
use stylenet_math::{col2im, im2col, Activation, Matrix, Window};

fn random_vec(rng: &mut impl Rng, len: usize) -> Vec<f32> {
	(0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn upload<C: ComputeLayer>(compute: &C, rows: usize, cols: usize, data: &[f32]) -> C::Buffer {
	let mut buffer = compute.alloc(rows, cols).unwrap();
	compute.copy_h2d(data, &mut buffer).unwrap();
	buffer
}

fn download<C: ComputeLayer>(compute: &C, buffer: &C::Buffer) -> Vec<f32> {
	let mut host = vec![0.0; buffer.len()];
	compute.copy_d2h(buffer, &mut host).unwrap();
	host
}

fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
	assert_eq!(actual.len(), expected.len());
	for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
		assert!(
			(a - e).abs() <= tolerance * e.abs().max(1.0),
			"mismatch at {i}: {a} != {e}"
		);
	}
}

pub fn test_generic_copy_host_device<C: ComputeLayer>(compute: &C) {
	let mut rng = StdRng::seed_from_u64(0);
	let data = random_vec(&mut rng, 6 * 7);

	let fresh = compute.alloc(6, 7).unwrap();
	assert!(download(compute, &fresh).iter().all(|&x| x == 0.0));

	let src = upload(compute, 6, 7, &data);
	let mut dst = compute.alloc(6, 7).unwrap();
	compute.copy_d2d(&src, &mut dst).unwrap();
	compute.finish().unwrap();

	assert_eq!(download(compute, &dst), data);
}

pub fn test_generic_copy_2d_range<C: ComputeLayer>(compute: &C) {
	let (rows, cols) = (4, 6);
	let data = (0..rows * cols).map(|i| i as f32).collect::<Vec<_>>();
	let src = upload(compute, rows, cols, &data);

	let mut dst = compute.alloc(3, 5).unwrap();
	compute.fill(&mut dst, -1.0).unwrap();
	let region = Region {
		x: 1,
		y: 1,
		width: 3,
		height: 2,
	};
	compute.copy_2d_range(&src, 2, 1, &mut dst, region).unwrap();

	#[rustfmt::skip]
	let expected = [
		-1.0, -1.0, -1.0, -1.0, -1.0,
		-1.0,  8.0,  9.0, 10.0, -1.0,
		-1.0, 14.0, 15.0, 16.0, -1.0,
	];
	assert_eq!(download(compute, &dst), expected);
}

/// Checks `c = alpha * op(a) * op(b) + beta * c` for an `m` x `n` product with contraction `k`.
pub fn test_generic_sgemm<C: ComputeLayer>(
	compute: &C,
	trans_a: Transpose,
	trans_b: Transpose,
	m: usize,
	n: usize,
	k: usize,
) {
	let mut rng = StdRng::seed_from_u64(0);
	let (alpha, beta) = (1.5, -0.5);

	let a = Matrix::random(m, k, &mut rng);
	let b = Matrix::random(k, n, &mut rng);
	let c = Matrix::random(m, n, &mut rng);

	let stored = |x: &Matrix, trans: Transpose| match trans {
		Transpose::NoTrans => x.clone(),
		Transpose::Trans => x.transpose(),
	};
	let a_stored = stored(&a, trans_a);
	let b_stored = stored(&b, trans_b);

	let a_dev = upload(compute, a_stored.m(), a_stored.n(), a_stored.elements());
	let b_dev = upload(compute, b_stored.m(), b_stored.n(), b_stored.elements());
	let mut c_dev = upload(compute, m, n, c.elements());
	compute
		.sgemm(trans_a, trans_b, alpha, &a_dev, &b_dev, beta, &mut c_dev)
		.unwrap();

	let mut product = Matrix::zeros(m, n);
	Matrix::mul_into(&a, &b, &mut product);
	let expected = product
		.elements()
		.iter()
		.zip(c.elements())
		.map(|(ab, c)| alpha * ab + beta * c)
		.collect::<Vec<_>>();

	assert_close(&download(compute, &c_dev), &expected, 1e-4);
}

pub fn test_generic_sgemm_all_transposes<C: ComputeLayer>(compute: &C) {
	for trans_a in [Transpose::NoTrans, Transpose::Trans] {
		for trans_b in [Transpose::NoTrans, Transpose::Trans] {
			test_generic_sgemm(compute, trans_a, trans_b, 7, 13, 24);
			test_generic_sgemm(compute, trans_a, trans_b, 1, 5, 3);
		}
	}
}

/// Non-finite operands propagate the same way for every transpose combination.
pub fn test_generic_sgemm_non_finite<C: ComputeLayer>(compute: &C) {
	// a = [[0, 1], [1, 0]] is symmetric, so it is stored the same way either side.
	let a = [0.0, 1.0, 1.0, 0.0];
	let b = [f32::INFINITY, 2.0];
	for trans_a in [Transpose::NoTrans, Transpose::Trans] {
		for trans_b in [Transpose::NoTrans, Transpose::Trans] {
			let a_dev = upload(compute, 2, 2, &a);
			let (b_rows, b_cols) = trans_b.apply(2, 1);
			let b_dev = upload(compute, b_rows, b_cols, &b);
			let mut c_dev = compute.alloc(2, 1).unwrap();
			compute
				.sgemm(trans_a, trans_b, 1.0, &a_dev, &b_dev, 0.0, &mut c_dev)
				.unwrap();

			let c = download(compute, &c_dev);
			// 0 * inf + 1 * 2 is NaN, 1 * inf + 0 * 2 is inf.
			assert!(c[0].is_nan(), "{trans_a:?} {trans_b:?}: {c:?}");
			assert_eq!(c[1], f32::INFINITY, "{trans_a:?} {trans_b:?}");
		}
	}
}

/// Runs a small convolution through the layout kernels and the GEMM and compares it against
/// the host transforms.
pub fn test_generic_im2col_gemm<C: KernelLayer>(compute: &C) {
	let mut rng = StdRng::seed_from_u64(1);
	let window = Window::square(3, 2, 1);
	let (channels, h, w) = (3, 9, 6);
	let image = random_vec(&mut rng, channels * h * w);

	let (col_host, out_h, out_w) = im2col(&image, channels, h, w, &window).unwrap();
	let (padded_h, padded_w) = window.padded_dims(h, w);

	let image_dev = upload(compute, channels, h * w, &image);
	let mut padded = compute.alloc(channels, padded_h * padded_w).unwrap();
	compute.pad(&image_dev, h, w, &window, &mut padded).unwrap();

	let mut unpadded = compute.alloc(channels, h * w).unwrap();
	compute.unpad(&padded, h, w, &window, &mut unpadded).unwrap();
	assert_eq!(download(compute, &unpadded), image);

	let row_len = channels * window.taps();
	let mut col = compute.alloc(out_h * out_w, 32).unwrap();
	compute
		.im2col(&padded, h, w, &window, 0..out_h, &mut col)
		.unwrap();
	let col_dev = download(compute, &col);
	for (row, expected) in col_dev.chunks(32).zip(col_host.chunks(row_len)) {
		assert_eq!(&row[..row_len], expected);
	}

	let weights = Matrix::random(4, row_len, &mut rng);
	let mut padded_weights = vec![0.0; 4 * 32];
	for (dst, src) in padded_weights.chunks_mut(32).zip(weights.elements().chunks(row_len)) {
		dst[..row_len].copy_from_slice(src);
	}
	let weights_dev = upload(compute, 4, 32, &padded_weights);
	let mut out = compute.alloc(4, out_h * out_w).unwrap();
	compute
		.sgemm(Transpose::NoTrans, Transpose::Trans, 1.0, &weights_dev, &col, 0.0, &mut out)
		.unwrap();

	let col_matrix = Matrix::new(out_h * out_w, row_len, &col_host).unwrap();
	let mut expected = Matrix::zeros(4, out_h * out_w);
	Matrix::mul_into(&weights, &col_matrix.transpose(), &mut expected);
	assert_close(&download(compute, &out), expected.elements(), 1e-4);
}

pub fn test_generic_col2im<C: KernelLayer>(compute: &C) {
	let mut rng = StdRng::seed_from_u64(2);
	let window = Window::square(4, 2, 1);
	let (channels, col_h, col_w) = (2, 5, 3);
	let col_host = random_vec(&mut rng, channels * window.taps() * col_h * col_w);
	let (expected, h, w) = col2im(&col_host, channels, col_h, col_w, &window).unwrap();

	// Extra rows and columns in the column buffer are ignored.
	let stride = col_h * col_w + 5;
	let mut col_padded = vec![0.0; (channels * window.taps() + 3) * stride];
	for (dst, src) in col_padded.chunks_mut(stride).zip(col_host.chunks(col_h * col_w)) {
		dst[..col_h * col_w].copy_from_slice(src);
	}
	let col = upload(compute, channels * window.taps() + 3, stride, &col_padded);

	let (padded_h, padded_w) = window.padded_dims(h, w);
	let mut padded = compute.alloc(channels, padded_h * padded_w).unwrap();
	compute
		.col2im(&col, col_h, col_w, &window, 0, &mut padded, h, w)
		.unwrap();
	let mut image = compute.alloc(channels, h * w).unwrap();
	compute.unpad(&padded, h, w, &window, &mut image).unwrap();

	assert_close(&download(compute, &image), &expected, 1e-6);
}

pub fn test_generic_element_wise<C: KernelLayer>(compute: &C) {
	let mut rng = StdRng::seed_from_u64(3);
	let (channels, len) = (3, 10);
	let data = random_vec(&mut rng, channels * len);

	// Unit statistics leave the input as is.
	let mut buffer = upload(compute, channels, len, &data);
	let ones = upload(compute, channels, 1, &[1.0; 3]);
	let zeros = compute.alloc(channels, 1).unwrap();
	compute
		.batch_norm(&mut buffer, &ones, &zeros, &zeros, &ones, 0.0)
		.unwrap();
	assert_close(&download(compute, &buffer), &data, 1e-6);

	let bias = upload(compute, channels, 1, &[1.0, 2.0, 3.0]);
	compute.add_bias(&mut buffer, &bias).unwrap();
	compute.activate(&mut buffer, Activation::Elu).unwrap();
	let skip = upload(compute, channels, len, &data);
	compute.add_assign(&mut buffer, &skip).unwrap();

	let expected = data
		.iter()
		.enumerate()
		.map(|(i, &x)| Activation::Elu.apply(x + (i / len + 1) as f32) + x)
		.collect::<Vec<_>>();
	assert_close(&download(compute, &buffer), &expected, 1e-6);
}

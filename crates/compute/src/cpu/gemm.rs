// Copyright 2025 Irreducible Inc.

use std::borrow::Cow;

use rayon::prelude::*;
use stylenet_math::GEMM_ALIGNMENT;

use crate::layer::Transpose;

/// Borrowed row-major matrix operand.
#[derive(Debug, Clone, Copy)]
pub(super) struct MatRef<'a> {
	pub data: &'a [f32],
	pub rows: usize,
	pub cols: usize,
}

impl MatRef<'_> {
	fn transposed(&self) -> Vec<f32> {
		let mut out = vec![0.0; self.data.len()];
		transpose::transpose(self.data, &mut out, self.cols, self.rows);
		out
	}
}

/// `c = alpha * op(a) * op(b) + beta * c` over an `m` x `n` row-major `c`.
///
/// Operand shapes are validated by the caller. Rows of `c` are computed in parallel.
pub(super) fn sgemm(
	trans_a: Transpose,
	trans_b: Transpose,
	alpha: f32,
	a: MatRef,
	b: MatRef,
	beta: f32,
	c: &mut [f32],
) {
	let (m, k) = trans_a.apply(a.rows, a.cols);
	let (_, n) = trans_b.apply(b.rows, b.cols);
	debug_assert_eq!(c.len(), m * n);

	if m == 0 || n == 0 {
		return;
	}
	if k == 0 {
		c.par_iter_mut().for_each(|x| *x = scale(*x, beta));
		return;
	}

	let a_rows = match trans_a {
		Transpose::NoTrans => Cow::Borrowed(a.data),
		Transpose::Trans => Cow::Owned(a.transposed()),
	};

	match trans_b {
		// b is stored n x k: every entry of c is a dot product of two contiguous rows.
		Transpose::Trans => c
			.par_chunks_mut(n)
			.zip(a_rows.par_chunks(k))
			.for_each(|(c_row, a_row)| {
				for (c_ij, b_row) in c_row.iter_mut().zip(b.data.chunks_exact(k)) {
					*c_ij = alpha * dot(a_row, b_row) + scale(*c_ij, beta);
				}
			}),
		// b is stored k x n: every row of c is a linear combination of the rows of b.
		Transpose::NoTrans => c
			.par_chunks_mut(n)
			.zip(a_rows.par_chunks(k))
			.for_each(|(c_row, a_row)| {
				c_row.iter_mut().for_each(|x| *x = scale(*x, beta));
				for (&a_ik, b_row) in a_row.iter().zip(b.data.chunks_exact(n)) {
					let factor = alpha * a_ik;
					for (c_ij, &b_kj) in c_row.iter_mut().zip(b_row) {
						*c_ij += factor * b_kj;
					}
				}
			}),
	}
}

#[inline]
fn scale(x: f32, beta: f32) -> f32 {
	if beta == 0.0 {
		0.0
	} else {
		beta * x
	}
}

/// Dot product with independent partial sums per lane so that the inner loop vectorizes.
#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
	let mut lanes = [0.0f32; GEMM_ALIGNMENT];
	let mut a_chunks = a.chunks_exact(GEMM_ALIGNMENT);
	let mut b_chunks = b.chunks_exact(GEMM_ALIGNMENT);
	for (x, y) in (&mut a_chunks).zip(&mut b_chunks) {
		for ((acc, x), y) in lanes.iter_mut().zip(x).zip(y) {
			*acc += x * y;
		}
	}
	let tail = a_chunks
		.remainder()
		.iter()
		.zip(b_chunks.remainder())
		.map(|(x, y)| x * y)
		.sum::<f32>();
	lanes.iter().sum::<f32>() + tail
}

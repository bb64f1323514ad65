// Copyright 2024 Irreducible Inc.

use std::ops::{Index, IndexMut};

use bytemuck::zeroed_slice_box;
use getset::CopyGetters;
use rand::Rng;
use stylenet_utils::bail;

use super::error::Error;

/// A dense row-major `f32` matrix.
///
/// This is the host-side reference used to validate GEMM backends and to reshape parameters at
/// load time; it makes no attempt to be fast.
#[derive(Debug, Clone, PartialEq, CopyGetters)]
pub struct Matrix {
	#[getset(get_copy = "pub")]
	m: usize,
	#[getset(get_copy = "pub")]
	n: usize,
	elements: Box<[f32]>,
}

impl Matrix {
	pub fn new(m: usize, n: usize, elements: &[f32]) -> Result<Self, Error> {
		if elements.len() != m * n {
			bail!(Error::IncorrectArgumentLength {
				arg: "elements".into(),
				expected: m * n,
			});
		}
		Ok(Self {
			m,
			n,
			elements: elements.into(),
		})
	}

	pub fn zeros(m: usize, n: usize) -> Self {
		Self {
			m,
			n,
			elements: zeroed_slice_box(m * n),
		}
	}

	/// Matrix with entries drawn uniformly from `[-1, 1)`.
	pub fn random(m: usize, n: usize, mut rng: impl Rng) -> Self {
		Self {
			m,
			n,
			elements: (0..m * n).map(|_| rng.gen_range(-1.0..1.0)).collect(),
		}
	}

	pub fn elements(&self) -> &[f32] {
		&self.elements
	}

	pub fn row(&self, i: usize) -> &[f32] {
		assert!(i < self.m);
		&self.elements[i * self.n..(i + 1) * self.n]
	}

	pub fn transpose(&self) -> Self {
		let mut out = Self::zeros(self.n, self.m);
		transpose::transpose(&self.elements, &mut out.elements, self.n, self.m);
		out
	}

	/// Reference product `c = a * b`.
	pub fn mul_into(a: &Self, b: &Self, c: &mut Self) {
		assert_eq!(a.n(), b.m());
		assert_eq!(a.m(), c.m());
		assert_eq!(b.n(), c.n());

		for i in 0..c.m() {
			for j in 0..c.n() {
				c[(i, j)] = (0..a.n()).map(|k| a[(i, k)] * b[(k, j)]).sum();
			}
		}
	}
}

impl Index<(usize, usize)> for Matrix {
	type Output = f32;

	fn index(&self, (i, j): (usize, usize)) -> &Self::Output {
		assert!(i < self.m);
		assert!(j < self.n);
		&self.elements[i * self.n + j]
	}
}

impl IndexMut<(usize, usize)> for Matrix {
	fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut Self::Output {
		assert!(i < self.m);
		assert!(j < self.n);
		&mut self.elements[i * self.n + j]
	}
}

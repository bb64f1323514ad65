// Copyright 2025 Irreducible Inc.

/// An opaque two-dimensional `f32` buffer in device memory.
///
/// Feature maps use the row axis for channels and the column axis for the row-major spatial
/// index. Contents are only reachable through the owning compute layer.
pub trait DeviceBuffer {
	fn rows(&self) -> usize;

	fn cols(&self) -> usize;

	fn len(&self) -> usize {
		self.rows() * self.cols()
	}

	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// A rectangle of a destination buffer, in elements.
///
/// `x` and `width` run along the columns, `y` and `height` along the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
	pub x: usize,
	pub y: usize,
	pub width: usize,
	pub height: usize,
}

impl Region {
	/// The whole of a `rows` x `cols` buffer.
	pub const fn full(rows: usize, cols: usize) -> Self {
		Self {
			x: 0,
			y: 0,
			width: cols,
			height: rows,
		}
	}

	/// Columns `x..x + width` of every one of `rows` rows.
	pub const fn columns(x: usize, width: usize, rows: usize) -> Self {
		Self {
			x,
			y: 0,
			width,
			height: rows,
		}
	}

	pub const fn fits_in(&self, rows: usize, cols: usize) -> bool {
		self.x + self.width <= cols && self.y + self.height <= rows
	}
}

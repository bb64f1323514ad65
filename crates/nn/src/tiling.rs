// Copyright 2025 Irreducible Inc.

use std::ops::Range;

use stylenet_math::{conv_outsize, Error as MathError, Window};
use stylenet_utils::{checked_arithmetics::ceil_div, ensure};

use crate::Error;

/// Tile height, in input rows, used when none is configured.
pub const DEFAULT_TILE_HEIGHT: usize = 64;

/// How rows left over after the last full tile are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TileRemainder {
	/// Run `max(1, input_rows / tile_height)` tiles and leave whatever they do not reach
	/// uncomputed. Convolution outputs keep only their bias there.
	Truncate,
	/// Add a final, shorter tile so that every row is computed.
	#[default]
	Partial,
}

/// Whether a layer processes the whole image at once or in bands of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TilePolicy {
	#[default]
	Untiled,
	Rows {
		/// Band height in input rows, before padding and stride.
		height: usize,
		remainder: TileRemainder,
	},
}

impl TilePolicy {
	pub const fn rows(height: usize) -> Self {
		Self::Rows {
			height,
			remainder: TileRemainder::Partial,
		}
	}

	pub const fn is_tiled(&self) -> bool {
		matches!(self, Self::Rows { .. })
	}

	pub(crate) fn validate(&self) -> Result<(), Error> {
		if let Self::Rows { height, .. } = self {
			ensure!(*height > 0, Error::InvalidConfig("tile height must be positive".into()));
		}
		Ok(())
	}
}

/// The row bands a layer processes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
	tile_rows: usize,
	bands: Vec<Range<usize>>,
}

impl TilePlan {
	fn banded(total: usize, tile_rows: usize, count: usize) -> Self {
		let bands = (0..count)
			.map(|i| (i * tile_rows).min(total)..((i + 1) * tile_rows).min(total))
			.filter(|band| !band.is_empty())
			.collect();
		Self { tile_rows, bands }
	}

	/// Bands of output rows of a convolution over `in_height` input rows.
	///
	/// A band of `height` input rows yields `conv_outsize(height)` output rows, and at least one.
	pub fn for_convolution(
		policy: TilePolicy,
		window: &Window,
		in_height: usize,
		out_height: usize,
	) -> Result<Self, Error> {
		policy.validate()?;
		ensure!(out_height > 0, Error::ShapeMismatch("empty convolution output".into()));
		let plan = match policy {
			TilePolicy::Untiled => Self::banded(out_height, out_height, 1),
			TilePolicy::Rows { height, remainder } => {
				// A band shorter than the kernel still yields one output row.
				let tile_rows =
					match conv_outsize(height, window.kernel_h, window.stride_y, window.pad_h) {
						Ok(rows) => rows,
						Err(MathError::NonPositiveDimension { .. }) => 1,
						Err(err) => return Err(err.into()),
					}
					.min(out_height);
				let count = match remainder {
					TileRemainder::Truncate => (in_height / height).max(1),
					TileRemainder::Partial => ceil_div(out_height, tile_rows),
				};
				Self::banded(out_height, tile_rows, count)
			}
		};
		Ok(plan)
	}

	/// Bands of input rows of a transposed convolution.
	pub fn for_transposed_convolution(
		policy: TilePolicy,
		in_height: usize,
	) -> Result<Self, Error> {
		policy.validate()?;
		ensure!(in_height > 0, Error::ShapeMismatch("empty transposed convolution input".into()));
		let plan = match policy {
			TilePolicy::Untiled => Self::banded(in_height, in_height, 1),
			TilePolicy::Rows { height, remainder } => {
				let tile_rows = height.min(in_height);
				let count = match remainder {
					TileRemainder::Truncate => (in_height / height).max(1),
					TileRemainder::Partial => ceil_div(in_height, tile_rows),
				};
				Self::banded(in_height, tile_rows, count)
			}
		};
		Ok(plan)
	}

	/// Capacity, in rows, that a tile buffer needs.
	pub fn tile_rows(&self) -> usize {
		self.tile_rows
	}

	pub fn bands(&self) -> &[Range<usize>] {
		&self.bands
	}

	/// Number of rows the bands reach, counted from the top.
	pub fn covered_rows(&self) -> usize {
		self.bands.last().map_or(0, |band| band.end)
	}

	/// Whether the single band spans all `rows`, so no tile buffer is needed.
	pub fn is_whole(&self, rows: usize) -> bool {
		self.bands.len() == 1 && self.bands[0] == (0..rows)
	}
}

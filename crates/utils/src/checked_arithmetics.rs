// Copyright 2024 Irreducible Inc.

/// Rounds `val` up to the nearest multiple of `multiple`.
///
/// `multiple` must be non-zero.
pub const fn round_up_to_multiple(val: usize, multiple: usize) -> usize {
	assert!(multiple != 0);
	val.div_ceil(multiple) * multiple
}

/// Number of chunks of size `chunk` needed to cover `len` elements, the last one possibly partial.
pub const fn ceil_div(len: usize, chunk: usize) -> usize {
	assert!(chunk != 0);
	len.div_ceil(chunk)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_round_up_to_multiple() {
		assert_eq!(round_up_to_multiple(0, 8), 0);
		assert_eq!(round_up_to_multiple(1, 8), 8);
		assert_eq!(round_up_to_multiple(8, 8), 8);
		assert_eq!(round_up_to_multiple(27, 8), 32);
		assert_eq!(round_up_to_multiple(243, 8), 248);
	}

	#[test]
	fn test_ceil_div() {
		assert_eq!(ceil_div(64, 64), 1);
		assert_eq!(ceil_div(65, 64), 2);
		assert_eq!(ceil_div(1, 64), 1);
		assert_eq!(ceil_div(0, 64), 0);
	}

	#[test]
	#[should_panic]
	fn test_round_up_zero_multiple() {
		_ = round_up_to_multiple(3, 0);
	}
}

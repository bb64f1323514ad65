// Copyright 2024 Irreducible Inc.

/// Element-wise activation functions used between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
	#[default]
	Identity,
	/// `max(x, 0)`
	Relu,
	/// Exponential linear unit with `alpha = 1`.
	Elu,
}

impl Activation {
	#[inline]
	pub fn apply(self, x: f32) -> f32 {
		match self {
			Self::Identity => x,
			Self::Relu => x.max(0.0),
			Self::Elu => {
				if x > 0.0 {
					x
				} else {
					x.exp_m1()
				}
			}
		}
	}

	pub fn apply_slice(self, data: &mut [f32]) {
		if self == Self::Identity {
			return;
		}
		for x in data {
			*x = self.apply(*x);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_relu() {
		let mut data = [-2.0, -0.0, 0.5, 3.0];
		Activation::Relu.apply_slice(&mut data);
		assert_eq!(data, [0.0, 0.0, 0.5, 3.0]);
	}

	#[test]
	fn test_elu() {
		assert_eq!(Activation::Elu.apply(2.5), 2.5);
		assert!((Activation::Elu.apply(-1.0) - (-0.632_120_56)).abs() < 1e-6);
		assert!(Activation::Elu.apply(-5.0) > -1.0);
		// Saturates to exactly -1 in single precision.
		assert_eq!(Activation::Elu.apply(-50.0), -1.0);
	}

	#[test]
	fn test_identity() {
		let mut data = [f32::NAN, -1.0];
		Activation::Identity.apply_slice(&mut data);
		assert!(data[0].is_nan());
		assert_eq!(data[1], -1.0);
	}
}

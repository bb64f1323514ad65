// Copyright 2025 Irreducible Inc.

//! Layers and the fixed-topology style-transfer network built on a [`ComputeLayer`].
//!
//! Every convolution is computed as pad, im2col, GEMM and bias; transposed convolutions as GEMM,
//! col2im, crop and bias. Layers can process the image in bands of rows to bound the size of
//! the column buffers, see [`TilePolicy`].
//!
//! [`ComputeLayer`]: stylenet_compute::ComputeLayer

mod batch_norm;
mod conv;
mod deconv;
mod error;
mod feature_map;
mod layer;
mod model;
pub mod params;
mod residual;
mod residual_chained;
mod tiling;
mod timing;

pub use batch_norm::*;
pub use conv::*;
pub use deconv::*;
pub use error::*;
pub use feature_map::*;
pub use layer::*;
pub use model::*;
pub use residual::*;
pub use residual_chained::*;
pub use tiling::*;
pub use timing::*;

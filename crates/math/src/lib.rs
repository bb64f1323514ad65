// Copyright 2024 Irreducible Inc.

//! Dimension arithmetic and host-side reference transforms for GEMM-based convolution.
//!
//! Everything in this crate operates on plain `f32` slices in planar, channel-major layout. The
//! compute backends reuse these routines as their reference kernels, and the tests of the layers
//! use them to build expected results.

mod activation;
mod dims;
mod error;
mod layout;
mod matrix;

pub use activation::*;
pub use dims::*;
pub use error::*;
pub use layout::*;
pub use matrix::*;

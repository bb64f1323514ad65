// Copyright 2025 Irreducible Inc.

//! Hardware abstraction layer for the dense linear algebra behind the network layers.
//!
//! The layers only ever talk to a [`ComputeLayer`] for memory and matrix multiplication and to a
//! [`KernelLayer`] for the data-movement and element-wise kernels around it. The [`cpu`] module
//! provides the reference backend.

pub mod alloc;
pub mod cpu;
pub mod layer;
pub mod memory;

pub use layer::*;
pub use memory::*;

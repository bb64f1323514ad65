// Copyright 2025 Irreducible Inc.

//! Reference CPU implementation of a compute layer.
//!
//! Device memory is host memory accounted against a [`MemoryTracker`](crate::alloc::MemoryTracker).
//! The matrix multiplication and the element-wise kernels are spread over the rayon thread pool;
//! the data-layout kernels reuse the host routines of `stylenet_math`.

mod gemm;
mod kernels;
mod layer;
mod memory;

pub use layer::CpuLayer;
pub use memory::CpuBuffer;

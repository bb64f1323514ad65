// Copyright 2025 Irreducible Inc.

//! Backend-generic conformance tests and a naive direct-convolution model used to validate the
//! GEMM-based layers.

pub mod layer;
pub mod reference;

// Copyright 2024 Irreducible Inc.

use std::{env, sync::OnceLock};

use crate::env::parsed_env_var;

/// Thread count override for the compute backend, takes precedence over `RAYON_NUM_THREADS`.
pub const THREADS_ENV: &str = "STYLENET_THREADS";

/// Configures the global rayon pool used by the CPU backend.
///
/// When a single thread is requested the pool runs on the calling thread, which keeps profiles
/// and debugger sessions free of worker-thread noise.
///
/// NOTE: rayon doesn't allow initializing global thread pool several times, so the result of the
/// first call is cached and returned on every subsequent call. Call this at the start of `main`.
pub fn adjust_thread_pool() -> &'static Result<(), rayon::ThreadPoolBuildError> {
	static ONCE_GUARD: OnceLock<Result<(), rayon::ThreadPoolBuildError>> = OnceLock::new();

	ONCE_GUARD.get_or_init(|| {
		let requested = parsed_env_var::<usize>(THREADS_ENV)
			.or_else(|| env::var("RAYON_NUM_THREADS").ok()?.parse().ok());
		match requested {
			Some(1) => rayon::ThreadPoolBuilder::new()
				.num_threads(1)
				.use_current_thread()
				.build_global(),
			Some(n) if n > 1 => rayon::ThreadPoolBuilder::new()
				.num_threads(n)
				.build_global(),
			_ => Ok(()),
		}
	})
}

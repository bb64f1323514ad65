// Copyright 2023 Ulvetanna Inc.

/// Environment variable holding the `tracing_subscriber::EnvFilter` directives.
pub const LOG_FILTER_ENV: &str = "STYLENET_LOG";

/// Environment flag enabling span-close events, which report the busy/idle time of every
/// instrumented layer.
pub const LOG_SPANS_ENV: &str = "STYLENET_LOG_SPANS";

/// Installs the global subscriber. Calling this more than once is harmless.
pub fn init_tracing() {
	use tracing_subscriber::{
		fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
	};

	let filter =
		EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
	let span_events = if crate::env::boolean_env_flag_set(LOG_SPANS_ENV) {
		FmtSpan::CLOSE
	} else {
		FmtSpan::NONE
	};

	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_span_events(span_events))
		.try_init();
}

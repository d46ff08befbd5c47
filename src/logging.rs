use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs an `EnvFilter`-driven console subscriber for embedders and test
/// binaries that have none of their own. The library itself only emits
/// `tracing` events and never installs a subscriber implicitly; calling this
/// is optional and idempotent, and a subscriber installed elsewhere wins.
pub fn init() {
    INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true));
        // Already-installed subscriber elsewhere; keep it.
        let _ = subscriber.try_init();
    });
}

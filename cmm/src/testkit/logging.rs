use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a test-friendly subscriber once per process. `RUST_LOG` overrides the `warn` default.
pub fn init_logging() {
  INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init();
  });
}

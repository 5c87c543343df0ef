//! A thin helper for binaries and tests that want a global `tracing`
//! subscriber. The engine itself never calls `tracing_subscriber` — only
//! `tracing` — so that a hosting daemon can install its own subscriber (for
//! example one that also writes to syslog, the way the teacher codebase's
//! own logger does) without the engine fighting it for the global default.

#[cfg(test)]
pub fn init_test_tracing() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

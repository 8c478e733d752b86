//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the `EnvFilter` directive string.
pub const LOG_ENV: &str = "CHAT_STORE_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a global fmt subscriber filtered by [`LOG_ENV`].
///
/// Returns `false` when a global subscriber was already installed, which makes
/// repeated calls harmless.
pub fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .is_ok()
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

#[cfg(test)]
mod tests {
    use super::init_tracing;

    #[test]
    fn second_init_is_a_no_op() {
        init_tracing();
        assert!(!init_tracing());
    }
}

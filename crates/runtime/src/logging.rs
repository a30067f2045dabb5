//! Log output.
//!
//! The engine logs through `tracing`. Binaries and tests install a
//! subscriber with [`init`]; the `EDDY_LOG` environment variable takes
//! precedence over the level passed in, using `EnvFilter` directives such as
//! `eddy_incremental=debug,info`.

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter.
pub const LOG_ENV: &str = "EDDY_LOG";

/// Installs a fmt subscriber filtered at `level`.
///
/// Returns false if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let first = init("warn");
        assert!(!init("debug"));
        // Another test may have installed the subscriber first
        let _ = first;
        tracing::info!(component = "logging", "subscriber installed");
    }
}

//! Tracing setup for binaries and integration harnesses embedding the client

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default directive used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,fm_attachments=debug,fm_client=debug";

/// Install a global subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init_tracing(DEFAULT_FILTER);
        assert!(!init_tracing(DEFAULT_FILTER));
    }
}

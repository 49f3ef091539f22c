//! Process-wide tracing setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a formatted subscriber filtered by `RUST_LOG`, defaulting to
/// `info`. Returns false when a subscriber was already installed.
pub fn init() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_ok()
}

/// Same as [`init`] with one JSON object per event.
pub fn init_json() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init();
        assert!(!init());
        assert!(!init_json());
    }
}

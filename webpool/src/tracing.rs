//! Logging setup.
//!
//! Call [`init`] once at startup to install the global subscriber. The rest
//! of the program pulls in `crate::tracing::prelude::*` for the level macros.

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Install a stdout subscriber filtering at INFO by default; `RUST_LOG`
/// overrides as usual.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

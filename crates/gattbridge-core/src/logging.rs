//! Runtime-switchable diagnostics.
//!
//! The session logs through `tracing`. Application-facing `enable_logs`
//! flips a [`LogSwitch`] that gates this crate's debug and info output;
//! warnings and errors always pass, and other crates are not affected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Level, Metadata};
use tracing_subscriber::filter::{FilterFn, filter_fn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

const TARGET_PREFIX: &str = "gattbridge";

/// Shared on/off flag for this crate's verbose logging.
#[derive(Debug, Clone, Default)]
pub struct LogSwitch(Arc<AtomicBool>);

impl LogSwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Whether a record with this metadata may be written.
    pub fn allows(&self, metadata: &Metadata<'_>) -> bool {
        *metadata.level() <= Level::WARN
            || !metadata.target().starts_with(TARGET_PREFIX)
            || self.is_enabled()
    }
}

/// A per-layer filter that consults `switch` for every record.
pub fn switch_filter(
    switch: &LogSwitch,
) -> FilterFn<impl Fn(&Metadata<'_>) -> bool + Clone + use<>> {
    let switch = switch.clone();
    filter_fn(move |metadata| switch.allows(metadata))
}

/// Install a global fmt subscriber gated by `switch`.
///
/// `RUST_LOG` takes precedence over `default_directive`. Fails instead of
/// panicking if a global subscriber is already set.
pub fn init(switch: &LogSwitch, default_directive: &str) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_filter(switch_filter(switch)))
        .try_init()
}

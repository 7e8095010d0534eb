//! The narrow interface the bridge drives the engine through.
//!
//! The bridge never reaches into engine internals. Everything it does to
//! the engine on behalf of a client goes through [`EngineAdapter`], which
//! the host application implements.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

/// Operations the bridge may perform on the engine.
///
/// Methods are called on the server's event loop thread, one inbound
/// message at a time. Implementations must not block for long.
pub trait EngineAdapter: Send + Sync + 'static {
    /// Feed a stroke made of the given key names to the engine, as if the
    /// machine had produced it.
    fn inject_stroke(&self, keys: &[String]) -> anyhow::Result<()>;

    /// Translate `mapping` as if a stroke had produced it. Macro mappings
    /// run the macro.
    fn inject_translation(&self, mapping: &str) -> anyhow::Result<()>;

    /// Whether engine output is currently enabled.
    fn is_output_enabled(&self) -> bool;

    /// Enable or disable output without broadcasting a change.
    fn force_enable(&self, enabled: bool);

    /// Reset the key-down counters of the last stroke.
    fn zero_last_stroke_length(&self);
}

/// Adapter that only logs what it is asked to do.
///
/// Used by the stand-alone binary, where no engine is attached.
#[derive(Debug)]
pub struct LoggingAdapter {
    output_enabled: AtomicBool,
}

impl Default for LoggingAdapter {
    fn default() -> Self {
        Self {
            output_enabled: AtomicBool::new(true),
        }
    }
}

impl EngineAdapter for LoggingAdapter {
    fn inject_stroke(&self, keys: &[String]) -> anyhow::Result<()> {
        info!(?keys, "stroke received");
        Ok(())
    }

    fn inject_translation(&self, mapping: &str) -> anyhow::Result<()> {
        info!(mapping, "translation received");
        Ok(())
    }

    fn is_output_enabled(&self) -> bool {
        self.output_enabled.load(Ordering::Acquire)
    }

    fn force_enable(&self, enabled: bool) {
        self.output_enabled.store(enabled, Ordering::Release);
    }

    fn zero_last_stroke_length(&self) {
        info!("last stroke length zeroed");
    }
}

//! Interpreting inbound client commands.
//!
//! A message is applied in a fixed order:
//!
//! 1. `forced` -- if output is off, turn it on for this message only
//! 2. `zero_last_stroke_length`
//! 3. `stroke`
//! 4. `translation`
//!
//! A failing step is logged and the remaining steps still run. Forced
//! output is switched back off however the message ends.

use engine_server_types::{InboundMessage, ReceivedMessage};
use tracing::{debug, warn};

use crate::adapter::EngineAdapter;

/// Turns output back off when dropped, if it was forced on.
struct ForcedOutput<'a> {
    adapter: &'a dyn EngineAdapter,
}

impl<'a> ForcedOutput<'a> {
    fn engage(adapter: &'a dyn EngineAdapter) -> Option<Self> {
        if adapter.is_output_enabled() {
            return None;
        }
        adapter.force_enable(true);
        Some(Self { adapter })
    }
}

impl Drop for ForcedOutput<'_> {
    fn drop(&mut self) {
        self.adapter.force_enable(false);
    }
}

/// Apply one client command to the engine.
pub fn route_message(adapter: &dyn EngineAdapter, message: &InboundMessage) {
    let _forced = if message.forced {
        ForcedOutput::engage(adapter)
    } else {
        None
    };

    if message.zero_last_stroke_length {
        adapter.zero_last_stroke_length();
    }

    if let Some(keys) = &message.stroke
        && let Err(e) = adapter.inject_stroke(keys)
    {
        warn!(?keys, error = %e, "failed to inject stroke");
    }

    if let Some(mapping) = &message.translation
        && let Err(e) = adapter.inject_translation(mapping)
    {
        warn!(mapping, error = %e, "failed to inject translation");
    }
}

/// Interpret a raw received payload and apply it.
pub fn route_received(adapter: &dyn EngineAdapter, received: &ReceivedMessage) {
    match InboundMessage::from_value(&received.payload) {
        Some(message) if !message.is_empty() => {
            debug!(connection = %received.connection, "routing client command");
            route_message(adapter, &message);
        }
        _ => debug!(connection = %received.connection, "ignoring payload with no command"),
    }
}

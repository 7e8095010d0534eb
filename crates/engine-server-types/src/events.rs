//! Engine events broadcast to every connected client.
//!
//! Each event becomes a single-key JSON object named after the engine
//! hook that produced it, e.g. `{"output_changed": true}` or
//! `{"translated": {"old": [...], "new": [...]}}`. Stroke events carry an
//! extra `rtfcre` key next to `stroked`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ts_rs::TS;

/// Payload of a `translated` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Translated {
    /// Actions undone by the new translation.
    pub old: Vec<Value>,
    /// Actions applied by the new translation.
    pub new: Vec<Value>,
}

/// Payload of a `machine_state_changed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MachineStateChanged {
    /// Name of the active machine.
    pub machine_type: String,
    /// The new machine state (e.g. `connected`, `disconnected`).
    pub machine_state: String,
}

/// An event produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A stroke was performed.
    Stroked {
        /// The engine's JSON rendering of the stroke.
        stroke: Value,
        /// The stroke in RTF/CRE notation.
        rtfcre: String,
    },
    /// A translation occurred.
    Translated(Translated),
    /// The active machine changed state.
    MachineStateChanged(MachineStateChanged),
    /// Output was enabled or disabled.
    OutputChanged(bool),
    /// The configuration changed; carries the updated (partial) config.
    ConfigChanged(Value),
    /// All dictionaries finished loading.
    DictionariesLoaded,
    /// A string was output.
    SendString(String),
    /// Backspaces were output.
    SendBackspaces(u32),
    /// A key combination was output.
    SendKeyCombination(String),
    /// The add-translation tool was opened by a command.
    AddTranslation,
    /// The main window was focused by a command.
    Focus,
    /// The configuration tool was opened by a command.
    Configure,
    /// The lookup tool was opened by a command.
    Lookup,
    /// The suggestions tool was opened by a command.
    Suggestions,
    /// The engine is quitting or restarting.
    Quit,
}

impl EngineEvent {
    /// The hook name, which is also the event's key on the wire.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stroked { .. } => "stroked",
            Self::Translated(_) => "translated",
            Self::MachineStateChanged(_) => "machine_state_changed",
            Self::OutputChanged(_) => "output_changed",
            Self::ConfigChanged(_) => "config_changed",
            Self::DictionariesLoaded => "dictionaries_loaded",
            Self::SendString(_) => "send_string",
            Self::SendBackspaces(_) => "send_backspaces",
            Self::SendKeyCombination(_) => "send_key_combination",
            Self::AddTranslation => "add_translation",
            Self::Focus => "focus",
            Self::Configure => "configure",
            Self::Lookup => "lookup",
            Self::Suggestions => "suggestions",
            Self::Quit => "quit",
        }
    }

    /// Render the event as the JSON object sent to clients.
    pub fn to_payload(&self) -> Value {
        let name = self.name();
        match self {
            Self::Stroked { stroke, rtfcre } => json!({ name: stroke, "rtfcre": rtfcre }),
            Self::Translated(translated) => json!({ name: translated }),
            Self::MachineStateChanged(changed) => json!({ name: changed }),
            Self::OutputChanged(enabled) => json!({ name: enabled }),
            Self::ConfigChanged(update) => json!({ name: update }),
            // Clients key off the presence of the field; the value is legacy.
            Self::DictionariesLoaded => json!({ name: "0" }),
            Self::SendString(text) | Self::SendKeyCombination(text) => json!({ name: text }),
            Self::SendBackspaces(count) => json!({ name: count }),
            Self::AddTranslation
            | Self::Focus
            | Self::Configure
            | Self::Lookup
            | Self::Suggestions
            | Self::Quit => json!({ name: true }),
        }
    }
}

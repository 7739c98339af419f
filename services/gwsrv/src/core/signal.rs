//! Signal types produced by one poll cycle

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Raw register values read in one poll cycle, keyed by address.
pub type RegisterSnapshot = BTreeMap<u16, u16>;

/// Severity attached to a decoded value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Operation,
    Fault,
}

/// Telemetry group tag: which sub-controller produced a signal set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalGroup {
    /// Drive registers read over Modbus TCP or Serial
    Drive,
    /// Supervisory LOGO controller
    Logo,
}

impl SignalGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalGroup::Drive => "drive",
            SignalGroup::Logo => "logo",
        }
    }
}

impl fmt::Display for SignalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded value: a scaled number or an enumerated label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

impl SignalValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Number(n) => Some(*n),
            SignalValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SignalValue::Text(s) => Some(s),
            SignalValue::Number(_) => None,
        }
    }
}

/// One named reading inside a [`DecodedSignal`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub value: SignalValue,
    pub severity: Severity,
}

impl SignalReading {
    pub fn number(value: f64) -> Self {
        Self {
            value: SignalValue::Number(value),
            severity: Severity::Operation,
        }
    }

    pub fn label(label: impl Into<String>, severity: Severity) -> Self {
        Self {
            value: SignalValue::Text(label.into()),
            severity,
        }
    }
}

/// Named signal set decoded from a [`RegisterSnapshot`].
///
/// Serializes as a plain JSON object `{name: {value, severity}}`. Names whose
/// register was not read are never present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecodedSignal(BTreeMap<String, SignalReading>);

impl DecodedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, reading: SignalReading) {
        self.0.insert(name.into(), reading);
    }

    pub fn get(&self, name: &str) -> Option<&SignalReading> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalReading)> {
        self.0.iter()
    }
}

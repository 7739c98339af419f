//! Register maps and register → signal decoding
//!
//! A [`RegisterMap`] is an immutable, versioned table of named registers for
//! one transport kind. The built-in tables describe the drive (TCP and RTU
//! addressing differ by one) and the LOGO supervisory controller; a
//! deployment may override any of them with a YAML file of the same shape:
//!
//! ```yaml
//! name: drive-tcp
//! version: 3
//! registers:
//!   - { name: curr, address: 9, scale: 0.1 }
//!   - name: stat
//!     address: 17
//!     enum:
//!       0: stop
//!       1: { label: fault, severity: fault }
//!       2: run
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::signal::{DecodedSignal, RegisterSnapshot, Severity, SignalReading};
use super::transport::TransportKind;
use crate::error::{GwSrvError, Result};

/// Label and severity for one enumerated register code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EnumEntryRepr")]
pub struct EnumEntry {
    pub label: String,
    pub severity: Severity,
}

impl EnumEntry {
    pub fn operation(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            severity: Severity::Operation,
        }
    }

    pub fn fault(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            severity: Severity::Fault,
        }
    }
}

// Map files may give a bare label instead of the full form
#[derive(Deserialize)]
#[serde(untagged)]
enum EnumEntryRepr {
    Label(String),
    Full {
        label: String,
        #[serde(default)]
        severity: Severity,
    },
}

impl From<EnumEntryRepr> for EnumEntry {
    fn from(repr: EnumEntryRepr) -> Self {
        match repr {
            EnumEntryRepr::Label(label) => EnumEntry::operation(label),
            EnumEntryRepr::Full { label, severity } => EnumEntry { label, severity },
        }
    }
}

/// One named register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    pub address: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(
        default,
        rename = "enum",
        skip_serializing_if = "Option::is_none"
    )]
    pub enumeration: Option<BTreeMap<i64, EnumEntry>>,
}

impl RegisterEntry {
    pub fn plain(name: &str, address: u16) -> Self {
        Self {
            name: name.to_string(),
            address,
            scale: None,
            enumeration: None,
        }
    }

    pub fn scaled(name: &str, address: u16, scale: f64) -> Self {
        Self {
            scale: Some(scale),
            ..Self::plain(name, address)
        }
    }

    pub fn enumerated(name: &str, address: u16, codes: &[(i64, EnumEntry)]) -> Self {
        Self {
            enumeration: Some(codes.iter().cloned().collect()),
            ..Self::plain(name, address)
        }
    }

    /// Decode one raw register value.
    ///
    /// Enumerated registers resolve to a label; an unmapped code becomes
    /// `unknown(<code>)` with operation severity. Other registers are
    /// scaled when a scale is set.
    pub fn decode(&self, raw: u16) -> SignalReading {
        if let Some(codes) = &self.enumeration {
            return match codes.get(&i64::from(raw)) {
                Some(entry) => SignalReading::label(entry.label.clone(), entry.severity),
                None => SignalReading::label(format!("unknown({})", raw), Severity::Operation),
            };
        }

        let value = f64::from(raw);
        match self.scale {
            Some(scale) => SignalReading::number(apply_scale(value, scale)),
            None => SignalReading::number(value),
        }
    }
}

/// Multiply by `scale`, dividing instead when the scale is an exact
/// reciprocal of an integer so that 250 × 0.1 yields exactly 25.0.
fn apply_scale(value: f64, scale: f64) -> f64 {
    let divisor = 1.0 / scale;
    if divisor > 1.0 && (divisor - divisor.round()).abs() < 1e-9 {
        value / divisor.round()
    } else {
        value * scale
    }
}

#[derive(Deserialize)]
struct RawRegisterMap {
    name: String,
    #[serde(default = "default_version")]
    version: u32,
    registers: Vec<RegisterEntry>,
}

fn default_version() -> u32 {
    1
}

impl TryFrom<RawRegisterMap> for RegisterMap {
    type Error = GwSrvError;

    fn try_from(raw: RawRegisterMap) -> Result<Self> {
        RegisterMap::new(raw.name, raw.version, raw.registers)
    }
}

/// Immutable register table for one transport kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRegisterMap")]
pub struct RegisterMap {
    name: String,
    version: u32,
    registers: Vec<RegisterEntry>,
}

impl RegisterMap {
    /// Build a map, rejecting duplicate names and unusable scales
    pub fn new(name: impl Into<String>, version: u32, registers: Vec<RegisterEntry>) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::new();
        for entry in &registers {
            if !seen.insert(entry.name.as_str()) {
                return Err(GwSrvError::config(format!(
                    "register map '{}': duplicate register name '{}'",
                    name, entry.name
                )));
            }
            if let Some(scale) = entry.scale {
                if !scale.is_finite() || scale == 0.0 {
                    return Err(GwSrvError::config(format!(
                        "register map '{}': invalid scale {} for '{}'",
                        name, scale, entry.name
                    )));
                }
            }
        }

        Ok(Self {
            name,
            version,
            registers,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GwSrvError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn registers(&self) -> &[RegisterEntry] {
        &self.registers
    }

    pub fn entry(&self, name: &str) -> Option<&RegisterEntry> {
        self.registers.iter().find(|e| e.name == name)
    }

    /// Addresses to read once per cycle, sorted and deduplicated
    pub fn addresses(&self) -> Vec<u16> {
        let mut addrs: Vec<u16> = self.registers.iter().map(|e| e.address).collect();
        addrs.sort_unstable();
        addrs.dedup();
        addrs
    }

    /// Decode a snapshot. Registers absent from the snapshot are left out.
    pub fn decode(&self, snapshot: &RegisterSnapshot) -> DecodedSignal {
        let mut signal = DecodedSignal::new();
        for entry in &self.registers {
            if let Some(&raw) = snapshot.get(&entry.address) {
                signal.insert(entry.name.clone(), entry.decode(raw));
            }
        }
        signal
    }
}

// ============================================================================
// Built-in maps
// ============================================================================

fn drive_stat_codes() -> Vec<(i64, EnumEntry)> {
    vec![
        (0, EnumEntry::operation("stop")),
        (1, EnumEntry::fault("fault")),
        (2, EnumEntry::operation("run")),
    ]
}

fn drive_dir_codes() -> Vec<(i64, EnumEntry)> {
    vec![
        (1, EnumEntry::operation("stop")),
        (2, EnumEntry::operation("fwd")),
        (4, EnumEntry::operation("reverse")),
    ]
}

/// Built-in Modbus TCP drive map
pub fn builtin_tcp() -> Arc<RegisterMap> {
    static MAP: OnceLock<Arc<RegisterMap>> = OnceLock::new();
    MAP.get_or_init(|| {
        Arc::new(RegisterMap {
            name: "drive-tcp".to_string(),
            version: 1,
            registers: vec![
                RegisterEntry::scaled("freqRef", 5, 0.01),
                RegisterEntry::plain("accTime", 7),
                RegisterEntry::plain("decTime", 8),
                RegisterEntry::scaled("curr", 9, 0.1),
                RegisterEntry::scaled("freq", 10, 0.01),
                RegisterEntry::plain("volt", 11),
                RegisterEntry::plain("voltDcLink", 12),
                RegisterEntry::scaled("power", 13, 0.1),
                RegisterEntry::plain("fault", 15),
                RegisterEntry::enumerated("stat", 17, &drive_stat_codes()),
                RegisterEntry::enumerated("dir", 19, &drive_dir_codes()),
                RegisterEntry::plain("speed", 786),
                RegisterEntry::plain("alarm", 816),
                RegisterEntry::plain("temp", 861),
            ],
        })
    })
    .clone()
}

/// Built-in Modbus RTU drive map
pub fn builtin_serial() -> Arc<RegisterMap> {
    static MAP: OnceLock<Arc<RegisterMap>> = OnceLock::new();
    MAP.get_or_init(|| {
        Arc::new(RegisterMap {
            name: "drive-serial".to_string(),
            version: 1,
            registers: vec![
                RegisterEntry::scaled("freqRef", 4, 0.01),
                RegisterEntry::enumerated("dir", 5, &drive_dir_codes()),
                RegisterEntry::plain("accTime", 6),
                RegisterEntry::plain("decTime", 7),
                RegisterEntry::scaled("curr", 8, 0.1),
                RegisterEntry::scaled("freq", 9, 0.01),
                RegisterEntry::plain("volt", 10),
                RegisterEntry::scaled("power", 12, 0.1),
                RegisterEntry::enumerated("stat", 16, &drive_stat_codes()),
                RegisterEntry::plain("speed", 785),
                RegisterEntry::plain("alarm", 815),
                RegisterEntry::plain("temp", 860),
            ],
        })
    })
    .clone()
}

/// Built-in LOGO controller map
pub fn builtin_logo() -> Arc<RegisterMap> {
    static MAP: OnceLock<Arc<RegisterMap>> = OnceLock::new();
    MAP.get_or_init(|| {
        let voltage = "voltage fault";
        let low_level = "low level fault";
        let confirm = "confirmation fault";
        let decel = "decelerating";
        let status = [
            (1, EnumEntry::fault(voltage)),
            (3, EnumEntry::fault(voltage)),
            (9, EnumEntry::fault(voltage)),
            (32, EnumEntry::fault(low_level)),
            (34, EnumEntry::fault(low_level)),
            (41, EnumEntry::fault("thermal or drive fault")),
            (97, EnumEntry::operation("high pressure (count)")),
            (161, EnumEntry::fault("start failed")),
            (163, EnumEntry::operation("operating")),
            (512, EnumEntry::operation("logo restarting")),
            (520, EnumEntry::operation("restarting")),
            (521, EnumEntry::fault(voltage)),
            (544, EnumEntry::fault(low_level)),
            (545, EnumEntry::operation("idle")),
            (546, EnumEntry::fault(low_level)),
            (547, EnumEntry::operation(decel)),
            (577, EnumEntry::fault(voltage)),
            (608, EnumEntry::fault(low_level)),
            (609, EnumEntry::operation("high pressure stop")),
            (611, EnumEntry::operation(decel)),
            (673, EnumEntry::operation("on by selector")),
            (675, EnumEntry::operation("operation")),
            (737, EnumEntry::operation("accelerating")),
            (739, EnumEntry::operation("operation")),
            (1569, EnumEntry::fault(confirm)),
            (1633, EnumEntry::fault(confirm)),
            (4705, EnumEntry::operation("in transit")),
            (4707, EnumEntry::operation(decel)),
        ];
        Arc::new(RegisterMap {
            name: "logo".to_string(),
            version: 1,
            registers: vec![
                RegisterEntry::enumerated("status", 0, &status),
                RegisterEntry::plain("restartTime", 1),
                RegisterEntry::plain("voltageResetTime", 2),
                RegisterEntry::plain("autoResetTime", 4),
                RegisterEntry::plain("workHours", 5),
                RegisterEntry::plain("workMinutes", 6),
                RegisterEntry::plain("lowLevelResetTime", 8),
                RegisterEntry::plain("highPressureCount", 11),
                RegisterEntry::plain("networkPressure", 16),
                RegisterEntry::plain("dischargePressure", 17),
            ],
        })
    })
    .clone()
}

/// The three maps in use, one per transport kind. Loaded once at startup.
#[derive(Debug, Clone)]
pub struct RegisterMaps {
    pub tcp: Arc<RegisterMap>,
    pub serial: Arc<RegisterMap>,
    pub logo: Arc<RegisterMap>,
}

impl Default for RegisterMaps {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RegisterMaps {
    pub fn builtin() -> Self {
        Self {
            tcp: builtin_tcp(),
            serial: builtin_serial(),
            logo: builtin_logo(),
        }
    }

    /// Built-ins, overridden by `tcp.yaml` / `serial.yaml` / `logo.yaml`
    /// found in `dir`
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut maps = Self::builtin();
        let Some(dir) = dir else {
            return Ok(maps);
        };

        for kind in [TransportKind::Tcp, TransportKind::Serial, TransportKind::Logo] {
            let path = dir.join(format!("{}.yaml", kind.as_str()));
            if !path.exists() {
                debug!("No {} map override at {:?}", kind, path);
                continue;
            }
            let map = Arc::new(RegisterMap::from_file(&path)?);
            info!(
                "Register map override: {} -> '{}' v{} ({} registers)",
                kind,
                map.name(),
                map.version(),
                map.registers().len()
            );
            match kind {
                TransportKind::Tcp => maps.tcp = map,
                TransportKind::Serial => maps.serial = map,
                TransportKind::Logo => maps.logo = map,
            }
        }
        Ok(maps)
    }

    pub fn for_kind(&self, kind: TransportKind) -> Arc<RegisterMap> {
        match kind {
            TransportKind::Tcp => Arc::clone(&self.tcp),
            TransportKind::Serial => Arc::clone(&self.serial),
            TransportKind::Logo => Arc::clone(&self.logo),
        }
    }
}

//! Device commands as fixed register/coil write sequences

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transport::{ProtocolConnection, TransportKind};
use crate::error::GwSrvError;

/// Remote command accepted by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    Restart,
    SetLocal,
    SetRemote,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::TurnOn => "turn_on",
            DeviceCommand::TurnOff => "turn_off",
            DeviceCommand::Restart => "restart",
            DeviceCommand::SetLocal => "set_local",
            DeviceCommand::SetRemote => "set_remote",
        }
    }

    /// Parse an `update-status` value: `on`/`off`/`restart`/`local`/`remote`
    /// or the legacy numeric codes 1/0/2
    pub fn from_status_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => match n.as_i64()? {
                1 => Some(DeviceCommand::TurnOn),
                0 => Some(DeviceCommand::TurnOff),
                2 => Some(DeviceCommand::Restart),
                _ => None,
            },
            serde_json::Value::Bool(true) => Some(DeviceCommand::TurnOn),
            serde_json::Value::Bool(false) => Some(DeviceCommand::TurnOff),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceCommand {
    type Err = GwSrvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "turn_on" | "1" => Ok(DeviceCommand::TurnOn),
            "off" | "turn_off" | "0" => Ok(DeviceCommand::TurnOff),
            "restart" | "2" => Ok(DeviceCommand::Restart),
            "local" | "set_local" => Ok(DeviceCommand::SetLocal),
            "remote" | "set_remote" => Ok(DeviceCommand::SetRemote),
            other => Err(GwSrvError::validation(format!("unknown command '{}'", other))),
        }
    }
}

/// One write against a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteOp {
    Register { address: u16, value: u16 },
    Coil { address: u16, value: bool },
}

const fn reg(address: u16, value: u16) -> WriteOp {
    WriteOp::Register { address, value }
}

const fn coil(address: u16) -> WriteOp {
    WriteOp::Coil {
        address,
        value: true,
    }
}

/// Write sequences for one transport's device
#[derive(Debug)]
pub struct CommandTable {
    pub turn_on: &'static [WriteOp],
    pub turn_off: &'static [WriteOp],
    pub restart: &'static [WriteOp],
    /// Empty when the device has no local/remote mode
    pub set_local: &'static [WriteOp],
    pub set_remote: &'static [WriteOp],
}

/// TCP drive: status@898 (3 on, 0 off), mode@4358 (2 local, 4 remote),
/// restart pulse@901
pub static TCP_COMMANDS: CommandTable = CommandTable {
    turn_on: &[reg(898, 3)],
    turn_off: &[reg(898, 0)],
    restart: &[reg(901, 1), reg(901, 0), reg(898, 3)],
    set_local: &[reg(4358, 2)],
    set_remote: &[reg(4358, 4)],
};

/// RTU drive: status@897 (3 on, 0 off), mode@4357 (2 local, 3 remote),
/// restart pulse@900
pub static SERIAL_COMMANDS: CommandTable = CommandTable {
    turn_on: &[reg(897, 3)],
    turn_off: &[reg(897, 0)],
    restart: &[reg(900, 1), reg(900, 0), reg(897, 3)],
    set_local: &[reg(4357, 2)],
    set_remote: &[reg(4357, 3)],
};

/// LOGO: one coil per action
pub static LOGO_COMMANDS: CommandTable = CommandTable {
    turn_on: &[coil(3)],
    turn_off: &[coil(4)],
    restart: &[coil(5)],
    set_local: &[],
    set_remote: &[],
};

impl CommandTable {
    pub fn for_kind(kind: TransportKind) -> &'static CommandTable {
        match kind {
            TransportKind::Tcp => &TCP_COMMANDS,
            TransportKind::Serial => &SERIAL_COMMANDS,
            TransportKind::Logo => &LOGO_COMMANDS,
        }
    }

    pub fn sequence(&self, command: DeviceCommand) -> &'static [WriteOp] {
        match command {
            DeviceCommand::TurnOn => self.turn_on,
            DeviceCommand::TurnOff => self.turn_off,
            DeviceCommand::Restart => self.restart,
            DeviceCommand::SetLocal => self.set_local,
            DeviceCommand::SetRemote => self.set_remote,
        }
    }

    pub fn supports(&self, command: DeviceCommand) -> bool {
        !self.sequence(command).is_empty()
    }
}

/// Execute `command` on `conn`.
///
/// Refused up front when the transport is not connected. Writes stop at the
/// first failure; `true` only when every write succeeded.
pub async fn execute(conn: &dyn ProtocolConnection, command: DeviceCommand) -> bool {
    let kind = conn.kind();
    let sequence = CommandTable::for_kind(kind).sequence(command);
    if sequence.is_empty() {
        debug!("{} not supported on {}", command, kind);
        return false;
    }
    if !conn.is_connected() {
        warn!("{} on {} {} refused: not connected", command, kind, conn.endpoint());
        return false;
    }

    for op in sequence {
        let ok = match *op {
            WriteOp::Register { address, value } => conn.write_register(address, value).await,
            WriteOp::Coil { address, value } => conn.write_coil(address, value).await,
        };
        if !ok {
            warn!("{} on {} {} failed at {:?}", command, kind, conn.endpoint(), op);
            return false;
        }
    }
    debug!("{} on {} {} done", command, kind, conn.endpoint());
    true
}

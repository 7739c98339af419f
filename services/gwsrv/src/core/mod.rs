//! Domain core: register maps, signals, device config, transports, commands

pub mod command;
pub mod device;
pub mod register_map;
pub mod signal;
pub mod transport;

pub use command::{CommandTable, DeviceCommand, WriteOp};
pub use device::{ConnectionConfig, DefaultReader, DeviceRecord, Mode};
pub use register_map::{RegisterEntry, RegisterMap, RegisterMaps};
pub use signal::{DecodedSignal, RegisterSnapshot, Severity, SignalGroup, SignalReading, SignalValue};
pub use transport::{ConnectionFactory, ProtocolConnection, TransportKind};

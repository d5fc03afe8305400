//! Domain error enums, one per component contract. Kept granular so HTTP
//! handlers can map a specific variant to a specific status code instead of
//! matching on error message strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transaction on {port} timed out after {millis}ms")]
    Timeout { port: String, millis: u64 },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} not found")]
    NotFound(i64),
    #[error("device name {0:?} is already in use")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error("transient storage error: {0}")]
    Transient(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler did not pause within the configured bound")]
    Busy,
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Modbus(#[from] crate::modbus::ModbusError),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("validation failed: {0}")]
    Validation(String),
}

//! Bridges an operator intent ("set emissivity to 0.95 on device 3") to
//! the Bus Arbiter under an exclusive Scheduler pause, so parameter I/O
//! never interleaves with polling on the same bus.

use std::sync::Arc;
use std::time::Instant;

use crate::bus::{BusArbiter, Transaction, TransactionKind};
use crate::error::ParamError;
use crate::modbus;
use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::serial::SerialConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    Emissivity,
    Slope,
    MeasurementMode,
    TimeInterval,
    TempLowerLimit,
    TempUpperLimit,
}

impl ParamId {
    fn register(self) -> u16 {
        match self {
            ParamId::Emissivity => 0x0000,
            ParamId::Slope => 0x0001,
            ParamId::MeasurementMode => 0x0002,
            ParamId::TimeInterval => 0x0003,
            ParamId::TempLowerLimit => 0x0004,
            ParamId::TempUpperLimit => 0x0005,
        }
    }

    pub const ALL_IN_ORDER: [ParamId; 6] = [
        ParamId::Emissivity,
        ParamId::Slope,
        ParamId::MeasurementMode,
        ParamId::TimeInterval,
        ParamId::TempLowerLimit,
        ParamId::TempUpperLimit,
    ];
}

/// Validate a value for `param` and encode it into the single u16 the
/// register expects.
fn validate_and_encode(param: ParamId, value: f32) -> Result<u16, ParamError> {
    match param {
        ParamId::Emissivity | ParamId::Slope => {
            if !(0.20..=1.00).contains(&value) {
                return Err(ParamError::Validation(format!(
                    "value {value} out of range 0.20..=1.00"
                )));
            }
            Ok((value * 100.0).round() as u16)
        }
        ParamId::MeasurementMode => {
            if value != 0.0 && value != 1.0 {
                return Err(ParamError::Validation("mode must be 0 or 1".into()));
            }
            Ok(value as u16)
        }
        ParamId::TimeInterval => {
            if !(1.0..=3600.0).contains(&value) {
                return Err(ParamError::Validation(
                    "interval must be in 1..=3600 seconds".into(),
                ));
            }
            Ok(value as u16)
        }
        ParamId::TempLowerLimit | ParamId::TempUpperLimit => {
            if !(0.0..=3000.0).contains(&value) {
                return Err(ParamError::Validation(
                    "temperature limit must be in 0..=3000".into(),
                ));
            }
            Ok(value as u16)
        }
    }
}

fn decode(param: ParamId, raw: u16) -> f32 {
    match param {
        ParamId::Emissivity | ParamId::Slope => raw as f32 / 100.0,
        _ => raw as f32,
    }
}

pub struct ParameterService {
    scheduler: Arc<Scheduler>,
    registry: DeviceRegistry,
}

impl ParameterService {
    pub fn new(scheduler: Arc<Scheduler>, registry: DeviceRegistry) -> Self {
        ParameterService { scheduler, registry }
    }

    /// The registered device's own `baud_rate` takes priority over the
    /// caller-supplied one, so a client addressing a known device doesn't
    /// need to know (or can't get wrong) how it's configured to talk.
    async fn resolve_baud_rate(&self, com_port: &str, slave_id: u8, requested: u32) -> u32 {
        match self.registry.find_by_com_port_and_slave_id(com_port, slave_id).await {
            Ok(Some(device)) => device.baud_rate,
            _ => requested,
        }
    }

    async fn arbiter_for(&self, com_port: &str, baud_rate: u32) -> Arc<BusArbiter> {
        if let Some(arbiter) = self.scheduler.arbiter_for(com_port).await {
            return arbiter;
        }
        // No enabled devices currently poll this bus; spin up a transient
        // arbiter just for this parameter call.
        Arc::new(BusArbiter::spawn(
            com_port.to_string(),
            SerialConfig::eight_n_one(baud_rate),
        ))
    }

    pub async fn read_parameter(
        &self,
        slave_id: u8,
        com_port: &str,
        baud_rate: u32,
        param: ParamId,
        timeout: std::time::Duration,
    ) -> Result<f32, ParamError> {
        let lease = self.scheduler.pause().await?;
        let result = self.read_parameter_inner(slave_id, com_port, baud_rate, param, timeout).await;
        self.scheduler.resume(lease).await;
        result
    }

    async fn read_parameter_inner(
        &self,
        slave_id: u8,
        com_port: &str,
        baud_rate: u32,
        param: ParamId,
        timeout: std::time::Duration,
    ) -> Result<f32, ParamError> {
        let baud_rate = self.resolve_baud_rate(com_port, slave_id, baud_rate).await;
        let arbiter = self.arbiter_for(com_port, baud_rate).await;
        let request = modbus::build_request(slave_id, modbus::FUNC_READ_HOLDING, param.register(), 1);
        let txn = Transaction {
            kind: TransactionKind::Control,
            request,
            expected_reply_len: modbus::expected_read_reply_len(1),
            deadline: Instant::now() + timeout,
        };
        let bytes = arbiter.submit(txn).await?;
        let payload = modbus::parse_read_response(&bytes, slave_id, modbus::FUNC_READ_HOLDING)?;
        let raw = u16::from_be_bytes([payload.raw[0], payload.raw[1]]);
        Ok(decode(param, raw))
    }

    pub async fn write_parameter(
        &self,
        slave_id: u8,
        com_port: &str,
        baud_rate: u32,
        param: ParamId,
        value: f32,
        timeout: std::time::Duration,
    ) -> Result<f32, ParamError> {
        let encoded = validate_and_encode(param, value)?;
        let lease = self.scheduler.pause().await?;
        let result = self
            .write_parameter_inner(slave_id, com_port, baud_rate, param, encoded, timeout)
            .await;
        self.scheduler.resume(lease).await;
        result.map(|_| decode(param, encoded))
    }

    async fn write_parameter_inner(
        &self,
        slave_id: u8,
        com_port: &str,
        baud_rate: u32,
        param: ParamId,
        encoded: u16,
        timeout: std::time::Duration,
    ) -> Result<(), ParamError> {
        let baud_rate = self.resolve_baud_rate(com_port, slave_id, baud_rate).await;
        let arbiter = self.arbiter_for(com_port, baud_rate).await;
        let request = modbus::build_write_single(slave_id, param.register(), encoded);
        let txn = Transaction {
            kind: TransactionKind::Control,
            request: request.clone(),
            expected_reply_len: modbus::expected_write_reply_len(),
            deadline: Instant::now() + timeout,
        };
        let bytes = arbiter.submit(txn).await?;
        modbus::parse_write_echo(&bytes, &request)?;
        Ok(())
    }

    /// Issue all six reads under one Pause/Resume bracket, in the fixed
    /// order `ParamId::ALL_IN_ORDER`.
    pub async fn read_all(
        &self,
        slave_id: u8,
        com_port: &str,
        baud_rate: u32,
        timeout: std::time::Duration,
    ) -> Result<Vec<(ParamId, f32)>, ParamError> {
        let lease = self.scheduler.pause().await?;
        let mut out = Vec::new();
        let mut err = None;
        for param in ParamId::ALL_IN_ORDER {
            match self.read_parameter_inner(slave_id, com_port, baud_rate, param, timeout).await {
                Ok(value) => out.push((param, value)),
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        self.scheduler.resume(lease).await;
        match err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emissivity_encodes_as_round_times_100() {
        assert_eq!(validate_and_encode(ParamId::Emissivity, 0.95).unwrap(), 95);
    }

    #[test]
    fn emissivity_below_range_is_rejected() {
        assert!(validate_and_encode(ParamId::Emissivity, 0.1).is_err());
    }

    #[test]
    fn emissivity_above_range_is_rejected() {
        assert!(validate_and_encode(ParamId::Emissivity, 1.01).is_err());
    }

    #[test]
    fn mode_must_be_zero_or_one() {
        assert!(validate_and_encode(ParamId::MeasurementMode, 2.0).is_err());
        assert_eq!(validate_and_encode(ParamId::MeasurementMode, 1.0).unwrap(), 1);
    }

    #[test]
    fn interval_boundaries() {
        assert!(validate_and_encode(ParamId::TimeInterval, 0.0).is_err());
        assert!(validate_and_encode(ParamId::TimeInterval, 3601.0).is_err());
        assert_eq!(validate_and_encode(ParamId::TimeInterval, 1.0).unwrap(), 1);
    }

    #[test]
    fn decode_is_inverse_of_encode_for_emissivity() {
        let encoded = validate_and_encode(ParamId::Emissivity, 0.70).unwrap();
        assert_eq!(decode(ParamId::Emissivity, encoded), 0.70);
    }
}

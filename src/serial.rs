//! Owns a single serial handle and implements the Transaction contract:
//! flush, enforce inter-frame silence, write, read until reply length or
//! timeout. Not safe for concurrent use — the [`crate::bus::BusArbiter`]
//! guarantees single-caller access by running every transaction on one
//! dedicated thread.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: serialport::DataBits,
    pub stop_bits: serialport::StopBits,
    pub parity: serialport::Parity,
}

impl SerialConfig {
    pub fn eight_n_one(baud_rate: u32) -> Self {
        SerialConfig {
            baud_rate,
            data_bits: serialport::DataBits::Eight,
            stop_bits: serialport::StopBits::One,
            parity: serialport::Parity::None,
        }
    }

    /// Inter-frame silence (3.5 char-times) in milliseconds, clamped to a
    /// sane floor since very high baud rates would otherwise round to ~0.
    pub fn inter_frame_gap(&self) -> Duration {
        let char_time_ms = 11.0 / self.baud_rate as f64 * 1000.0;
        let gap_ms = (char_time_ms * 3.5).max(1.0);
        Duration::from_micros((gap_ms * 1000.0) as u64)
    }

    /// Intra-frame idle (1.5 char-times), the point at which a partially
    /// received frame is declared short rather than continuing to wait.
    pub fn intra_frame_idle(&self) -> Duration {
        let char_time_ms = 11.0 / self.baud_rate as f64 * 1000.0;
        let gap_ms = (char_time_ms * 1.5).max(1.0);
        Duration::from_micros((gap_ms * 1000.0) as u64)
    }
}

pub struct SerialTransport {
    port_name: String,
    config: SerialConfig,
    handle: Option<Box<dyn serialport::SerialPort>>,
    last_transaction_end: Option<Instant>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>, config: SerialConfig) -> Self {
        SerialTransport {
            port_name: port_name.into(),
            config,
            handle: None,
            last_transaction_end: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Idempotent: a no-op if already open.
    pub fn open(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.port_name, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|source| TransportError::Open {
                port: self.port_name.clone(),
                source,
            })?;
        self.handle = Some(port);
        Ok(())
    }

    /// Idempotent: a no-op if already closed.
    pub fn close(&mut self) {
        self.handle = None;
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.close();
        self.open()
    }

    fn wait_inter_frame_gap(&self) {
        let gap = self.config.inter_frame_gap();
        if let Some(last_end) = self.last_transaction_end {
            let elapsed = last_end.elapsed();
            if elapsed < gap {
                std::thread::sleep(gap - elapsed);
            }
        }
    }

    /// Run one request/response transaction: flush input, honour the
    /// inter-frame gap since the previous transaction, write the request,
    /// then read until `expected_reply_len` bytes arrive or `read_timeout`
    /// elapses (continuing past a partial read only up to the intra-frame
    /// idle bound).
    pub fn transaction(
        &mut self,
        request: &[u8],
        expected_reply_len: usize,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.open()?;
        self.wait_inter_frame_gap();

        let port_name = self.port_name.clone();
        let handle = self.handle.as_mut().expect("opened above");

        let _ = handle.clear(serialport::ClearBuffer::Input);

        if let Err(source) = handle.write_all(request) {
            self.last_transaction_end = Some(Instant::now());
            let _ = self.reopen();
            return Err(TransportError::Io { port: port_name, source });
        }

        let result = self.read_reply(expected_reply_len, read_timeout);
        self.last_transaction_end = Some(Instant::now());
        if result.is_err() {
            let _ = self.reopen();
        }
        result
    }

    fn read_reply(
        &mut self,
        expected_reply_len: usize,
        read_timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let port_name = self.port_name.clone();
        let intra_idle = self.config.intra_frame_idle();
        let handle = self.handle.as_mut().expect("opened by caller");

        let deadline = Instant::now() + read_timeout;
        let mut buf = Vec::with_capacity(expected_reply_len);
        let mut last_progress = Instant::now();
        let mut scratch = [0u8; 256];

        loop {
            if buf.len() >= expected_reply_len {
                return Ok(buf);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    port: port_name,
                    millis: read_timeout.as_millis() as u64,
                });
            }
            match handle.read(&mut scratch) {
                Ok(0) => {}
                Ok(n) => {
                    buf.extend_from_slice(&scratch[..n]);
                    last_progress = Instant::now();
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(source) => return Err(TransportError::Io { port: port_name, source }),
            }
            if !buf.is_empty() && buf.len() < expected_reply_len && last_progress.elapsed() > intra_idle {
                return Err(TransportError::Timeout {
                    port: port_name,
                    millis: read_timeout.as_millis() as u64,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inter_frame_gap_is_reasonable_at_9600_baud() {
        let cfg = SerialConfig::eight_n_one(9600);
        let gap = cfg.inter_frame_gap();
        assert!(gap.as_micros() > 0);
        assert!(gap < Duration::from_millis(50));
    }

    #[test]
    fn higher_baud_yields_shorter_gap() {
        let slow = SerialConfig::eight_n_one(1200).inter_frame_gap();
        let fast = SerialConfig::eight_n_one(115200).inter_frame_gap();
        assert!(fast < slow);
    }
}

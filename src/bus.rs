//! One arbiter per COM port. Owns a dedicated OS thread running the
//! blocking [`crate::serial::SerialTransport`]; async callers `Submit` a
//! transaction and await its result. Because every transaction for a bus
//! flows through one `flume` channel into one thread, submissions are
//! naturally serialised in FIFO order and two transactions' bytes never
//! overlap on the wire — the same "dedicated worker thread + channel"
//! shape this codebase uses for all blocking serial I/O.

use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::serial::{SerialConfig, SerialTransport};

/// How a submission should be accounted for in scheduler stats. The
/// Arbiter itself treats both the same way; the tag exists for callers to
/// attribute transactions without the Arbiter reordering anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Poll,
    Control,
}

pub struct Transaction {
    pub kind: TransactionKind,
    pub request: Vec<u8>,
    pub expected_reply_len: usize,
    pub deadline: Instant,
}

struct Job {
    request: Vec<u8>,
    expected_reply_len: usize,
    timeout: Duration,
    reply: tokio::sync::oneshot::Sender<Result<Vec<u8>, TransportError>>,
}

pub struct BusArbiter {
    port_name: String,
    job_tx: flume::Sender<Job>,
    _thread: std::thread::JoinHandle<()>,
}

impl BusArbiter {
    pub fn spawn(port_name: impl Into<String>, config: SerialConfig) -> Self {
        let port_name = port_name.into();
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        let thread_port_name = port_name.clone();

        let thread = std::thread::Builder::new()
            .name(format!("bus-arbiter-{thread_port_name}"))
            .spawn(move || {
                let mut transport = SerialTransport::new(thread_port_name.clone(), config);
                while let Ok(job) = job_rx.recv() {
                    let result = transport.transaction(&job.request, job.expected_reply_len, job.timeout);
                    if let Err(ref err) = result {
                        log::warn!("bus {thread_port_name}: transaction failed: {err}");
                    }
                    let _ = job.reply.send(result);
                }
                transport.close();
            })
            .expect("failed to spawn bus arbiter thread");

        BusArbiter {
            port_name,
            job_tx,
            _thread: thread,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Blocks the calling async task (not the thread) until the transaction
    /// completes or its deadline expires. On deadline, the Arbiter thread
    /// itself will still finish the attempt and report `ErrTimeout`; the
    /// bus remains usable for the next submission either way.
    pub async fn submit(&self, txn: Transaction) -> Result<Vec<u8>, TransportError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let timeout = txn.deadline.saturating_duration_since(Instant::now());
        let job = Job {
            request: txn.request,
            expected_reply_len: txn.expected_reply_len,
            timeout,
            reply: reply_tx,
        };
        self.job_tx
            .send_async(job)
            .await
            .map_err(|_| TransportError::Io {
                port: self.port_name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bus thread gone"),
            })?;
        reply_rx.await.map_err(|_| TransportError::Io {
            port: self.port_name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "bus thread dropped reply"),
        })?
    }
}

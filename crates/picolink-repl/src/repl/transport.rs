//! Byte transport abstraction.
//!
//! The driver only ever talks to a [`ReplTransport`]: an opaque duplex byte
//! channel. Two implementations live here: a `serialport`-backed adapter
//! for real boards and a fully in-memory one for tests. [`TransportHandle`]
//! sits on top and enforces that at most one reader and one writer are
//! live at any time.

use crate::repl::error::{ReplError, ReplResult};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic duplex byte channel.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from the reader task and the operation in flight.
#[async_trait::async_trait]
pub trait ReplTransport: Send + Sync {
    /// Open the channel at the given baud rate.
    async fn open(&self, baud_rate: u32) -> ReplResult<()>;

    /// Close the channel. A pending or later `read` returns `Ok(None)`.
    async fn close(&self) -> ReplResult<()>;

    /// Next inbound chunk of at most `max_len` bytes.
    ///
    /// `Ok(None)` marks the end of the stream. An empty chunk means nothing
    /// arrived within the transport's own poll window.
    async fn read(&self, max_len: usize) -> ReplResult<Option<Vec<u8>>>;

    /// Write all of `data`.
    async fn write(&self, data: &[u8]) -> ReplResult<()>;

    fn is_open(&self) -> bool;

    fn port_name(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Exclusive reader / writer leases
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared handle over a transport that hands out at most one reader and
/// one writer lease at a time.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<dyn ReplTransport>,
    reader_held: Arc<AtomicBool>,
    writer_held: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn new(inner: Arc<dyn ReplTransport>) -> Self {
        Self {
            inner,
            reader_held: Arc::new(AtomicBool::new(false)),
            writer_held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transport(&self) -> &Arc<dyn ReplTransport> {
        &self.inner
    }

    pub fn port_name(&self) -> &str {
        self.inner.port_name()
    }

    pub fn acquire_reader(&self) -> ReplResult<ReaderLease> {
        if self
            .reader_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReplError::reader_busy(self.inner.port_name()));
        }
        Ok(ReaderLease {
            inner: self.inner.clone(),
            held: self.reader_held.clone(),
        })
    }

    pub fn acquire_writer(&self) -> ReplResult<WriterLease> {
        if self
            .writer_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReplError::writer_busy(self.inner.port_name()));
        }
        Ok(WriterLease {
            inner: self.inner.clone(),
            held: self.writer_held.clone(),
        })
    }

    pub fn reader_held(&self) -> bool {
        self.reader_held.load(Ordering::SeqCst)
    }

    pub fn writer_held(&self) -> bool {
        self.writer_held.load(Ordering::SeqCst)
    }
}

/// The single live reader. Dropping it releases the read side.
pub struct ReaderLease {
    inner: Arc<dyn ReplTransport>,
    held: Arc<AtomicBool>,
}

impl ReaderLease {
    pub async fn read(&self, max_len: usize) -> ReplResult<Option<Vec<u8>>> {
        self.inner.read(max_len).await
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

/// The single live writer. Dropping it releases the write side.
pub struct WriterLease {
    inner: Arc<dyn ReplTransport>,
    held: Arc<AtomicBool>,
}

impl WriterLease {
    pub async fn write(&self, data: &[u8]) -> ReplResult<()> {
        self.inner.write(data).await
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  serialport-backed transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SharedPort = Arc<std::sync::Mutex<Box<dyn serialport::SerialPort>>>;

/// Real serial port. Blocking reads run on the blocking pool with a short
/// timeout, so a `close()` ends the stream within one poll window.
pub struct SerialPortTransport {
    name: String,
    poll_timeout: Duration,
    open: AtomicBool,
    reader: std::sync::Mutex<Option<SharedPort>>,
    writer: std::sync::Mutex<Option<SharedPort>>,
}

impl SerialPortTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            poll_timeout: Duration::from_millis(20),
            open: AtomicBool::new(false),
            reader: std::sync::Mutex::new(None),
            writer: std::sync::Mutex::new(None),
        })
    }

    fn slot(
        slot: &std::sync::Mutex<Option<SharedPort>>,
    ) -> ReplResult<Option<SharedPort>> {
        slot.lock()
            .map(|guard| guard.clone())
            .map_err(|_| ReplError::transport("serial port state poisoned"))
    }
}

#[async_trait::async_trait]
impl ReplTransport for SerialPortTransport {
    async fn open(&self, baud_rate: u32) -> ReplResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(ReplError::transport(format!("Port {} already open", self.name)));
        }
        let name = self.name.clone();
        let timeout = self.poll_timeout;
        let (reader, writer) = tokio::task::spawn_blocking(move || -> ReplResult<_> {
            let port = serialport::new(name, baud_rate).timeout(timeout).open()?;
            let writer = port.try_clone()?;
            Ok((port, writer))
        })
        .await
        .map_err(|e| ReplError::transport(format!("open task failed: {}", e)))??;

        *self
            .reader
            .lock()
            .map_err(|_| ReplError::transport("serial port state poisoned"))? =
            Some(Arc::new(std::sync::Mutex::new(reader)));
        *self
            .writer
            .lock()
            .map_err(|_| ReplError::transport("serial port state poisoned"))? =
            Some(Arc::new(std::sync::Mutex::new(writer)));
        self.open.store(true, Ordering::SeqCst);
        log::info!("[repl:{}] port opened at {} baud", self.name, baud_rate);
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut r) = self.reader.lock() {
            r.take();
        }
        if let Ok(mut w) = self.writer.lock() {
            w.take();
        }
        log::info!("[repl:{}] port closed", self.name);
        Ok(())
    }

    async fn read(&self, max_len: usize) -> ReplResult<Option<Vec<u8>>> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(port) = Self::slot(&self.reader)? else {
            return Ok(None);
        };
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| ReplError::transport("serial port state poisoned"))?;
            let mut buf = vec![0u8; max_len.max(1)];
            match port.read(&mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Some(Vec::new())),
                Err(e) => Err(ReplError::from(e)),
            }
        })
        .await
        .map_err(|e| ReplError::transport(format!("read task failed: {}", e)))?
    }

    async fn write(&self, data: &[u8]) -> ReplResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::not_connected());
        }
        let Some(port) = Self::slot(&self.writer)? else {
            return Err(ReplError::not_connected());
        };
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| ReplError::transport("serial port state poisoned"))?;
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ReplError::transport(format!("write task failed: {}", e)))?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport. Bytes injected with [`inject_rx`] come out
/// of `read` in the same chunks; everything written is kept for assertions.
///
/// [`inject_rx`]: SimulatedTransport::inject_rx
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    rx_chunks: Mutex<VecDeque<Vec<u8>>>,
    tx_buf: Mutex<Vec<u8>>,
    write_lens: Mutex<Vec<usize>>,
    rx_notify: Notify,
}

impl SimulatedTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            rx_chunks: Mutex::new(VecDeque::new()),
            tx_buf: Mutex::new(Vec::with_capacity(4096)),
            write_lens: Mutex::new(Vec::new()),
            rx_notify: Notify::new(),
        })
    }

    /// Queue one inbound chunk (simulate the device sending data).
    pub async fn inject_rx(&self, data: &[u8]) {
        self.rx_chunks.lock().await.push_back(data.to_vec());
        self.rx_notify.notify_waiters();
    }

    /// Take everything written so far.
    pub async fn drain_tx(&self) -> Vec<u8> {
        std::mem::take(&mut *self.tx_buf.lock().await)
    }

    /// Copy of everything written so far.
    pub async fn peek_tx(&self) -> Vec<u8> {
        self.tx_buf.lock().await.clone()
    }

    /// Length of every `write` call so far, empty writes included.
    pub async fn write_lens(&self) -> Vec<usize> {
        self.write_lens.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ReplTransport for SimulatedTransport {
    async fn open(&self, _baud_rate: u32) -> ReplResult<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(ReplError::transport(format!("Port {} already open", self.name)));
        }
        Ok(())
    }

    async fn close(&self) -> ReplResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.rx_notify.notify_waiters();
        Ok(())
    }

    async fn read(&self, max_len: usize) -> ReplResult<Option<Vec<u8>>> {
        loop {
            let notified = self.rx_notify.notified();
            if !self.open.load(Ordering::SeqCst) {
                return Ok(None);
            }
            {
                let mut rx = self.rx_chunks.lock().await;
                if let Some(mut chunk) = rx.pop_front() {
                    if chunk.len() > max_len {
                        let rest = chunk.split_off(max_len);
                        rx.push_front(rest);
                    }
                    return Ok(Some(chunk));
                }
            }
            notified.await;
        }
    }

    async fn write(&self, data: &[u8]) -> ReplResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReplError::not_connected());
        }
        self.tx_buf.lock().await.extend_from_slice(data);
        self.write_lens.lock().await.push(data.len());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

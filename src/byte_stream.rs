//! `ByteStream`: the opaque duplex octet pipe collaborator (spec §6).
//!
//! The transport core treats the physical link as an external collaborator;
//! this module supplies the trait boundary plus the two concrete backings
//! this crate ships: TCP (always available) and UART (behind the `serial`
//! feature, via the `serialport` crate — no teacher/example repo provides a
//! serial-port precedent, but it is the standard blocking-I/O crate for this
//! job and matches the teacher's preference for a real ecosystem crate over
//! hand-rolled termios bindings). An in-memory duplex pipe backs unit tests.
//!
//! Methods take `&self` rather than `&mut self`: the RX worker and the TX
//! path (spec §4.2) run on different threads and both need the stream at
//! once, the way `std::net::TcpStream` already supports concurrent read and
//! write through a shared reference. `tx_lock` (owned by `MsgInterface`, not
//! by the stream) remains the only serialiser of outbound writes.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

/// Duplex byte pipe with blocking, deadline-bounded I/O (spec §6).
pub trait ByteStream: Send + Sync {
    /// Read up to `buf.len()` bytes, blocking until at least one byte is
    /// available or `deadline` elapses. Returns `Ok(0)` on timeout.
    fn read(&self, buf: &mut [u8], deadline: Instant) -> Result<usize>;

    /// Write the entirety of `buf`, blocking until `deadline`. Must be
    /// atomic up to the number of bytes actually written.
    fn write(&self, buf: &[u8], deadline: Instant) -> Result<usize>;

    /// Block until data is available to read or `deadline` elapses.
    fn poll_readable(&self, deadline: Instant) -> Result<bool>;

    /// Discard any buffered inbound bytes for up to `deadline`.
    fn drain(&self, deadline: Instant) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// TCP-backed `ByteStream`, used for the NPI server's client-facing socket
/// side (spec §4.4/§6).
pub struct TcpByteStream {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpByteStream {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: AtomicBool::new(false),
        })
    }

    fn apply_read_timeout(&self, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.stream
            .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        Ok(())
    }
}

impl ByteStream for TcpByteStream {
    fn read(&self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("stream closed"));
        }
        self.apply_read_timeout(deadline)?;
        match (&self.stream).read(buf) {
            Ok(0) => {
                self.closed.store(true, Ordering::Release);
                Err(anyhow!("peer closed connection"))
            }
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, buf: &[u8], deadline: Instant) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("stream closed"));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.stream
            .set_write_timeout(Some(remaining.max(Duration::from_millis(1))))?;
        (&self.stream).write_all(buf)?;
        Ok(buf.len())
    }

    fn poll_readable(&self, deadline: Instant) -> Result<bool> {
        let mut probe = [0u8; 1];
        self.apply_read_timeout(deadline)?;
        match self.stream.peek(&mut probe) {
            Ok(0) => {
                self.closed.store(true, Ordering::Release);
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drain(&self, deadline: Instant) -> Result<()> {
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match self.read(&mut buf, deadline) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(feature = "serial")]
pub struct SerialByteStream {
    port: Mutex<Box<dyn serialport::SerialPort>>,
    closed: AtomicBool,
}

#[cfg(feature = "serial")]
impl SerialByteStream {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Self {
            port: Mutex::new(port),
            closed: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "serial")]
impl ByteStream for SerialByteStream {
    fn read(&self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("stream closed"));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut port = self.port.lock().unwrap();
        port.set_timeout(remaining.max(Duration::from_millis(1)))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, buf: &[u8], deadline: Instant) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("stream closed"));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut port = self.port.lock().unwrap();
        port.set_timeout(remaining.max(Duration::from_millis(1)))?;
        port.write_all(buf)?;
        Ok(buf.len())
    }

    fn poll_readable(&self, deadline: Instant) -> Result<bool> {
        let port = self.port.lock().unwrap();
        let _ = deadline;
        Ok(port.bytes_to_read().unwrap_or(0) > 0)
    }

    fn drain(&self, deadline: Instant) -> Result<()> {
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match self.read(&mut buf, deadline) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One direction of an in-memory duplex pipe, used to wire up two
/// `DuplexByteStream`s back to back for unit tests.
#[derive(Default)]
struct PipeHalf {
    buf: Mutex<Vec<u8>>,
    signal: Condvar,
    closed: AtomicBool,
}

/// An in-memory `ByteStream` test double (spec §8's scenarios run entirely
/// without real UART/TCP). Construct a pair with [`duplex_pair`].
pub struct DuplexByteStream {
    inbound: std::sync::Arc<PipeHalf>,
    outbound: std::sync::Arc<PipeHalf>,
}

/// Build a connected pair: writes on one end become reads on the other.
pub fn duplex_pair() -> (DuplexByteStream, DuplexByteStream) {
    let a_to_b = std::sync::Arc::new(PipeHalf::default());
    let b_to_a = std::sync::Arc::new(PipeHalf::default());
    (
        DuplexByteStream {
            inbound: std::sync::Arc::clone(&b_to_a),
            outbound: std::sync::Arc::clone(&a_to_b),
        },
        DuplexByteStream {
            inbound: a_to_b,
            outbound: b_to_a,
        },
    )
}

impl ByteStream for DuplexByteStream {
    fn read(&self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        let mut guard = self.inbound.buf.lock().unwrap();
        loop {
            if !guard.is_empty() {
                let n = buf.len().min(guard.len());
                buf[..n].copy_from_slice(&guard[..n]);
                guard.drain(..n);
                return Ok(n);
            }
            if self.inbound.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            let (g, result) = self.inbound.signal.wait_timeout(guard, remaining).unwrap();
            guard = g;
            if result.timed_out() && guard.is_empty() {
                return Ok(0);
            }
        }
    }

    fn write(&self, buf: &[u8], _deadline: Instant) -> Result<usize> {
        let mut guard = self.outbound.buf.lock().unwrap();
        guard.extend_from_slice(buf);
        self.outbound.signal.notify_one();
        Ok(buf.len())
    }

    fn poll_readable(&self, deadline: Instant) -> Result<bool> {
        let guard = self.inbound.buf.lock().unwrap();
        if !guard.is_empty() {
            return Ok(true);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let (g, result) = self.inbound.signal.wait_timeout(guard, remaining).unwrap();
        Ok(!g.is_empty() && !result.timed_out())
    }

    fn drain(&self, _deadline: Instant) -> Result<()> {
        self.inbound.buf.lock().unwrap().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inbound.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.outbound.closed.store(true, Ordering::Release);
        self.outbound.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplex_pair_delivers_bytes() {
        let (a, b) = duplex_pair();
        let deadline = Instant::now() + Duration::from_millis(200);
        a.write(b"hello", deadline).unwrap();
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf, deadline).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn read_times_out_when_nothing_written() {
        let (_a, b) = duplex_pair();
        let deadline = Instant::now() + Duration::from_millis(20);
        let n = b.read(&mut [0u8; 4], deadline).unwrap();
        assert_eq!(n, 0);
    }
}

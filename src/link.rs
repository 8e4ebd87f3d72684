//! Serial link manager.
//!
//! Owns the connection state machine and the START/STOP handshake. The same
//! physical channel carries telemetry and out-of-band command traffic, so the
//! device is told explicitly when to stream and when to stop.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──start──▶ Streaming
//!       ▲                        │                 ▲                   │
//!       │                       err                └──────stop─────────┘
//!       └──────disconnect─── Error ◀─┘
//! ```

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::errors::{LinkError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default serial baud rate used by the leaf profile firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default read timeout for the serial port.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub const CMD_START: &str = "START";
pub const CMD_STOP: &str = "STOP";
pub const CMD_IOSTATUS: &str = "IOSTATUS";

/// Upper bound on a single buffered line before it is discarded.
const MAX_LINE_LEN: usize = 4096;

const READ_CHUNK: usize = 256;

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

impl ConnectionState {
    /// Whether an endpoint is open in this state.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Error => "in error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Transport Abstraction
// ============================================================================

/// Byte transport under the link, allowing real ports and in-memory wires.
pub trait Transport: Read + Write + Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> std::io::Result<usize>;

    /// Drop anything already sitting in the input buffer.
    fn discard_input(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let n = self.bytes_available()?;
            if n == 0 {
                return Ok(());
            }
            if self.read(&mut buf[..n.min(READ_CHUNK)])? == 0 {
                return Ok(());
            }
        }
    }
}

/// Opens transports. Swapped out in tests for an in-memory wire.
pub trait Connector: Send {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// A real serial port opened through the `serialport` crate.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|source| LinkError::Open {
                port: path.to_string(),
                source,
            })?;
        Ok(Self { port })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> std::io::Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        Ok(self.port.clear(ClearBuffer::Input)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(port, baud_rate, timeout)?))
    }
}

// ============================================================================
// Link Manager
// ============================================================================

pub struct LinkManager {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    port: Option<String>,
    read_timeout: Duration,
    line_buf: Vec<u8>,
}

impl LinkManager {
    pub fn new(connector: Box<dyn Connector>, read_timeout: Duration) -> Self {
        Self {
            connector,
            transport: None,
            state: ConnectionState::Disconnected,
            port: None,
            read_timeout,
            line_buf: Vec::new(),
        }
    }

    /// A link manager backed by real serial ports.
    pub fn serial(read_timeout: Duration) -> Self {
        Self::new(Box::new(SerialConnector), read_timeout)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Open `port_id`, tearing down any previous endpoint first.
    pub fn connect(&mut self, port_id: &str, baud_rate: u32) -> Result<()> {
        if self.transport.is_some() {
            debug!("closing {:?} before reconnecting", self.port);
            self.disconnect();
        }

        self.state = ConnectionState::Connecting;
        let mut transport = match self.connector.open(port_id, baud_rate, self.read_timeout) {
            Ok(t) => t,
            Err(e) => {
                warn!("connect failed: port={}, error={}", port_id, e);
                self.state = ConnectionState::Error;
                return Err(e);
            }
        };

        if let Err(e) = transport.discard_input() {
            warn!("could not clear input buffer on {}: {}", port_id, e);
        }

        self.transport = Some(transport);
        self.port = Some(port_id.to_string());
        self.line_buf.clear();
        self.state = ConnectionState::Connected;
        info!("connected: port={}, baud={}", port_id, baud_rate);
        Ok(())
    }

    /// Ask the device to start streaming telemetry.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(LinkError::InvalidState {
                operation: "start_streaming",
                state: self.state,
            });
        }

        if let Err(e) = self.write_line(CMD_START) {
            warn!("START handshake failed: {}", e);
            self.release();
            self.state = ConnectionState::Error;
            return Err(e);
        }

        self.line_buf.clear();
        self.state = ConnectionState::Streaming;
        info!("streaming started");
        Ok(())
    }

    /// Ask the device to stop streaming. Teardown completes even if STOP
    /// could not be sent; the write error is still returned.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state != ConnectionState::Streaming {
            return Err(LinkError::InvalidState {
                operation: "stop_streaming",
                state: self.state,
            });
        }

        match self.write_line(CMD_STOP) {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                info!("streaming stopped");
                Ok(())
            }
            Err(e) => {
                warn!("STOP handshake failed, closing link: {}", e);
                self.release();
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Release the endpoint. Calling this while disconnected is a no-op.
    pub fn disconnect(&mut self) {
        if self.transport.is_none() && self.state == ConnectionState::Disconnected {
            return;
        }
        self.release();
        self.state = ConnectionState::Disconnected;
        info!("disconnected");
    }

    /// Drop the endpoint after an I/O failure and enter `Error`.
    pub fn abort(&mut self) {
        self.release();
        self.state = ConnectionState::Error;
        warn!("link aborted after i/o failure");
    }

    /// Send an operator-entered command line.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        if !self.state.is_open() {
            return Err(LinkError::InvalidState {
                operation: "send_command",
                state: self.state,
            });
        }
        self.write_line(command.trim_end_matches(['\r', '\n']))
    }

    /// Write `text` followed by a newline.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
        debug!("tx: {}", text);
        transport.write_all(text.as_bytes())?;
        transport.write_all(b"\n")?;
        transport.flush()?;
        Ok(())
    }

    /// Return the next complete line if one can be assembled from the bytes
    /// currently available. Never waits for more input than is buffered.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(line) = self.take_buffered_line() {
                return Ok(Some(line));
            }

            let transport = self.transport.as_mut().ok_or(LinkError::NotConnected)?;
            let available = transport.bytes_available()?;
            if available == 0 {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let want = available.min(READ_CHUNK);
            match transport.read(&mut chunk[..want]) {
                Ok(0) => return Ok(None),
                Ok(n) => self.line_buf.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }

            if self.line_buf.len() > MAX_LINE_LEN && !self.line_buf.contains(&b'\n') {
                warn!(
                    "discarding {} bytes without a line terminator",
                    self.line_buf.len()
                );
                self.line_buf.clear();
            }
        }
    }

    /// Read every complete line currently available.
    pub fn drain_lines(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        while let Some(line) = self.read_line()? {
            lines.push(line);
        }
        Ok(lines)
    }

    fn take_buffered_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.line_buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.line_buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.flush();
        }
        self.port = None;
        self.line_buf.clear();
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockWire};

    fn manager(wire: &MockWire) -> LinkManager {
        LinkManager::new(
            Box::new(MockConnector::new(wire.clone())),
            DEFAULT_READ_TIMEOUT,
        )
    }

    #[test]
    fn connect_and_handshake() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("/dev/ttyUSB0", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(link.port(), Some("/dev/ttyUSB0"));

        link.start_streaming().unwrap();
        assert_eq!(link.state(), ConnectionState::Streaming);
        link.stop_streaming().unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(wire.written_lines(), vec!["START", "STOP"]);
    }

    #[test]
    fn start_while_disconnected_sends_nothing() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        let err = link.start_streaming().unwrap_err();
        assert!(matches!(
            err,
            LinkError::InvalidState {
                state: ConnectionState::Disconnected,
                ..
            }
        ));
        assert!(wire.written().is_empty());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stop_requires_streaming() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        assert!(link.stop_streaming().is_err());
        assert!(wire.written().is_empty());
    }

    #[test]
    fn open_failure_enters_error_state() {
        let wire = MockWire::new();
        wire.fail_open(true);
        let mut link = manager(&wire);
        assert!(link.connect("COM9", DEFAULT_BAUD_RATE).is_err());
        assert_eq!(link.state(), ConnectionState::Error);

        wire.fail_open(false);
        link.connect("COM9", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[test]
    fn failed_start_write_enters_error_state() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        wire.fail_writes(true);
        assert!(link.start_streaming().is_err());
        assert_eq!(link.state(), ConnectionState::Error);
        assert!(link.read_line().is_err());
    }

    #[test]
    fn failed_stop_write_still_tears_down() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        link.start_streaming().unwrap();
        wire.fail_writes(true);
        assert!(link.stop_streaming().is_err());
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(link.port(), None);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        link.disconnect();
        let opens = wire.open_count();
        link.disconnect();
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(wire.open_count(), opens);
        assert_eq!(link.port(), None);
    }

    #[test]
    fn reconnect_replaces_previous_endpoint() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        link.connect("COM4", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(link.port(), Some("COM4"));
        assert_eq!(wire.open_count(), 2);
    }

    #[test]
    fn connect_discards_stale_input() {
        let wire = MockWire::new();
        wire.feed("old,1\n");
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        assert_eq!(link.read_line().unwrap(), None);
    }

    #[test]
    fn frames_lines_across_reads() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();

        wire.feed("1,2\r\n3,");
        assert_eq!(link.read_line().unwrap(), Some(b"1,2".to_vec()));
        assert_eq!(link.read_line().unwrap(), None);
        wire.feed("4\n5,6\n");
        assert_eq!(
            link.drain_lines().unwrap(),
            vec![b"3,4".to_vec(), b"5,6".to_vec()]
        );
    }

    #[test]
    fn send_command_appends_newline() {
        let wire = MockWire::new();
        let mut link = manager(&wire);
        assert!(link.send_command("RESET").is_err());
        link.connect("COM3", DEFAULT_BAUD_RATE).unwrap();
        link.send_command("RESET\n").unwrap();
        assert_eq!(wire.written(), b"RESET\n".to_vec());
    }
}

//! In-memory serial wire for running the engine without hardware.
//!
//! A [`MockWire`] is shared between the test and the [`MockTransport`] the
//! link opens through [`MockConnector`]. Bytes fed with [`MockWire::feed`]
//! become readable; everything the link writes is recorded. Scripted replies
//! emulate the device answering a command, e.g. `IOSTATUS` → `IO:P0=HIGH`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::errors::{LinkError, Result};
use crate::link::{Connector, Transport};

#[derive(Debug, Default)]
struct WireState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    pending_tx_line: Vec<u8>,
    replies: Vec<(String, String)>,
    fail_writes: bool,
    fail_reads: bool,
    fail_open: bool,
    opens: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockWire {
    state: Arc<Mutex<WireState>>,
}

impl MockWire {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WireState> {
        // A panicking test thread must not hide the wire from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `data` available to the reader.
    pub fn feed(&self, data: &str) {
        self.lock().rx.extend(data.as_bytes());
    }

    /// Whenever the link writes the line `command`, queue `response`.
    pub fn reply_to(&self, command: &str, response: &str) {
        self.lock()
            .replies
            .push((command.to_string(), response.to_string()));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Raw bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Written bytes split into lines, without terminators.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn pending_input(&self) -> usize {
        self.lock().rx.len()
    }
}

pub struct MockTransport {
    wire: MockWire,
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.wire.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock read failure"));
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.wire.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        state.tx.extend_from_slice(buf);

        for &byte in buf {
            if byte != b'\n' {
                state.pending_tx_line.push(byte);
                continue;
            }
            let line = String::from_utf8_lossy(&state.pending_tx_line).into_owned();
            state.pending_tx_line.clear();
            let responses: Vec<String> = state
                .replies
                .iter()
                .filter(|(cmd, _)| *cmd == line)
                .map(|(_, resp)| resp.clone())
                .collect();
            for resp in responses {
                state.rx.extend(resp.as_bytes());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let state = self.wire.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock read failure"));
        }
        Ok(state.rx.len())
    }
}

#[derive(Debug, Clone)]
pub struct MockConnector {
    wire: MockWire,
}

impl MockConnector {
    pub fn new(wire: MockWire) -> Self {
        Self { wire }
    }
}

impl Connector for MockConnector {
    fn open(&self, port: &str, _baud_rate: u32, _timeout: Duration) -> Result<Box<dyn Transport>> {
        let mut state = self.wire.lock();
        if state.fail_open {
            return Err(LinkError::Open {
                port: port.to_string(),
                source: serialport::Error::new(serialport::ErrorKind::NoDevice, "mock open failure"),
            });
        }
        state.opens += 1;
        drop(state);
        Ok(Box::new(MockTransport {
            wire: self.wire.clone(),
        }))
    }
}

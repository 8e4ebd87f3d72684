//! Acquisition session.
//!
//! A session owns one worker thread, and that thread is the only owner of
//! the serial link. Foreground callers (a GUI, the CLI) send commands over a
//! channel and wait for the reply; the worker interleaves those commands with
//! the telemetry read loop and the periodic pin poll, so wire traffic is
//! never interleaved from two places.
//!
//! State changes are published as [`SessionEvent`]s. Consumers that prefer
//! polling can read consistent snapshots with [`AcquisitionSession::samples`]
//! and [`AcquisitionSession::pins`].
//!
//! ```ignore
//! let session = AcquisitionSession::new(EngineConfig::default())?;
//! session.connect("/dev/ttyUSB0", 115_200)?;
//! session.start_streaming()?;
//! for event in session.events().iter() {
//!     if let SessionEvent::Sample { sample, .. } = event {
//!         println!("{},{}", sample.x, sample.y);
//!     }
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::errors::{LinkError, ParseError, RecordError, Result};
use crate::link::{ConnectionState, Connector, LinkManager, SerialConnector};
use crate::pins::{PinPoller, PinState, IO_PREFIX};
use crate::record::{self, RecordMetadata};
use crate::store::{SampleStore, Staleness};
use crate::telemetry::{self, Sample};

/// Events dropped beyond this many unconsumed entries.
const EVENT_CAPACITY: usize = 4096;

/// Lines handled per loop pass before commands are checked again.
const MAX_LINES_PER_PASS: usize = 64;

/// Live/idle/fault indicator derived on every status tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// No new sample in the last tick.
    #[default]
    Idle,
    /// A fresh (non-duplicate) sample arrived in the last tick.
    Active,
    /// The last I/O attempt failed.
    Fault,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Sample { sample: Sample, staleness: Staleness },
    StateChanged(ConnectionState),
    StatusChanged(LinkStatus),
    PinsUpdated(PinState),
    LineRejected { line: String, error: ParseError },
    LinkFault(String),
}

enum Command {
    Connect {
        port: String,
        baud_rate: u32,
        reply: Sender<Result<()>>,
    },
    Disconnect {
        reply: Sender<()>,
    },
    StartStreaming {
        reply: Sender<Result<()>>,
    },
    StopStreaming {
        reply: Sender<Result<()>>,
    },
    Send {
        text: String,
        reply: Sender<Result<()>>,
    },
    PollPins {
        reply: Sender<Result<PinState>>,
    },
    Shutdown,
}

#[derive(Default)]
struct Shared {
    store: Mutex<SampleStore>,
    pins: Mutex<PinState>,
    state: Mutex<ConnectionState>,
    status: Mutex<LinkStatus>,
    parse_errors: AtomicU64,
    dropped_events: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AcquisitionSession {
    commands: Sender<Command>,
    events: Receiver<SessionEvent>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    config: EngineConfig,
}

impl AcquisitionSession {
    /// Start a session that opens real serial ports.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_connector(config, Box::new(SerialConnector))
    }

    pub fn with_connector(config: EngineConfig, connector: Box<dyn Connector>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);

        let shared = Arc::new(Shared {
            store: Mutex::new(SampleStore::new(config.dedup)),
            ..Shared::default()
        });

        let worker = Worker {
            link: LinkManager::new(connector, config.read_timeout()),
            poller: PinPoller::new(config.poll_interval(), config.settle_delay()),
            shared: Arc::clone(&shared),
            events: event_tx,
            commands: cmd_rx,
            next_poll: None,
            next_status: Instant::now() + config.status_tick(),
            last_io_failed: false,
            config: config.clone(),
        };

        let handle = thread::Builder::new()
            .name("leaf-acquisition".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            commands: cmd_tx,
            events: event_rx,
            shared,
            worker: Some(handle),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = bounded(1);
        self.commands
            .send(build(tx))
            .map_err(|_| LinkError::WorkerGone)?;
        rx.recv().map_err(|_| LinkError::WorkerGone)
    }

    pub fn connect(&self, port: &str, baud_rate: u32) -> Result<()> {
        self.request(|reply| Command::Connect {
            port: port.to_string(),
            baud_rate,
            reply,
        })?
    }

    pub fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply })
    }

    pub fn start_streaming(&self) -> Result<()> {
        self.request(|reply| Command::StartStreaming { reply })?
    }

    pub fn stop_streaming(&self) -> Result<()> {
        self.request(|reply| Command::StopStreaming { reply })?
    }

    /// Send an arbitrary operator command to the device.
    pub fn send_command(&self, text: &str) -> Result<()> {
        self.request(|reply| Command::Send {
            text: text.to_string(),
            reply,
        })?
    }

    /// Poll the pin table now instead of waiting for the next interval.
    pub fn poll_pins(&self) -> Result<PinState> {
        self.request(|reply| Command::PollPins { reply })?
    }

    /// Event stream. Clones share the same queue.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn samples(&self) -> Vec<Sample> {
        lock(&self.shared.store).snapshot()
    }

    pub fn sample_count(&self) -> usize {
        lock(&self.shared.store).len()
    }

    pub fn pins(&self) -> PinState {
        lock(&self.shared.pins).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn status(&self) -> LinkStatus {
        *lock(&self.shared.status)
    }

    /// Number of telemetry lines rejected since the session started.
    pub fn parse_errors(&self) -> u64 {
        self.shared.parse_errors.load(Ordering::Relaxed)
    }

    /// Clear all samples and staleness state.
    pub fn reset(&self) {
        lock(&self.shared.store).reset();
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Write the current series to a record file.
    ///
    /// The file is written from a snapshot; acquisition keeps running.
    pub fn export(
        &self,
        path: impl AsRef<Path>,
        metadata: &RecordMetadata,
    ) -> std::result::Result<(), RecordError> {
        let samples = self.samples();
        record::export(path, &samples, metadata)
    }

    /// Replace the stored series with a record file. The store is left as it
    /// was if the file cannot be read.
    pub fn import(&self, path: impl AsRef<Path>) -> std::result::Result<RecordMetadata, RecordError> {
        lock(&self.shared.store).import(path)
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("acquisition worker panicked");
            }
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    link: LinkManager,
    poller: PinPoller,
    shared: Arc<Shared>,
    events: Sender<SessionEvent>,
    commands: Receiver<Command>,
    config: EngineConfig,
    next_poll: Option<Instant>,
    next_status: Instant,
    last_io_failed: bool,
}

impl Worker {
    fn run(mut self) {
        debug!("acquisition worker started");
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(cmd) => {
                        if !self.handle(cmd) {
                            return self.shutdown();
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.shutdown(),
                }
            }

            let busy = self.link.state() == ConnectionState::Streaming && self.pump_telemetry();

            if self.next_poll.is_some_and(|t| Instant::now() >= t) {
                self.scheduled_poll();
            }
            self.tick_status();

            if !busy {
                match self.commands.recv_timeout(self.config.worker_tick()) {
                    Ok(cmd) => {
                        if !self.handle(cmd) {
                            return self.shutdown();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return self.shutdown(),
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.link.disconnect();
        self.sync_state();
        debug!("acquisition worker stopped");
    }

    /// Returns false when the worker should exit.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect {
                port,
                baud_rate,
                reply,
            } => {
                let result = self.link.connect(&port, baud_rate);
                self.last_io_failed = result.is_err();
                self.next_poll = match (&result, self.config.pin_polling) {
                    (Ok(()), true) => Some(Instant::now() + self.poller.interval()),
                    _ => None,
                };
                self.sync_state();
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.link.disconnect();
                self.next_poll = None;
                self.last_io_failed = false;
                if self.config.clear_on_disconnect {
                    lock(&self.shared.store).reset();
                }
                self.sync_state();
                let _ = reply.send(());
            }
            Command::StartStreaming { reply } => {
                let result = self.link.start_streaming();
                self.note_io(&result);
                self.sync_state();
                let _ = reply.send(result);
            }
            Command::StopStreaming { reply } => {
                let result = self.link.stop_streaming();
                self.note_io(&result);
                if !self.link.state().is_open() {
                    self.next_poll = None;
                }
                self.sync_state();
                let _ = reply.send(result);
            }
            Command::Send { text, reply } => {
                let result = self.link.send_command(&text);
                self.note_io(&result);
                let _ = reply.send(result);
            }
            Command::PollPins { reply } => {
                let result = self.poll_now();
                let _ = reply.send(result);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn note_io<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => self.last_io_failed = false,
            Err(LinkError::InvalidState { .. }) => {}
            Err(e) => {
                self.last_io_failed = true;
                self.publish(SessionEvent::LinkFault(e.to_string()));
            }
        }
    }

    /// Read and dispatch available lines. Returns true if any were handled.
    fn pump_telemetry(&mut self) -> bool {
        let mut handled = 0;
        while handled < MAX_LINES_PER_PASS {
            match self.link.read_line() {
                Ok(Some(line)) => {
                    self.last_io_failed = false;
                    self.dispatch_line(&line);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail_link(&e);
                    break;
                }
            }
        }
        handled > 0
    }

    fn dispatch_line(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        if text.trim_start().starts_with(IO_PREFIX) {
            let updated = lock(&self.shared.pins).apply_response(&text);
            if updated.is_some() {
                let pins = lock(&self.shared.pins).clone();
                self.publish(SessionEvent::PinsUpdated(pins));
            }
            return;
        }
        if self.link.state() != ConnectionState::Streaming {
            trace!("ignoring line outside streaming: {:?}", text);
            return;
        }

        match telemetry::parse_bytes(raw) {
            Ok(sample) => {
                let staleness = lock(&self.shared.store).push(sample);
                self.publish(SessionEvent::Sample { sample, staleness });
            }
            Err(error) => {
                self.shared.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!("skipping telemetry line {:?}: {}", text, error);
                self.publish(SessionEvent::LineRejected {
                    line: text.into_owned(),
                    error,
                });
            }
        }
    }

    fn scheduled_poll(&mut self) {
        self.next_poll = Some(Instant::now() + self.poller.interval());
        if let Err(e) = self.poll_now() {
            debug!("scheduled pin poll failed: {}", e);
        }
    }

    fn poll_now(&mut self) -> Result<PinState> {
        let state = self.link.state();
        if !state.is_open() {
            return Err(LinkError::InvalidState {
                operation: "poll_pins",
                state,
            });
        }

        let mut pins = lock(&self.shared.pins).clone();
        let outcome = match self.poller.poll(&mut self.link, &mut pins) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_link(&e);
                return Err(e);
            }
        };
        self.last_io_failed = false;

        *lock(&self.shared.pins) = pins.clone();
        if outcome.status_lines > 0 {
            self.publish(SessionEvent::PinsUpdated(pins.clone()));
        }
        for line in outcome.other_lines {
            self.dispatch_line(&line);
        }
        Ok(pins)
    }

    fn fail_link(&mut self, error: &LinkError) {
        warn!("link failure: {}", error);
        self.last_io_failed = true;
        self.link.abort();
        self.next_poll = None;
        self.publish(SessionEvent::LinkFault(error.to_string()));
        self.sync_state();
    }

    fn tick_status(&mut self) {
        let now = Instant::now();
        if now < self.next_status {
            return;
        }
        let tick = self.config.status_tick();
        self.next_status = now + tick;

        let status = if self.last_io_failed {
            LinkStatus::Fault
        } else if lock(&self.shared.store).fresh_within(now, tick) {
            LinkStatus::Active
        } else {
            LinkStatus::Idle
        };

        let changed = {
            let mut current = lock(&self.shared.status);
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            self.publish(SessionEvent::StatusChanged(status));
        }
    }

    fn sync_state(&mut self) {
        let state = self.link.state();
        let changed = {
            let mut current = lock(&self.shared.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            self.publish(SessionEvent::StateChanged(state));
        }
    }

    fn publish(&self, event: SessionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.shared.dropped_events.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("event queue full, dropping events");
                } else {
                    trace!("event queue full, dropping event");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockWire};
    use crate::store::DedupPolicy;
    use std::time::Duration;

    fn session(wire: &MockWire, config: EngineConfig) -> AcquisitionSession {
        AcquisitionSession::with_connector(config, Box::new(MockConnector::new(wire.clone())))
            .unwrap()
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            pin_polling: false,
            settle_delay_ms: 5,
            ..EngineConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn state_follows_commands() {
        let wire = MockWire::new();
        let s = session(&wire, quiet_config());
        assert_eq!(s.state(), ConnectionState::Disconnected);
        s.connect("COM3", 115_200).unwrap();
        assert_eq!(s.state(), ConnectionState::Connected);
        s.start_streaming().unwrap();
        assert_eq!(s.state(), ConnectionState::Streaming);
        s.stop_streaming().unwrap();
        assert_eq!(s.state(), ConnectionState::Connected);
        s.disconnect().unwrap();
        s.disconnect().unwrap();
        assert_eq!(s.state(), ConnectionState::Disconnected);
        assert_eq!(wire.written_lines(), vec!["START", "STOP"]);
    }

    #[test]
    fn bad_lines_are_counted_not_fatal() {
        let wire = MockWire::new();
        let s = session(&wire, quiet_config());
        s.connect("COM3", 115_200).unwrap();
        s.start_streaming().unwrap();
        wire.feed("1,1\ngarbage\n2,2\n\n3,oops\n4,4\n");
        assert!(wait_for(|| s.sample_count() == 3));
        assert_eq!(s.parse_errors(), 3);
        assert_eq!(s.state(), ConnectionState::Streaming);
    }

    #[test]
    fn config_is_kept() {
        let wire = MockWire::new();
        let config = EngineConfig {
            dedup: DedupPolicy::AlwaysAppend,
            ..quiet_config()
        };
        let s = session(&wire, config.clone());
        assert_eq!(s.config(), &config);
        assert_eq!(lock(&s.shared.store).policy(), DedupPolicy::AlwaysAppend);
    }

    #[test]
    fn full_event_queue_is_counted() {
        let wire = MockWire::new();
        let s = session(&wire, quiet_config());
        s.connect("COM3", 115_200).unwrap();
        s.start_streaming().unwrap();

        let total = EVENT_CAPACITY + 100;
        let feed: String = (0..total).map(|i| format!("{i},0\n")).collect();
        wire.feed(&feed);
        assert!(wait_for(|| s.sample_count() == total));
        assert!(s.dropped_events() >= 100);
        assert_eq!(s.samples().len(), total);
        assert_eq!(s.state(), ConnectionState::Streaming);
    }

    #[test]
    fn poll_pins_requires_connection() {
        let wire = MockWire::new();
        let s = session(&wire, quiet_config());
        assert!(matches!(
            s.poll_pins(),
            Err(LinkError::InvalidState { .. })
        ));
        assert!(wire.written().is_empty());
    }

    #[test]
    fn read_failure_marks_fault() {
        let wire = MockWire::new();
        let s = session(&wire, quiet_config());
        s.connect("COM3", 115_200).unwrap();
        s.start_streaming().unwrap();
        wire.fail_reads(true);
        assert!(wait_for(|| s.state() == ConnectionState::Error));
        assert!(wait_for(|| s.status() == LinkStatus::Fault));

        wire.fail_reads(false);
        s.connect("COM3", 115_200).unwrap();
        assert_eq!(s.state(), ConnectionState::Connected);
        assert!(wait_for(|| s.status() == LinkStatus::Idle));
    }
}

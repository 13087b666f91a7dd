//! Command Channel
//!
//! Serialized request/response exchange of vendor diagnostic commands with
//! the controller, plus asynchronous delivery of captured traffic.
//!
//! - `h4` - packet framing on the byte stream
//! - `mock` - simulated controller for tests
//!
//! The protocol carries no request id, so exactly one command may be
//! outstanding. A background reader thread frames the receive direction:
//! completion events go to the waiting sender, every packet goes to the
//! registered capture callbacks.

pub mod h4;
#[cfg(test)]
pub mod mock;

use crate::bdaddr::BdAddr;
use crate::error::{Error, Result};
use h4::{CommandResponse, H4Packet};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Vendor diagnostic opcodes (Broadcom layout).
pub const OP_WRITE_RAM: u16 = 0xfc4c;
pub const OP_READ_RAM: u16 = 0xfc4d;
pub const OP_LAUNCH_RAM: u16 = 0xfc4e;

/// Byte-level link to the controller. Bring-up happens elsewhere; the
/// channel only needs a writer, an independent reader, and a way to
/// unblock that reader on disconnect.
pub trait Transport: Write + Send {
    /// Independent handle for the receive direction.
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>>;

    /// Independent handle that closes the link from any thread, even while
    /// a write or a wait for a completion is in progress.
    fn closer(&mut self) -> io::Result<Box<dyn Closer>>;
}

/// Closes a link so that a blocked reader returns.
pub trait Closer: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn reader(&mut self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn closer(&mut self) -> io::Result<Box<dyn Closer>> {
        Ok(Box::new(self.try_clone()?))
    }
}

impl Closer for TcpStream {
    fn close(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long to wait for the completion of one attempt.
    pub timeout: Duration,
    /// Re-sends after the first attempt times out.
    pub retries: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            timeout: Duration::from_secs(2),
            retries: 2,
        }
    }
}

/// Traffic class a capture callback subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    Hci,
    Lmp,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Hci => write!(f, "HCI"),
            CaptureKind::Lmp => write!(f, "LMP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to controller, or sent by our own controller for LMP.
    Sent,
    Received,
}

/// One captured packet, handed to callbacks and then dropped.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub direction: Direction,
    pub timestamp: SystemTime,
    /// Full H4 packet for HCI, bare PDU for LMP.
    pub payload: Vec<u8>,
    /// Remote device of the link, LMP only.
    pub remote: Option<BdAddr>,
}

pub type CaptureHandler = Arc<dyn Fn(&CaptureRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

struct Registration {
    id: CallbackId,
    kind: CaptureKind,
    handler: CaptureHandler,
}

struct Shared {
    connected: AtomicBool,
    next_id: AtomicU64,
    callbacks: RwLock<Vec<Registration>>,
}

impl Shared {
    fn deliver(&self, kind: CaptureKind, record: &CaptureRecord) {
        // Handlers run outside the lock so they may unregister themselves.
        let handlers: Vec<CaptureHandler> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.handler))
            .collect();

        for handler in handlers {
            handler(record);
        }
    }
}

type ResponseSlot = std::result::Result<CommandResponse, String>;

struct Exchange {
    transport: Box<dyn Transport>,
    responses: Receiver<ResponseSlot>,
}

/// The single, process-wide command channel to one controller.
pub struct CommandChannel {
    config: ChannelConfig,
    shared: Arc<Shared>,
    exchange: Mutex<Option<Exchange>>,
    closer: Mutex<Option<Box<dyn Closer>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CommandChannel {
    /// Take ownership of a connected transport and start the reader thread.
    pub fn connect(mut transport: Box<dyn Transport>, config: ChannelConfig) -> Result<Self> {
        let reader = transport.reader()?;
        let closer = transport.closer()?;
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            callbacks: RwLock::new(Vec::new()),
        });
        let (tx, rx) = mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("blueprobe-h4-reader".to_string())
            .spawn(move || reader_loop(reader, tx, thread_shared))?;

        info!("Command channel connected");

        Ok(CommandChannel {
            config,
            shared,
            exchange: Mutex::new(Some(Exchange {
                transport,
                responses: rx,
            })),
            closer: Mutex::new(Some(closer)),
            reader: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Close the link. Every pending and future `send` fails with `ConnectionLost`.
    ///
    /// The link is closed before the exchange lock is taken: closing ends
    /// the reader, which wakes a sender blocked on its completion.
    pub fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);

        let closer = self
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(closer) = closer else {
            return;
        };

        let shutdown = closer.close();
        if let Err(e) = &shutdown {
            warn!("Transport shutdown failed: {}", e);
        }
        drop(
            self.exchange
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(handle), Ok(())) = (handle, shutdown) {
            let _ = handle.join();
        }
        info!("Command channel disconnected");
    }

    /// Send one command and wait for its completion.
    ///
    /// Callers are serialized; a timed-out attempt is re-sent up to the
    /// configured retry budget before failing with `Timeout`.
    pub fn send(&self, opcode: u16, params: &[u8]) -> Result<CommandResponse> {
        if params.len() > u8::MAX as usize {
            return Err(Error::Protocol(format!(
                "{} parameter bytes exceed the HCI limit of 255",
                params.len()
            )));
        }
        let packet = h4::command_packet(opcode, params);

        let mut guard = self.exchange.lock().unwrap_or_else(PoisonError::into_inner);
        let exchange = guard.as_mut().ok_or(Error::ConnectionLost)?;

        // Completions of earlier, abandoned attempts
        while exchange.responses.try_recv().is_ok() {}

        let attempts = self.config.retries + 1;
        for attempt in 1..=attempts {
            if !self.is_connected() {
                return Err(Error::ConnectionLost);
            }

            exchange
                .transport
                .write_all(&packet)
                .and_then(|_| exchange.transport.flush())
                .map_err(|e| {
                    debug!("Write of opcode {:#06x} failed: {}", opcode, e);
                    Error::ConnectionLost
                })?;
            self.shared.deliver(
                CaptureKind::Hci,
                &CaptureRecord {
                    direction: Direction::Sent,
                    timestamp: SystemTime::now(),
                    payload: packet.clone(),
                    remote: None,
                },
            );

            if let Some(response) = self.await_response(&exchange.responses, opcode)? {
                return Ok(response);
            }
            warn!(
                "No response to opcode {:#06x} (attempt {}/{})",
                opcode, attempt, attempts
            );
        }

        Err(Error::Timeout { opcode, attempts })
    }

    /// Like [`send`](Self::send) but maps a non-zero status to
    /// `CommandRejected` and returns only the return parameters.
    pub fn send_checked(&self, opcode: u16, params: &[u8]) -> Result<Vec<u8>> {
        let response = self.send(opcode, params)?;
        if response.status != 0 {
            return Err(Error::CommandRejected {
                opcode,
                status: response.status,
            });
        }
        Ok(response.data)
    }

    fn await_response(
        &self,
        responses: &Receiver<ResponseSlot>,
        opcode: u16,
    ) -> Result<Option<CommandResponse>> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match responses.recv_timeout(remaining) {
                Ok(Ok(response)) if response.opcode != opcode => {
                    debug!(
                        "Discarding stale completion for {:#06x} while waiting for {:#06x}",
                        response.opcode, opcode
                    );
                }
                // Pending acknowledgement; the completion follows
                Ok(Ok(response)) if response.is_status_only && response.status == 0 => {}
                Ok(Ok(response)) => return Ok(Some(response)),
                Ok(Err(message)) => return Err(Error::Protocol(message)),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::ConnectionLost),
            }
        }
    }

    /// Subscribe to captured traffic of one kind. The handler runs on the
    /// reader thread (and on the sending thread for outgoing commands) and
    /// must not block.
    pub fn register_callback(&self, kind: CaptureKind, handler: CaptureHandler) -> CallbackId {
        let id = CallbackId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration { id, kind, handler });
        debug!("Registered {} capture callback {:?}", kind, id);
        id
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .shared
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|r| r.id != id);
        before != callbacks.len()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn reader_loop(mut reader: Box<dyn Read + Send>, responses: Sender<ResponseSlot>, shared: Arc<Shared>) {
    loop {
        match h4::read_packet(&mut reader) {
            Ok(Some(packet)) => dispatch(packet, &responses, &shared),
            Ok(None) => {
                debug!("Transport reached end of stream");
                break;
            }
            Err(e) => {
                if shared.connected.load(Ordering::SeqCst) {
                    warn!("Receive path failed: {}", e);
                }
                break;
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

fn dispatch(packet: H4Packet, responses: &Sender<ResponseSlot>, shared: &Shared) {
    let timestamp = SystemTime::now();

    if let Some((code, params)) = packet.event() {
        match h4::parse_response(code, params) {
            Ok(Some(response)) => {
                let _ = responses.send(Ok(response));
            }
            Ok(None) => {}
            Err(message) => {
                let _ = responses.send(Err(message));
            }
        }

        if code == h4::EVENT_VENDOR && params.starts_with(h4::LMP_EVENT_TAG) {
            match parse_lmp_event(&params[h4::LMP_EVENT_TAG.len()..], timestamp) {
                Some(record) => shared.deliver(CaptureKind::Lmp, &record),
                None => debug!("Truncated LMP capture event ({} bytes)", params.len()),
            }
        }
    }

    shared.deliver(
        CaptureKind::Hci,
        &CaptureRecord {
            direction: Direction::Received,
            timestamp,
            payload: packet.0,
            remote: None,
        },
    );
}

/// Body layout: direction (0 = sent by own device), remote address (LE), PDU.
fn parse_lmp_event(body: &[u8], timestamp: SystemTime) -> Option<CaptureRecord> {
    let (&direction, rest) = body.split_first()?;
    let remote = BdAddr::from_le_bytes(rest)?;
    Some(CaptureRecord {
        direction: if direction == 0 {
            Direction::Sent
        } else {
            Direction::Received
        },
        timestamp,
        payload: rest[6..].to_vec(),
        remote: Some(remote),
    })
}

#[cfg(test)]
mod tests {
    use super::mock::MockController;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            timeout: Duration::from_millis(100),
            retries: 2,
        }
    }

    fn connect(mock: &MockController) -> CommandChannel {
        CommandChannel::connect(Box::new(mock.clone()), fast_config()).unwrap()
    }

    #[test]
    fn test_send_returns_completion_data() {
        let mock = MockController::new();
        mock.load(0x1000, &[1, 2, 3, 4]);
        let channel = connect(&mock);

        let data = channel
            .send_checked(mock::OP_READ_RAM, &[0x00, 0x10, 0x00, 0x00, 4])
            .unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_non_zero_status_is_rejected() {
        let mock = MockController::new();
        let channel = connect(&mock);

        let err = channel.send_checked(0xfc99, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::CommandRejected {
                opcode: 0xfc99,
                status: mock::STATUS_UNKNOWN_COMMAND
            }
        ));
    }

    #[test]
    fn test_timeout_is_retried() {
        let mock = MockController::new();
        mock.drop_responses(2);
        let channel = connect(&mock);

        channel
            .send_checked(mock::OP_WRITE_RAM, &[0, 0, 0, 0, 0xaa])
            .unwrap();
        assert_eq!(mock.command_count(mock::OP_WRITE_RAM), 3);
    }

    #[test]
    fn test_timeout_after_budget() {
        let mock = MockController::new();
        mock.drop_responses(10);
        let channel = connect(&mock);

        let err = channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                opcode: mock::OP_LAUNCH_RAM,
                attempts: 3
            }
        ));
    }

    #[test]
    fn test_stale_completion_discarded() {
        let mock = MockController::new();
        let channel = connect(&mock);

        // Unsolicited completion for another opcode arrives first
        mock.inject_event(h4::EVENT_COMMAND_COMPLETE, &[1, 0x03, 0x0c, 0]);
        thread::sleep(Duration::from_millis(20));

        let response = channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]).unwrap();
        assert_eq!(response.opcode, mock::OP_LAUNCH_RAM);
    }

    #[test]
    fn test_malformed_completion_is_protocol_error() {
        let mock = MockController::new();
        mock.set_malformed_responses(true);
        let channel = connect(&mock);

        let err = channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_disconnect_fails_sends() {
        let mock = MockController::new();
        let channel = connect(&mock);
        channel.disconnect();

        assert!(!channel.is_connected());
        assert!(matches!(
            channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]),
            Err(Error::ConnectionLost)
        ));
    }

    #[test]
    fn test_disconnect_does_not_wait_for_pending_send() {
        let mock = MockController::new();
        mock.drop_responses(10);
        let channel = CommandChannel::connect(
            Box::new(mock.clone()),
            ChannelConfig {
                timeout: Duration::from_secs(5),
                retries: 2,
            },
        )
        .unwrap();

        thread::scope(|scope| {
            let pending = scope.spawn(|| channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]));
            while mock.command_count(mock::OP_LAUNCH_RAM) == 0 {
                thread::sleep(Duration::from_millis(5));
            }

            let started = Instant::now();
            channel.disconnect();
            assert!(started.elapsed() < Duration::from_secs(2));
            assert!(matches!(pending.join().unwrap(), Err(Error::ConnectionLost)));
            assert!(started.elapsed() < Duration::from_secs(2));
        });
    }

    #[test]
    fn test_remote_hangup_fails_sends() {
        let mock = MockController::new();
        let channel = connect(&mock);
        mock.hang_up();

        let deadline = Instant::now() + Duration::from_secs(1);
        while channel.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(
            channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]),
            Err(Error::ConnectionLost)
        ));
    }

    #[test]
    fn test_oversized_params_rejected_locally() {
        let mock = MockController::new();
        let channel = connect(&mock);
        let err = channel.send(mock::OP_WRITE_RAM, &[0u8; 256]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(mock.command_count(mock::OP_WRITE_RAM), 0);
    }

    #[test]
    fn test_hci_callbacks_see_both_directions() {
        let mock = MockController::new();
        let channel = connect(&mock);

        let sent = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(AtomicUsize::new(0));
        let (s, r) = (Arc::clone(&sent), Arc::clone(&received));
        let id = channel.register_callback(
            CaptureKind::Hci,
            Arc::new(move |record: &CaptureRecord| match record.direction {
                Direction::Sent => {
                    s.fetch_add(1, Ordering::SeqCst);
                }
                Direction::Received => {
                    r.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]).unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(received.load(Ordering::SeqCst), 1);

        assert!(channel.unregister(id));
        assert!(!channel.unregister(id));
        channel.send(mock::OP_LAUNCH_RAM, &[0, 0, 0, 0]).unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lmp_events_routed_to_lmp_callbacks() {
        let mock = MockController::new();
        let channel = connect(&mock);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        channel.register_callback(
            CaptureKind::Lmp,
            Arc::new(move |record: &CaptureRecord| {
                let _ = tx.lock().unwrap().send(record.clone());
            }),
        );

        let mut params = b"LMP".to_vec();
        params.push(1);
        params.extend_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        params.extend_from_slice(&[0x4b, 0x01, 0x02]);
        mock.inject_event(h4::EVENT_VENDOR, &params);

        let record = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(record.direction, Direction::Received);
        assert_eq!(record.payload, vec![0x4b, 0x01, 0x02]);
        assert_eq!(record.remote.unwrap().to_string(), "11:22:33:44:55:66");
    }

    #[test]
    fn test_concurrent_senders_are_serialized() {
        let mock = MockController::new();
        let channel = Arc::new(connect(&mock));

        let workers: Vec<_> = (0..4u8)
            .map(|i| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for _ in 0..10 {
                        channel
                            .send_checked(mock::OP_WRITE_RAM, &[i, 0, 0, 0, i])
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(mock.command_count(mock::OP_WRITE_RAM), 40);
        for i in 0..4u32 {
            assert_eq!(mock.peek(i, 1), vec![i as u8]);
        }
    }
}

//! Exclusive owner of the serial line.
//!
//! The link is half-duplex and not addressable, so at most one command may be
//! in flight. `transact` holds the line mutex for the whole exchange: command
//! bytes are fully written before any response byte is read, and concurrent
//! callers queue on the mutex.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mculink_protocol as protocol;
use thiserror::Error;
use tracing::{debug, warn};

/// Anything that behaves like the serial device: the real `serialport`
/// handle in production, an in-memory fake in tests.
pub trait SerialLine: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLine for T {}

#[derive(Debug, Error)]
pub enum TransactError {
    #[error("serial I/O error: {0}")]
    Io(String),
    #[error("device did not respond within {0:?}")]
    Timeout(Duration),
    #[error("response failed CRC verification")]
    CrcMismatch,
    #[error("truncated response frame")]
    TruncatedResponse,
    #[error("device reported error code 0x{0:02X}")]
    Device(u8),
    #[error("no device attached")]
    NotReady,
    #[error("command does not fit a wire frame")]
    Oversize,
}

pub struct Transactor {
    line: Mutex<Option<Box<dyn SerialLine>>>,
    /// Raised on I/O faults and timeouts; the supervisor consumes it and
    /// tears the connection down.
    fault: AtomicBool,
}

impl Transactor {
    pub fn new() -> Self {
        Self {
            line: Mutex::new(None),
            fault: AtomicBool::new(false),
        }
    }

    /// Hand the freshly opened line to the transactor. Clears any stale
    /// fault from the previous connection.
    pub fn install(&self, line: Box<dyn SerialLine>) {
        *self.line.lock().unwrap() = Some(line);
        self.fault.store(false, Ordering::SeqCst);
    }

    /// Drop the line, closing the file descriptor.
    pub fn eject(&self) {
        *self.line.lock().unwrap() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.line.lock().unwrap().is_some()
    }

    /// Consume the fault flag.
    pub fn take_fault(&self) -> bool {
        self.fault.swap(false, Ordering::SeqCst)
    }

    /// Run one command/response exchange: frame the command, write it in
    /// full, then pump the receive side until exactly one frame arrives or
    /// the deadline elapses.
    pub fn transact(&self, tag: u8, args: &[u8], deadline: Duration) -> Result<Vec<u8>, TransactError> {
        let mut guard = self.line.lock().unwrap();
        let line = guard.as_mut().ok_or(TransactError::NotReady)?;

        let mut frame = [0u8; protocol::MAX_FRAME_LEN];
        let frame_len = protocol::encode_command(tag, args, &mut frame)
            .map_err(|_| TransactError::Oversize)?;
        let mut encoded = [0u8; protocol::MAX_SLIP_LEN];
        let encoded_len = protocol::slip_encode(&frame[..frame_len], &mut encoded)
            .map_err(|_| TransactError::Oversize)?;

        debug!(tag, frame_len, encoded_len, "sending command frame");

        let deadline_at = Instant::now() + deadline;
        if let Err(e) = line.write_all(&encoded[..encoded_len]).and_then(|_| line.flush()) {
            self.fault.store(true, Ordering::SeqCst);
            return Err(TransactError::Io(e.to_string()));
        }

        // Fresh decoder per transaction: residue from an aborted exchange
        // must never leak into this one.
        let mut decoder = protocol::SlipDecoder::new();
        let mut chunk = [0u8; protocol::MAX_SLIP_LEN];
        loop {
            if Instant::now() >= deadline_at {
                self.fault.store(true, Ordering::SeqCst);
                return Err(TransactError::Timeout(deadline));
            }
            match line.read(&mut chunk) {
                Ok(0) => continue,
                Ok(n) => {
                    for &byte in &chunk[..n] {
                        if let Some(frame) = decoder.push(byte) {
                            debug!(len = frame.len(), "received response frame");
                            return decode_payload(&frame);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    continue
                }
                Err(e) => {
                    warn!(error = %e, "serial read failed");
                    self.fault.store(true, Ordering::SeqCst);
                    return Err(TransactError::Io(e.to_string()));
                }
            }
        }
    }
}

impl Default for Transactor {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_payload(frame: &[u8]) -> Result<Vec<u8>, TransactError> {
    match protocol::decode_response(frame) {
        Ok(payload) => Ok(payload.to_vec()),
        Err(protocol::Error::InvalidCrc) => Err(TransactError::CrcMismatch),
        Err(protocol::Error::Device(code)) => Err(TransactError::Device(code)),
        Err(_) => Err(TransactError::TruncatedResponse),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    /// In-memory serial line: records every `write` call and serves queued
    /// response byte streams, timing out once they run dry.
    pub struct FakeLine {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pending: Vec<u8>,
        broken: bool,
    }

    impl FakeLine {
        pub fn new() -> Self {
            Self {
                writes: Arc::new(Mutex::new(Vec::new())),
                responses: Arc::new(Mutex::new(VecDeque::new())),
                pending: Vec::new(),
                broken: false,
            }
        }

        /// A line whose reads and writes fail outright, as after a cable pull.
        pub fn broken() -> Self {
            let mut line = Self::new();
            line.broken = true;
            line
        }

        pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
            self.writes.clone()
        }

        pub fn responses(&self) -> Arc<Mutex<VecDeque<Vec<u8>>>> {
            self.responses.clone()
        }

        /// SLIP-encode a raw frame and queue it as one inbound transmission.
        pub fn queue_frame(&self, frame: &[u8]) {
            let mut out = [0u8; mculink_protocol::MAX_SLIP_LEN];
            let n = mculink_protocol::slip_encode(frame, &mut out).unwrap();
            self.responses.lock().unwrap().push_back(out[..n].to_vec());
        }

        /// Queue raw bytes exactly as given.
        pub fn queue_bytes(&self, bytes: Vec<u8>) {
            self.responses.lock().unwrap().push_back(bytes);
        }
    }

    impl Read for FakeLine {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "line gone"));
            }
            if self.pending.is_empty() {
                match self.responses.lock().unwrap().pop_front() {
                    Some(next) => self.pending = next,
                    None => return Err(io::Error::new(ErrorKind::TimedOut, "read timed out")),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    impl Write for FakeLine {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "line gone"));
            }
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Build the response frame for a payload, CRC appended.
    pub fn response_frame(payload: &[u8]) -> Vec<u8> {
        let mut out = [0u8; mculink_protocol::MAX_FRAME_LEN];
        let n = mculink_protocol::encode_response(payload, &mut out).unwrap();
        out[..n].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{response_frame, FakeLine};
    use super::*;
    use mculink_protocol::{decode_command, SlipDecoder};
    use std::sync::Arc;

    const DEADLINE: Duration = Duration::from_millis(200);

    #[test]
    fn transact_roundtrip() {
        let line = FakeLine::new();
        line.queue_frame(&response_frame(&[0x00, 0x00]));
        let writes = line.writes();

        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let payload = transactor.transact(2, &[], DEADLINE).unwrap();
        assert_eq!(payload, vec![0x00, 0x00]);

        // Exactly one write: the whole SLIP-encoded command frame.
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let mut decoder = SlipDecoder::new();
        let mut frames = Vec::new();
        for &b in &writes[0] {
            if let Some(f) = decoder.push(b) {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 1);
        let (tag, args) = decode_command(&frames[0]).unwrap();
        assert_eq!(tag, 2);
        assert!(args.is_empty());
    }

    #[test]
    fn void_response_yields_empty_payload() {
        let line = FakeLine::new();
        line.queue_frame(&response_frame(&[]));
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let payload = transactor.transact(1, &[0x05, 0x00], DEADLINE).unwrap();
        assert!(payload.is_empty());
        assert!(!transactor.take_fault());
    }

    #[test]
    fn corrupted_crc_is_detected_without_fault() {
        let line = FakeLine::new();
        let mut frame = response_frame(&[0x00, 0x00]);
        *frame.last_mut().unwrap() ^= 0x01;
        line.queue_frame(&frame);
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let err = transactor.transact(2, &[], DEADLINE).unwrap_err();
        assert!(matches!(err, TransactError::CrcMismatch));
        // A bad frame is not a link fault; the connection stays up.
        assert!(!transactor.take_fault());
    }

    #[test]
    fn device_error_frame_maps_to_device_error() {
        let line = FakeLine::new();
        let mut out = [0u8; 4];
        let n = mculink_protocol::encode_error_response(0x02, &mut out).unwrap();
        line.queue_frame(&out[..n]);
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let err = transactor.transact(7, &[], DEADLINE).unwrap_err();
        assert!(matches!(err, TransactError::Device(0x02)));
        assert!(!transactor.take_fault());
    }

    #[test]
    fn silence_times_out_and_raises_fault() {
        let line = FakeLine::new();
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let err = transactor
            .transact(1, &[], Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, TransactError::Timeout(_)));
        assert!(transactor.take_fault());
        // Consumed: the flag does not stick.
        assert!(!transactor.take_fault());
    }

    #[test]
    fn noise_before_the_frame_is_ignored() {
        let line = FakeLine::new();
        let mut stream = b"RSDPE".to_vec();
        let mut out = [0u8; mculink_protocol::MAX_SLIP_LEN];
        let n = mculink_protocol::slip_encode(&response_frame(&[0x2A, 0x00]), &mut out).unwrap();
        stream.extend_from_slice(&out[..n]);
        line.queue_bytes(stream);
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let payload = transactor.transact(2, &[], DEADLINE).unwrap();
        assert_eq!(payload, vec![0x2A, 0x00]);
    }

    #[test]
    fn no_line_means_not_ready() {
        let transactor = Transactor::new();
        let err = transactor.transact(1, &[], DEADLINE).unwrap_err();
        assert!(matches!(err, TransactError::NotReady));
    }

    #[test]
    fn write_failure_raises_fault() {
        let transactor = Transactor::new();
        transactor.install(Box::new(FakeLine::broken()));
        let err = transactor.transact(1, &[], DEADLINE).unwrap_err();
        assert!(matches!(err, TransactError::Io(_)));
        assert!(transactor.take_fault());
    }

    #[test]
    fn oversized_command_fails_before_io() {
        let line = FakeLine::new();
        let writes = line.writes();
        let transactor = Transactor::new();
        transactor.install(Box::new(line));

        let args = vec![0u8; mculink_protocol::MAX_ARGS_LEN + 1];
        let err = transactor.transact(1, &args, DEADLINE).unwrap_err();
        assert!(matches!(err, TransactError::Oversize));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_transactions_do_not_interleave() {
        let line = FakeLine::new();
        line.queue_frame(&response_frame(&[]));
        line.queue_frame(&response_frame(&[]));
        let writes = line.writes();

        let transactor = Arc::new(Transactor::new());
        transactor.install(Box::new(line));

        let handles: Vec<_> = [1u8, 2u8]
            .into_iter()
            .map(|tag| {
                let t = transactor.clone();
                std::thread::spawn(move || t.transact(tag, &[0x11, 0x22], DEADLINE))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        // Each write call carries one complete encoded frame; decoding the
        // wire in order must yield exactly the two command frames.
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        let mut tags = Vec::new();
        for write in writes.iter() {
            let mut decoder = SlipDecoder::new();
            let mut frames = Vec::new();
            for &b in write {
                if let Some(f) = decoder.push(b) {
                    frames.push(f);
                }
            }
            assert_eq!(frames.len(), 1);
            let (tag, args) = decode_command(&frames[0]).unwrap();
            assert_eq!(args, &[0x11, 0x22]);
            tags.push(tag);
        }
        tags.sort_unstable();
        assert_eq!(tags, vec![1, 2]);
    }
}

use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// Largest payload the board firmware accepts or emits in a single frame.
pub const MAX_PAYLOAD_LENGTH: usize = 2000;

/// `id` (1 byte) + `length` (2 bytes, LE) + `checksum` (4 bytes, LE).
pub const HEADER_LENGTH: usize = 7;

const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Timeout error: no complete response within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Framing error: {reason}")]
    Framing { reason: String },

    #[error("Serial link is closed")]
    Disconnected,
}

impl TransportError {
    fn framing(reason: impl Into<String>) -> Self {
        Self::Framing {
            reason: reason.into(),
        }
    }
}

/// One framed message, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(id: u8, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    fn checksum(id: u8, length: u16, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[id]);
        hasher.update(&length.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    /// Serialize header and payload into wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(TransportError::framing(format!(
                "payload of {} bytes exceeds {} byte limit",
                self.payload.len(),
                MAX_PAYLOAD_LENGTH
            )));
        }
        let length = self.payload.len() as u16;
        let checksum = Self::checksum(self.id, length, &self.payload);

        let mut bytes = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        bytes.push(self.id);
        bytes.extend_from_slice(&length.to_le_bytes());
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse a frame from a complete header and the payload that followed it.
    pub fn decode(header: &[u8; HEADER_LENGTH], payload: Vec<u8>) -> Result<Self, TransportError> {
        let (id, length, checksum) = Self::parse_header(header)?;
        if payload.len() != length {
            return Err(TransportError::framing(format!(
                "header announced {} bytes but {} followed",
                length,
                payload.len()
            )));
        }
        if Self::checksum(id, length as u16, &payload) != checksum {
            return Err(TransportError::framing(format!(
                "checksum mismatch on frame 0x{id:02x}"
            )));
        }
        Ok(Self { id, payload })
    }

    fn parse_header(header: &[u8; HEADER_LENGTH]) -> Result<(u8, usize, u32), TransportError> {
        let id = header[0];
        let length = u16::from_le_bytes([header[1], header[2]]) as usize;
        let checksum = u32::from_le_bytes([header[3], header[4], header[5], header[6]]);
        if length > MAX_PAYLOAD_LENGTH {
            return Err(TransportError::framing(format!(
                "announced length {length} exceeds {MAX_PAYLOAD_LENGTH}"
            )));
        }
        Ok((id, length, checksum))
    }
}

/// Request/response channel to the board.
///
/// Implementations perform exactly one exchange per call and never retry;
/// the caller owns the retry policy.
pub trait Transport: Send {
    fn send(&mut self, request: &Frame) -> Result<Frame, TransportError>;

    /// Whether a long-running measurement can be polled in chunks, which is
    /// what makes mid-step cancellation possible.
    fn supports_partial_reads(&self) -> bool {
        true
    }

    fn close(&mut self);
}

/// Frames messages over any byte stream that reports read timeouts as
/// `ErrorKind::TimedOut`/`WouldBlock`, such as a serial port.
///
/// After a timeout or a framing error the link is out of step with the
/// board: the next exchange first discards whatever input is pending, and
/// any frame that does not answer the current request is skipped.
#[derive(Debug)]
pub struct FramedLink<S> {
    stream: Option<S>,
    timeout: Duration,
    out_of_step: bool,
}

impl<S: Read + Write> FramedLink<S> {
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            timeout,
            out_of_step: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn read_exact_before(
        stream: &mut S,
        buffer: &mut [u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buffer.len() {
            match stream.read(&mut buffer[filled..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if is_idle(&e) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout { timeout });
                    }
                }
                Err(e) => {
                    log::debug!("Read failed: {}", e);
                    return Err(TransportError::Disconnected);
                }
            }
        }
        Ok(())
    }

    /// Read and drop input until the stream goes idle or `timeout` passes.
    fn discard_input(stream: &mut S, timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut scratch = [0u8; 256];
        let mut discarded = 0;
        while Instant::now() < deadline {
            match stream.read(&mut scratch) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => discarded += n,
                Err(e) if is_idle(&e) => break,
                Err(e) => {
                    log::debug!("Read failed while discarding input: {}", e);
                    return Err(TransportError::Disconnected);
                }
            }
        }
        Ok(discarded)
    }

    fn read_frame(stream: &mut S, deadline: Instant, timeout: Duration) -> Result<Frame, TransportError> {
        let mut header = [0u8; HEADER_LENGTH];
        Self::read_exact_before(stream, &mut header, deadline, timeout)?;
        let (_, length, _) = Frame::parse_header(&header)?;
        let mut payload = vec![0u8; length];
        Self::read_exact_before(stream, &mut payload, deadline, timeout)?;
        Frame::decode(&header, payload)
    }

    fn exchange(stream: &mut S, request: &Frame, timeout: Duration) -> Result<Frame, TransportError> {
        let bytes = request.encode()?;
        stream.write_all(&bytes).map_err(|e| {
            log::debug!("Write of frame 0x{:02x} failed: {}", request.id, e);
            TransportError::Disconnected
        })?;
        stream.flush().map_err(|_| TransportError::Disconnected)?;

        let deadline = Instant::now() + timeout;
        loop {
            let response = Self::read_frame(stream, deadline, timeout)?;
            if response.id == request.id {
                return Ok(response);
            }
            log::warn!(
                "Dropping stale frame 0x{:02x} while waiting for 0x{:02x}",
                response.id,
                request.id
            );
        }
    }
}

fn is_idle(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

impl<S: Read + Write + Send> Transport for FramedLink<S> {
    fn send(&mut self, request: &Frame) -> Result<Frame, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Disconnected)?;
        let mut result = Ok(0);
        if self.out_of_step {
            result = Self::discard_input(stream, self.timeout);
            if let Ok(discarded) = result {
                if discarded > 0 {
                    log::debug!("Discarded {} bytes of stale input", discarded);
                }
                self.out_of_step = false;
            }
        }
        let result = result.and_then(|_| Self::exchange(stream, request, self.timeout));
        match &result {
            Err(TransportError::Disconnected) => self.stream = None,
            Err(TransportError::Timeout { .. } | TransportError::Framing { .. }) => self.out_of_step = true,
            _ => {}
        }
        result
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Framed transport over a physical serial port.
pub type SerialTransport = FramedLink<Box<dyn SerialPort>>;

impl SerialTransport {
    /// Open `port` at `baud_rate`; `timeout` bounds each request/response exchange.
    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .timeout(SERIAL_POLL_TIMEOUT)
            .open()?;
        serial.clear(serialport::ClearBuffer::All)?;
        Ok(Self::new(serial, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Byte stream that records writes and replays canned input, then times out.
    struct ScriptedStream {
        input: VecDeque<u8>,
        /// Bytes that arrive with each write, in order.
        arrivals: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        closed: bool,
    }

    impl ScriptedStream {
        fn replying(bytes: &[u8]) -> Self {
            Self {
                input: bytes.iter().copied().collect(),
                arrivals: VecDeque::new(),
                written: Vec::new(),
                closed: false,
            }
        }

        fn arriving(arrivals: Vec<Vec<u8>>) -> Self {
            Self {
                arrivals: arrivals.into(),
                ..Self::replying(&[])
            }
        }
    }

    fn reply(id: u8) -> Vec<u8> {
        Frame::new(id, vec![0, id]).encode().unwrap()
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if let Some(bytes) = self.arrivals.pop_front() {
                self.input.extend(bytes);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_exchange_returns_matching_response() {
        let response = Frame::new(0x03, vec![1, 2, 3]).encode().unwrap();
        let mut link = FramedLink::new(ScriptedStream::replying(&response), Duration::from_millis(20));

        let reply = link.send(&Frame::new(0x03, vec![])).unwrap();
        assert_eq!(reply.payload, vec![1, 2, 3]);
        let sent = link.stream.as_ref().unwrap().written.clone();
        assert_eq!(sent, Frame::new(0x03, vec![]).encode().unwrap());
    }

    #[test]
    fn test_corrupted_checksum_is_framing_error() {
        let mut response = Frame::new(0x03, vec![9, 9]).encode().unwrap();
        let last = response.len() - 1;
        response[last] ^= 0xff;
        let mut link = FramedLink::new(ScriptedStream::replying(&response), Duration::from_millis(20));

        let err = link.send(&Frame::new(0x03, vec![])).unwrap_err();
        assert!(matches!(err, TransportError::Framing { .. }));
    }

    #[test]
    fn test_silent_board_times_out() {
        let mut link = FramedLink::new(ScriptedStream::replying(&[]), Duration::from_millis(5));
        let err = link.send(&Frame::new(0x01, vec![])).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[test]
    fn test_late_reply_does_not_shift_later_exchanges() {
        let late_then_current = [reply(0x01), reply(0x02)].concat();
        let stream = ScriptedStream::arriving(vec![vec![], late_then_current, reply(0x03), reply(0x12)]);
        let mut link = FramedLink::new(stream, Duration::from_millis(5));

        assert!(matches!(
            link.send(&Frame::new(0x01, vec![])),
            Err(TransportError::Timeout { .. })
        ));
        for id in [0x02, 0x03, 0x12] {
            let response = link.send(&Frame::new(id, vec![])).unwrap();
            assert_eq!(response.id, id);
            assert_eq!(response.payload, vec![0, id]);
        }
    }

    #[test]
    fn test_input_left_after_framing_error_is_discarded() {
        let mut corrupted = reply(0x01);
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        let mut stream = ScriptedStream::arriving(vec![vec![], reply(0x02)]);
        stream.input = [corrupted, vec![0xaa, 0xbb, 0xcc]].concat().into();
        let mut link = FramedLink::new(stream, Duration::from_millis(20));

        assert!(matches!(
            link.send(&Frame::new(0x01, vec![])),
            Err(TransportError::Framing { .. })
        ));
        assert_eq!(link.send(&Frame::new(0x02, vec![])).unwrap().id, 0x02);
    }

    #[test]
    fn test_closed_stream_disconnects_link() {
        let mut stream = ScriptedStream::replying(&[]);
        stream.closed = true;
        let mut link = FramedLink::new(stream, Duration::from_millis(5));

        assert!(matches!(
            link.send(&Frame::new(0x01, vec![])),
            Err(TransportError::Disconnected)
        ));
        assert!(link.stream.is_none());
        assert!(matches!(
            link.send(&Frame::new(0x01, vec![])),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_oversized_length_rejected_before_reading_payload() {
        let mut header = [0u8; HEADER_LENGTH];
        header[0] = 0x31;
        header[1..3].copy_from_slice(&((MAX_PAYLOAD_LENGTH + 1) as u16).to_le_bytes());
        let mut link = FramedLink::new(ScriptedStream::replying(&header), Duration::from_millis(20));

        assert!(matches!(
            link.send(&Frame::new(0x31, vec![])),
            Err(TransportError::Framing { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::new(0x22, vec![0; MAX_PAYLOAD_LENGTH + 1]);
        assert!(frame.encode().is_err());
    }
}

//! Command/response correlation
//!
//! Sends one command at a time and follows the controller's reply sequence:
//! an ACK first, then either a DONE, or a DATA frame and a DONE in any order.
//! Anything that does not belong to the outstanding command is handed to an
//! [`OutOfBandSink`] so debug text and unsolicited frames stay visible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::frame::{encode, hex_dump, DataLayout, Frame, FrameKind};
use super::reassembler::Message;
use super::stream::ByteSink;
use super::{
    CompletionPhase, CorrelatorError, DeviceStatus, DEFAULT_ACK_TIMEOUT_MS,
    DEFAULT_POLL_INTERVAL_MS,
};

/// Receives every message that is not part of the outstanding exchange
pub trait OutOfBandSink: Send {
    /// Called once per message outside the exchange
    fn unsolicited(&mut self, message: &Message);
}

impl<T: OutOfBandSink + ?Sized> OutOfBandSink for Box<T> {
    fn unsolicited(&mut self, message: &Message) {
        (**self).unsolicited(message);
    }
}

/// Default sink: logs device text and stray frames through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl OutOfBandSink for LogSink {
    fn unsolicited(&mut self, message: &Message) {
        match message {
            Message::Text(text) => info!("DEVICE: {}", text),
            Message::Binary(frame) => info!("DEVICE (BIN): {}", hex_dump(frame.raw_bytes())),
        }
    }
}

/// Shared flag that aborts the exchange in progress.
///
/// The flag is cleared by the next `send`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Abort the current wait
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True until the next send clears the flag
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What must follow the ACK for an exchange to succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Completion {
    /// Nothing; the exchange ends at the acknowledgement
    AckOnly,
    /// A DONE frame with this status
    Done {
        #[serde(default)]
        status: u16,
    },
    /// A DATA frame carrying exactly `len` result bytes, and a DONE with `status`
    DataAndDone {
        len: usize,
        #[serde(default)]
        status: u16,
    },
}

/// A command to run through the correlator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command code on the wire
    pub command_code: u16,
    /// Encoded parameter block
    pub params: Vec<u8>,
    /// Kind of the acknowledgement frame (normally ACK)
    pub ack: FrameKind,
    /// What must follow the acknowledgement
    pub completion: Completion,
    /// End the exchange with [`CorrelatorError::Rejected`] on a NACK for this
    /// code. Off by default: a NACK is forwarded out-of-band and the wait goes on.
    pub reject_on_nack: bool,
}

impl Request {
    /// Request that expects an ACK and a DONE with status 0
    pub fn new(command_code: u16, params: impl Into<Vec<u8>>) -> Self {
        Self {
            command_code,
            params: params.into(),
            ack: FrameKind::Ack,
            completion: Completion::Done { status: 0 },
            reject_on_nack: false,
        }
    }

    /// Expect `kind` instead of ACK as the acknowledgement
    pub fn expect_ack(mut self, kind: FrameKind) -> Self {
        self.ack = kind;
        self
    }

    /// End the exchange at the acknowledgement
    pub fn ack_only(mut self) -> Self {
        self.completion = Completion::AckOnly;
        self
    }

    /// Expect a DONE with `status`
    pub fn expect_done(mut self, status: u16) -> Self {
        self.completion = Completion::Done { status };
        self
    }

    /// Expect `len` result bytes of DATA plus a DONE with `status`
    pub fn expect_data(mut self, len: usize, status: u16) -> Self {
        self.completion = Completion::DataAndDone { len, status };
        self
    }

    /// Fail as soon as the device NACKs this command
    pub fn reject_on_nack(mut self) -> Self {
        self.reject_on_nack = true;
        self
    }
}

/// Result of a successful exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Command this response answers
    pub command_code: u16,
    /// The acknowledgement frame
    pub ack: Frame,
    /// The DONE frame, absent for ack-only requests
    pub done: Option<Frame>,
    /// Result bytes from the DATA frame, envelope removed per [`DataLayout`]
    pub data: Option<Vec<u8>>,
}

impl Response {
    /// Status reported by the DONE frame
    pub fn status(&self) -> Option<u16> {
        self.done.as_ref().and_then(Frame::status)
    }
}

/// Where the correlator is in the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    /// No command outstanding
    Idle,
    /// Sent, waiting for the acknowledgement
    AwaitingAck { command_code: u16 },
    /// Acknowledged, waiting for DONE and any DATA
    AwaitingCompletion { command_code: u16, data_seen: bool },
}

/// The single outstanding command
#[derive(Debug)]
struct PendingCommand {
    command_code: u16,
    ack_kind: FrameKind,
    reject_on_nack: bool,
    done_status: Option<u16>,
    data_len: Option<usize>,
    ack: Option<Frame>,
    done: Option<Frame>,
    data: Option<Vec<u8>>,
    wrong_data_len: Option<usize>,
}

impl PendingCommand {
    fn new(command_code: u16, ack_kind: FrameKind) -> Self {
        Self {
            command_code,
            ack_kind,
            reject_on_nack: false,
            done_status: None,
            data_len: None,
            ack: None,
            done: None,
            data: None,
            wrong_data_len: None,
        }
    }
}

/// Request/response state machine for one caller
pub struct ResponseCorrelator {
    sink: Box<dyn ByteSink>,
    messages: Receiver<Message>,
    out_of_band: Box<dyn OutOfBandSink>,
    pending: Option<PendingCommand>,
    ack_timeout: Duration,
    completion_timeout: Duration,
    poll_interval: Duration,
    data_layout: DataLayout,
    cancel: CancelToken,
    tx_bytes: u64,
    tx_frames: u64,
}

impl ResponseCorrelator {
    /// Create a correlator writing to `sink` and reading from `messages`
    pub fn new(sink: Box<dyn ByteSink>, messages: Receiver<Message>) -> Self {
        let ack_timeout = Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS);
        Self {
            sink,
            messages,
            out_of_band: Box::new(LogSink),
            pending: None,
            ack_timeout,
            completion_timeout: ack_timeout * 2,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            data_layout: DataLayout::default(),
            cancel: CancelToken::default(),
            tx_bytes: 0,
            tx_frames: 0,
        }
    }

    /// Set the ACK timeout and the DONE/DATA timeout
    pub fn with_timeouts(mut self, ack: Duration, completion: Duration) -> Self {
        self.ack_timeout = ack;
        self.completion_timeout = completion;
        self
    }

    /// Set the longest single wait on the message channel
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set how DATA bodies are unpacked
    pub fn with_data_layout(mut self, layout: DataLayout) -> Self {
        self.data_layout = layout;
        self
    }

    /// Route unmatched messages to `sink` instead of the log
    pub fn with_out_of_band(mut self, sink: impl OutOfBandSink + 'static) -> Self {
        self.out_of_band = Box::new(sink);
        self
    }

    /// Share an existing cancel token instead of the correlator's own
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Give back the out-of-band sink, consuming the correlator
    pub fn into_out_of_band(self) -> Box<dyn OutOfBandSink> {
        self.out_of_band
    }

    /// Token that aborts the exchange in progress from another thread
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current exchange state
    pub fn state(&self) -> CorrelatorState {
        match &self.pending {
            None => CorrelatorState::Idle,
            Some(p) if p.ack.is_none() => CorrelatorState::AwaitingAck {
                command_code: p.command_code,
            },
            Some(p) => CorrelatorState::AwaitingCompletion {
                command_code: p.command_code,
                data_seen: p.data.is_some(),
            },
        }
    }

    /// Bytes and frames written so far
    pub fn tx_counters(&self) -> (u64, u64) {
        (self.tx_bytes, self.tx_frames)
    }

    /// Run a full exchange: send, wait for the ACK, then for the completion
    pub fn execute(&mut self, request: &Request) -> Result<Response, CorrelatorError> {
        self.send(request.command_code, &request.params, request.ack)?;
        if let Some(p) = self.pending.as_mut() {
            p.reject_on_nack = request.reject_on_nack;
        }
        let ack = self.await_ack()?;

        let (done, data) = match request.completion {
            Completion::AckOnly => {
                self.finish();
                (None, None)
            }
            Completion::Done { status } => (Some(self.await_done(status)?), None),
            Completion::DataAndDone { len, status } => {
                let (data, done) = self.await_data_and_done(len, status)?;
                (Some(done), Some(data))
            }
        };

        Ok(Response {
            command_code: request.command_code,
            ack,
            done,
            data,
        })
    }

    /// Encode and write a command, abandoning any exchange still in progress.
    ///
    /// Messages left over from an earlier exchange are forwarded to the
    /// out-of-band sink first so a late reply is never taken for this one.
    pub fn send(
        &mut self,
        command_code: u16,
        params: &[u8],
        expected_ack: FrameKind,
    ) -> Result<(), CorrelatorError> {
        self.pending = None;
        self.cancel.clear();
        self.drain_stale()?;

        let bytes = encode(command_code, params)?;
        debug!("Sending command {:#06x}: {}", command_code, hex_dump(&bytes));
        self.sink.write(&bytes)?;
        self.tx_bytes = self.tx_bytes.saturating_add(bytes.len() as u64);
        self.tx_frames = self.tx_frames.saturating_add(1);

        self.pending = Some(PendingCommand::new(command_code, expected_ack));
        Ok(())
    }

    /// Wait for the acknowledgement of the command just sent
    pub fn await_ack(&mut self) -> Result<Frame, CorrelatorError> {
        let result = self.ack_phase();
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    /// Wait for a DONE with `expected_status`. Ends the exchange.
    pub fn await_done(&mut self, expected_status: u16) -> Result<Frame, CorrelatorError> {
        let result = self.done_phase(expected_status);
        self.pending = None;
        result
    }

    /// Wait for DATA of `expected_len` result bytes and a DONE with
    /// `expected_status`, in either order. Ends the exchange.
    pub fn await_data_and_done(
        &mut self,
        expected_len: usize,
        expected_status: u16,
    ) -> Result<(Vec<u8>, Frame), CorrelatorError> {
        let result = self.data_phase(expected_len, expected_status);
        self.pending = None;
        result
    }

    /// Drop the outstanding command, if any
    pub fn finish(&mut self) {
        self.pending = None;
    }

    /// Receive the next message while no command is outstanding
    pub fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, CorrelatorError> {
        match self.messages.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CorrelatorError::LinkClosed),
        }
    }

    fn ack_phase(&mut self) -> Result<Frame, CorrelatorError> {
        let (command_code, expected) = match &self.pending {
            Some(p) if p.ack.is_none() => (p.command_code, p.ack_kind),
            _ => return Err(CorrelatorError::Idle),
        };

        let started = Instant::now();
        let deadline = started + self.ack_timeout;
        loop {
            let Some(message) = self.next_before(command_code, deadline)? else {
                warn!("Timed out waiting for {:?} to {:#06x}", expected, command_code);
                return Err(CorrelatorError::AckTimeout {
                    command_code,
                    waited: started.elapsed(),
                });
            };

            match message {
                Message::Binary(frame) if frame.matches(command_code, expected) => {
                    debug!("{:?} for {:#06x}: {}", expected, command_code, hex_dump(frame.raw_bytes()));
                    if let Some(p) = self.pending.as_mut() {
                        p.ack = Some(frame.clone());
                    }
                    return Ok(frame);
                }
                Message::Binary(frame) if self.rejects(&frame) => {
                    return Err(self.rejected(&frame));
                }
                other => self.forward(&other),
            }
        }
    }

    fn done_phase(&mut self, expected_status: u16) -> Result<Frame, CorrelatorError> {
        let command_code = self.awaiting_completion()?;
        if let Some(p) = self.pending.as_mut() {
            p.done_status = Some(expected_status);
        }

        let started = Instant::now();
        let deadline = started + self.completion_timeout;
        loop {
            let Some(message) = self.next_before(command_code, deadline)? else {
                warn!("Timed out waiting for DONE of {:#06x}", command_code);
                return Err(CorrelatorError::DoneTimeout {
                    command_code,
                    phase: CompletionPhase::Done,
                    waited: started.elapsed(),
                });
            };

            match message {
                Message::Binary(frame) if frame.matches(command_code, FrameKind::Done) => {
                    check_status(&frame, expected_status)?;
                    debug!("DONE for {:#06x}: {}", command_code, hex_dump(frame.raw_bytes()));
                    return Ok(frame);
                }
                Message::Binary(frame) if self.rejects(&frame) => {
                    return Err(self.rejected(&frame));
                }
                other => self.forward(&other),
            }
        }
    }

    fn data_phase(
        &mut self,
        expected_len: usize,
        expected_status: u16,
    ) -> Result<(Vec<u8>, Frame), CorrelatorError> {
        let command_code = self.awaiting_completion()?;
        if let Some(p) = self.pending.as_mut() {
            p.done_status = Some(expected_status);
            p.data_len = Some(expected_len);
        }

        let started = Instant::now();
        let deadline = started + self.completion_timeout;
        loop {
            let Some(message) = self.next_before(command_code, deadline)? else {
                return Err(self.completion_timeout_error(command_code, started.elapsed()));
            };

            match message {
                Message::Binary(frame) if frame.matches(command_code, FrameKind::Data) => {
                    self.accept_data(&frame, expected_len);
                }
                Message::Binary(frame) if frame.matches(command_code, FrameKind::Done) => {
                    // A bad status fails at once, whatever DATA has arrived
                    check_status(&frame, expected_status)?;
                    debug!("DONE for {:#06x}: {}", command_code, hex_dump(frame.raw_bytes()));
                    if let Some(p) = self.pending.as_mut() {
                        p.done = Some(frame);
                    }
                }
                Message::Binary(frame) if self.rejects(&frame) => {
                    return Err(self.rejected(&frame));
                }
                other => self.forward(&other),
            }

            if let Some(complete) = self.take_complete() {
                return Ok(complete);
            }
        }
    }

    fn accept_data(&mut self, frame: &Frame, expected_len: usize) {
        let result = self.data_layout.result(frame.data().unwrap_or_default());
        let Some(p) = self.pending.as_mut() else {
            return;
        };

        match result {
            Some(bytes) if bytes.len() == expected_len => {
                debug!("DATA for {:#06x}: {}", p.command_code, hex_dump(bytes));
                p.data = Some(bytes.to_vec());
            }
            _ => {
                let actual = result.map_or(0, <[u8]>::len);
                warn!(
                    "DATA for {:#06x} carries {} bytes, expected {}: {}",
                    p.command_code,
                    actual,
                    expected_len,
                    hex_dump(frame.raw_bytes())
                );
                p.wrong_data_len = Some(actual);
            }
        }
    }

    fn take_complete(&mut self) -> Option<(Vec<u8>, Frame)> {
        let p = self.pending.as_mut()?;
        if p.data.is_none() || p.done.is_none() {
            return None;
        }
        Some((p.data.take()?, p.done.take()?))
    }

    fn completion_timeout_error(&self, command_code: u16, waited: Duration) -> CorrelatorError {
        let (has_data, has_done, wrong_len, expected_len) = match &self.pending {
            Some(p) => (
                p.data.is_some(),
                p.done.is_some(),
                p.wrong_data_len,
                p.data_len.unwrap_or_default(),
            ),
            None => (false, false, None, 0),
        };

        if let (false, Some(actual)) = (has_data, wrong_len) {
            warn!("Only wrong-length DATA arrived for {:#06x}", command_code);
            return CorrelatorError::DataLengthMismatch {
                command_code,
                expected: expected_len,
                actual,
            };
        }

        let phase = match (has_data, has_done) {
            (false, false) => CompletionPhase::DataAndDone,
            (false, true) => CompletionPhase::Data,
            _ => CompletionPhase::Done,
        };
        warn!("Timed out waiting for {} of {:#06x}", phase, command_code);
        CorrelatorError::DoneTimeout {
            command_code,
            phase,
            waited,
        }
    }

    fn awaiting_completion(&self) -> Result<u16, CorrelatorError> {
        match &self.pending {
            Some(p) if p.ack.is_some() => Ok(p.command_code),
            _ => Err(CorrelatorError::Idle),
        }
    }

    /// Next message, or `None` once `deadline` has passed
    fn next_before(
        &mut self,
        command_code: u16,
        deadline: Instant,
    ) -> Result<Option<Message>, CorrelatorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(CorrelatorError::Cancelled { command_code });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            match self.messages.recv_timeout((deadline - now).min(self.poll_interval)) {
                Ok(message) => return Ok(Some(message)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(CorrelatorError::LinkClosed),
            }
        }
    }

    fn drain_stale(&mut self) -> Result<(), CorrelatorError> {
        loop {
            match self.messages.try_recv() {
                Ok(message) => self.forward(&message),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(CorrelatorError::LinkClosed),
            }
        }
    }

    fn forward(&mut self, message: &Message) {
        self.out_of_band.unsolicited(message);
    }

    /// A NACK for the outstanding code, when the request asked to fail on one
    fn rejects(&self, frame: &Frame) -> bool {
        match &self.pending {
            Some(p) => p.reject_on_nack && frame.matches(p.command_code, FrameKind::Nack),
            None => false,
        }
    }

    fn rejected(&self, frame: &Frame) -> CorrelatorError {
        let status = frame.device_status().unwrap_or(DeviceStatus::Other(0));
        warn!(
            "Command {:#06x} rejected ({}): {}",
            frame.command_code(),
            status,
            hex_dump(frame.raw_bytes())
        );
        CorrelatorError::Rejected {
            command_code: frame.command_code(),
            status,
        }
    }
}

fn check_status(frame: &Frame, expected: u16) -> Result<(), CorrelatorError> {
    let actual = frame.status().unwrap_or_default();
    if actual == expected {
        return Ok(());
    }
    warn!(
        "DONE for {:#06x} has status {:#06x}, expected {:#06x}: {}",
        frame.command_code(),
        actual,
        expected,
        hex_dump(frame.raw_bytes())
    );
    Err(CorrelatorError::UnexpectedStatus {
        command_code: frame.command_code(),
        expected,
        actual,
    })
}

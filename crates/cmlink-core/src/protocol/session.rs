//! Session management
//!
//! Handles the link lifecycle: opening the transport, running the reader
//! thread, executing commands through the correlator, and shutting down.

use std::thread;
use std::time::Duration;

use crossbeam::channel;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{
    clear_buffers, configure_port, open_port, spawn_reader, ByteSink, ByteSource, CancelToken,
    CorrelatorError, CorrelatorState, Message, OutOfBandSink, ReaderExit, ReaderHandle, Request,
    Response, ResponseCorrelator, SerialChannel, SessionError, TcpChannel,
};
use crate::config::SessionConfig;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// No link open
    Disconnected,
    /// Reader running, commands accepted
    Connected,
    /// The transport failed; `close` and reconnect to recover
    Failed,
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    /// Bytes written
    pub tx_bytes: u64,
    /// Command frames written
    pub tx_frames: u64,
    /// Bytes read
    pub rx_bytes: u64,
    /// Text lines and frames received
    pub rx_messages: u64,
}

struct Link {
    correlator: ResponseCorrelator,
    reader: ReaderHandle,
}

/// Host-side session with one controller
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    link: Option<Link>,
    out_of_band: Option<Box<dyn OutOfBandSink>>,
    cancel: CancelToken,
    /// Totals from links already closed
    closed_counters: LinkCounters,
}

impl Session {
    /// Create a session (not yet connected)
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            link: None,
            out_of_band: None,
            cancel: CancelToken::default(),
            closed_counters: LinkCounters::default(),
        }
    }

    /// Create a session and connect to the configured serial port
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(config);
        session.connect()?;
        Ok(session)
    }

    /// Route device text and unsolicited frames to `sink` instead of the log
    pub fn with_out_of_band(mut self, sink: impl OutOfBandSink + 'static) -> Self {
        self.out_of_band = Some(Box::new(sink));
        self
    }

    /// Settings this session was created with
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current link state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while commands can be sent
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Where the correlator is in the current exchange
    pub fn correlator_state(&self) -> CorrelatorState {
        self.link
            .as_ref()
            .map_or(CorrelatorState::Idle, |l| l.correlator.state())
    }

    /// Token that aborts the command in progress; valid across reconnects
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Open, configure and attach the configured serial port
    pub fn connect(&mut self) -> Result<(), SessionError> {
        if self.link.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        let port_name = self
            .config
            .port_name
            .clone()
            .ok_or(SessionError::NoPortConfigured)?;

        let mut port = open_port(&port_name, Some(self.config.baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;

        let settle = self.config.settle_delay();
        info!("Opened {} at {} baud, waiting {:?} to settle", port_name, self.config.baud_rate, settle);
        thread::sleep(settle);
        clear_buffers(port.as_mut())?;

        let (source, sink) = SerialChannel::new(port).split()?;
        self.attach(source, sink)
    }

    /// Connect through a serial-to-TCP bridge at `addr`
    pub fn connect_tcp(&mut self, addr: &str) -> Result<(), SessionError> {
        if self.link.is_some() {
            return Err(SessionError::AlreadyConnected);
        }
        let channel = TcpChannel::connect(addr, self.config.poll_interval())?;
        info!("Connected to {}", addr);
        let (source, sink) = channel.split()?;
        self.attach(source, sink)
    }

    /// Run the session over already-open transport halves
    pub fn attach(
        &mut self,
        source: Box<dyn ByteSource>,
        sink: Box<dyn ByteSink>,
    ) -> Result<(), SessionError> {
        if self.link.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let (tx, rx) = channel::unbounded();
        let reader = spawn_reader(
            source,
            tx,
            self.config.read_backoff(),
            self.config.max_line_len,
        )
        .map_err(SessionError::Spawn)?;

        let mut correlator = ResponseCorrelator::new(sink, rx)
            .with_timeouts(self.config.ack_timeout(), self.config.completion_timeout())
            .with_poll_interval(self.config.poll_interval())
            .with_data_layout(self.config.data_layout)
            .with_cancel_token(self.cancel.clone());
        if let Some(sink) = self.out_of_band.take() {
            correlator = correlator.with_out_of_band(sink);
        }

        self.link = Some(Link { correlator, reader });
        self.state = SessionState::Connected;
        debug!("Session attached");
        Ok(())
    }

    /// Send a command and wait for its full reply sequence
    pub fn execute(&mut self, request: &Request) -> Result<Response, SessionError> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        match link.correlator.execute(request) {
            Ok(response) => Ok(response),
            Err(CorrelatorError::LinkClosed) => Err(self.link_lost()),
            Err(CorrelatorError::Transport(e)) => {
                error!("Write to controller failed: {}", e);
                self.fail();
                Err(SessionError::Transport(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait up to `timeout` for a message while no command is outstanding
    pub fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, SessionError> {
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        match link.correlator.next_message(timeout) {
            Ok(message) => Ok(message),
            Err(CorrelatorError::LinkClosed) => Err(self.link_lost()),
            Err(e) => Err(e.into()),
        }
    }

    /// Traffic since the session was created, across reconnects
    pub fn counters(&self) -> LinkCounters {
        let mut counters = self.closed_counters;
        if let Some(link) = &self.link {
            add_link_counters(&mut counters, link);
        }
        counters
    }

    /// Stop the reader and release the transport.
    ///
    /// Returns how the reader ended, or `None` if nothing was open.
    pub fn close(&mut self) -> Option<ReaderExit> {
        let link = self.link.take()?;
        let exit = self.shutdown_link(link);
        self.state = SessionState::Disconnected;
        info!("Session closed");
        Some(exit)
    }

    /// Reader is gone; collect its exit and report why
    fn link_lost(&mut self) -> SessionError {
        let exit = self.fail();
        match exit {
            Some(ReaderExit::Failed(e)) => SessionError::Transport(e),
            _ => SessionError::Protocol(CorrelatorError::LinkClosed),
        }
    }

    fn fail(&mut self) -> Option<ReaderExit> {
        let exit = self.link.take().map(|link| self.shutdown_link(link));
        self.state = SessionState::Failed;
        exit
    }

    fn shutdown_link(&mut self, link: Link) -> ReaderExit {
        add_link_counters(&mut self.closed_counters, &link);
        let Link { correlator, reader } = link;
        // Dropping the correlator drops the receiver, which also ends the reader
        self.out_of_band = Some(correlator.into_out_of_band());

        let exit = reader.shutdown(self.config.join_timeout());
        if let ReaderExit::TimedOut = exit {
            warn!("Reader thread left running after close");
        }
        exit
    }
}

fn add_link_counters(counters: &mut LinkCounters, link: &Link) {
    let (tx_bytes, tx_frames) = link.correlator.tx_counters();
    counters.tx_bytes += tx_bytes;
    counters.tx_frames += tx_frames;
    counters.rx_bytes += link.reader.counters().bytes();
    counters.rx_messages += link.reader.counters().messages();
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_control, FrameKind, TransportError};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Wire = Arc<Mutex<VecDeque<u8>>>;

    /// Read half of an in-memory loop
    struct WireSource(Wire);

    impl ByteSource for WireSource {
        fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
            Ok(self.0.lock().unwrap().drain(..).collect())
        }
    }

    /// Acknowledges and completes every command it is sent
    struct AlwaysDone(Wire);

    impl ByteSink for AlwaysDone {
        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            let code = u16::from_be_bytes([bytes[5], bytes[6]]);
            let mut wire = self.0.lock().unwrap();
            wire.extend(encode_control(code, FrameKind::Ack, 0));
            wire.extend(encode_control(code, FrameKind::Done, 0));
            Ok(())
        }
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            ack_timeout_ms: 500,
            poll_interval_ms: 20,
            read_backoff_ms: 1,
            ..SessionConfig::default()
        }
    }

    fn attached() -> Session {
        let wire: Wire = Arc::default();
        let mut session = Session::new(quick_config());
        session
            .attach(
                Box::new(WireSource(wire.clone())),
                Box::new(AlwaysDone(wire)),
            )
            .unwrap();
        session
    }

    #[test]
    fn test_not_connected() {
        let mut session = Session::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.execute(&Request::new(0x1002, vec![1])),
            Err(SessionError::NotConnected)
        ));
        assert!(session.close().is_none());
    }

    #[test]
    fn test_connect_without_port() {
        let mut session = Session::new(SessionConfig::default());
        assert!(matches!(
            session.connect(),
            Err(SessionError::NoPortConfigured)
        ));
    }

    #[test]
    fn test_execute_and_counters() {
        let mut session = attached();
        assert!(session.is_connected());
        let response = session.execute(&Request::new(0x1002, vec![1])).unwrap();
        assert_eq!(response.status(), Some(0));
        assert_eq!(session.correlator_state(), CorrelatorState::Idle);

        let counters = session.counters();
        assert_eq!(counters.tx_bytes, 9);
        assert_eq!(counters.tx_frames, 1);
        assert_eq!(counters.rx_bytes, 22);
        assert_eq!(counters.rx_messages, 2);
    }

    #[test]
    fn test_attach_twice() {
        let wire: Wire = Arc::default();
        let mut session = attached();
        assert!(matches!(
            session.attach(
                Box::new(WireSource(wire.clone())),
                Box::new(AlwaysDone(wire))
            ),
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_close_stops_reader() {
        let mut session = attached();
        session.execute(&Request::new(0x1002, vec![1])).unwrap();

        match session.close() {
            Some(ReaderExit::Stopped(stats)) => assert_eq!(stats.frames, 2),
            other => panic!("Expected clean stop, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        // Counters survive the close
        assert_eq!(session.counters().tx_frames, 1);
    }
}

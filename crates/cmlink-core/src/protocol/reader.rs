//! Background reader thread
//!
//! Drains a [`ByteSource`], runs the bytes through a [`StreamReassembler`]
//! and publishes each message on a channel. The stop flag is checked before
//! every read, so shutdown takes at most one read timeout plus one backoff.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use super::reassembler::{Message, ReassemblerStats, StreamReassembler};
use super::stream::ByteSource;
use super::TransportError;

/// How the reader thread ended
#[derive(Debug)]
pub enum ReaderExit {
    /// Stopped on request or because the consumer went away
    Stopped(ReassemblerStats),
    /// The transport failed; the session is over
    Failed(TransportError),
    /// Did not stop within the join timeout and was left detached
    TimedOut,
    /// The thread panicked
    Panicked,
}

/// Live receive counters, readable while the thread runs
#[derive(Debug, Default)]
pub struct RxCounters {
    bytes: AtomicU64,
    messages: AtomicU64,
}

impl RxCounters {
    /// Bytes read from the transport
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Messages published on the channel
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

/// Owner's handle on a running reader thread
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    counters: Arc<RxCounters>,
    finished: Receiver<()>,
    thread: Option<JoinHandle<Result<ReassemblerStats, TransportError>>>,
}

/// Start a reader thread feeding `messages`.
///
/// `backoff` is the sleep after an empty read; `max_line_len` bounds
/// unterminated text (see [`StreamReassembler::with_max_line_len`]).
pub fn spawn_reader(
    mut source: Box<dyn ByteSource>,
    messages: Sender<Message>,
    backoff: Duration,
    max_line_len: usize,
) -> std::io::Result<ReaderHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let (finished_tx, finished_rx) = channel::bounded(1);
    let thread_stop = stop.clone();
    let counters = Arc::new(RxCounters::default());
    let thread_counters = counters.clone();

    let thread = thread::Builder::new()
        .name("cmlink-reader".to_string())
        .spawn(move || {
            let mut reassembler = StreamReassembler::with_max_line_len(max_line_len);
            let result = read_loop(
                source.as_mut(),
                &mut reassembler,
                &messages,
                &thread_stop,
                &thread_counters,
                backoff,
            );
            let _ = finished_tx.send(());
            debug!("Reader thread exiting: {:?}", reassembler.stats());
            result.map(|_| reassembler.stats())
        })?;

    Ok(ReaderHandle {
        stop,
        counters,
        finished: finished_rx,
        thread: Some(thread),
    })
}

fn read_loop(
    source: &mut dyn ByteSource,
    reassembler: &mut StreamReassembler,
    messages: &Sender<Message>,
    stop: &AtomicBool,
    counters: &RxCounters,
    backoff: Duration,
) -> Result<(), TransportError> {
    while !stop.load(Ordering::Acquire) {
        let bytes = match source.read_available() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Reader stopped on transport error: {}", e);
                return Err(e);
            }
        };

        if bytes.is_empty() {
            thread::sleep(backoff);
            continue;
        }

        counters.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        reassembler.extend(&bytes);
        while let Some(message) = reassembler.next_message() {
            counters.messages.fetch_add(1, Ordering::Relaxed);
            if messages.send(message).is_err() {
                debug!("Message consumer dropped, reader stopping");
                return Ok(());
            }
        }
    }
    Ok(())
}

impl ReaderHandle {
    /// Ask the thread to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Live receive counters
    pub fn counters(&self) -> &RxCounters {
        &self.counters
    }

    /// True once the thread has left its read loop
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the thread and wait up to `timeout` for it to exit
    pub fn shutdown(mut self, timeout: Duration) -> ReaderExit {
        self.request_stop();
        let Some(thread) = self.thread.take() else {
            return ReaderExit::TimedOut;
        };

        match self.finished.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match thread.join() {
                Ok(Ok(stats)) => ReaderExit::Stopped(stats),
                Ok(Err(e)) => ReaderExit::Failed(e),
                Err(_) => {
                    error!("Reader thread panicked");
                    ReaderExit::Panicked
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                warn!("Reader thread did not stop within {:?}; detaching", timeout);
                ReaderExit::TimedOut
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{encode_control, FrameKind};
    use std::collections::VecDeque;
    use std::io;

    /// Replays canned reads, then either idles or fails
    struct ScriptedSource {
        reads: VecDeque<Vec<u8>>,
        fail_when_empty: bool,
    }

    impl ByteSource for ScriptedSource {
        fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
            match self.reads.pop_front() {
                Some(bytes) => Ok(bytes),
                None if self.fail_when_empty => Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "unplugged",
                ))),
                None => Ok(Vec::new()),
            }
        }
    }

    #[test]
    fn test_reader_publishes_in_order_and_stops() {
        let frame = encode_control(0x1002, FrameKind::Ack, 0);
        let source = ScriptedSource {
            reads: VecDeque::from(vec![
                b"boot".to_vec(),
                b"ing\n".to_vec(),
                frame[..4].to_vec(),
                Vec::new(),
                frame[4..].to_vec(),
            ]),
            fail_when_empty: false,
        };
        let (tx, rx) = channel::unbounded();
        let handle = spawn_reader(Box::new(source), tx, Duration::from_millis(1), 4096).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, Message::Text("booting".to_string()));
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(second.frame().map(|f| f.kind()), Some(FrameKind::Ack));

        assert_eq!(handle.counters().messages(), 2);
        assert_eq!(handle.counters().bytes(), 8 + frame.len() as u64);

        match handle.shutdown(Duration::from_secs(2)) {
            ReaderExit::Stopped(stats) => {
                assert_eq!(stats.frames, 1);
                assert_eq!(stats.text_messages, 1);
            }
            other => panic!("Expected clean stop, got {:?}", other),
        }
    }

    /// A read that blocks well past any sensible join timeout
    struct StuckSource;

    impl ByteSource for StuckSource {
        fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
            thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_shutdown_times_out_on_stuck_read() {
        let (tx, _rx) = channel::unbounded();
        let handle = spawn_reader(Box::new(StuckSource), tx, Duration::from_millis(1), 4096).unwrap();
        assert!(!handle.is_finished());

        let started = std::time::Instant::now();
        let exit = handle.shutdown(Duration::from_millis(50));
        assert!(matches!(exit, ReaderExit::TimedOut), "got {:?}", exit);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_transport_error_ends_reader() {
        let source = ScriptedSource {
            reads: VecDeque::from(vec![b"last words\n".to_vec()]),
            fail_when_empty: true,
        };
        let (tx, rx) = channel::unbounded();
        let handle = spawn_reader(Box::new(source), tx, Duration::from_millis(1), 4096).unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Message::Text("last words".to_string())
        );
        // Sender is dropped when the thread exits
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_err());
        assert!(matches!(
            handle.shutdown(Duration::from_secs(2)),
            ReaderExit::Failed(TransportError::Io(_))
        ));
    }
}

// Reading one connection of the feed.
//
// The response body is drained by a helper thread that pushes raw lines
// into a bounded channel. The consumer side selects over that channel,
// the cancel token and a stall timer, so it never sits in a socket read
// it cannot leave.

use std::io::{self, BufRead, BufReader, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver};

use super::envelope::{decode_line, Includes, LineOutcome, StreamEnvelope, Tweet, MAX_LINE_BYTES};
use super::StreamError;
use crate::cancel::CancelToken;

/// Lines buffered between the reader thread and the dispatcher.
const LINE_BUFFER: usize = 64;

const STALLED: &str = "stalled";

/// What the handler wants after seeing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// End the session cleanly.
    Stop,
}

/// Receives every record of the feed, in arrival order.
pub trait EventHandler {
    fn on_event(&mut self, tweet: &Tweet, includes: &Includes) -> anyhow::Result<Flow>;
}

impl<F> EventHandler for F
where
    F: FnMut(&Tweet, &Includes) -> anyhow::Result<Flow>,
{
    fn on_event(&mut self, tweet: &Tweet, includes: &Includes) -> anyhow::Result<Flow> {
        self(tweet, includes)
    }
}

/// How one connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The handler asked to stop.
    Stopped,
    Cancelled,
    /// Recoverable: EOF, read error or stall. Carries the reason.
    Disconnected(String),
}

/// Running totals kept across reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedCounters {
    pub events: u64,
    pub keep_alives: u64,
    pub malformed: u64,
}

/// Deliver every record of an envelope to the handler.
pub fn dispatch(
    envelope: &StreamEnvelope,
    handler: &mut dyn EventHandler,
    counters: &mut FeedCounters,
) -> Result<Flow, StreamError> {
    for tweet in &envelope.data {
        let flow = handler
            .on_event(tweet, &envelope.includes)
            .map_err(StreamError::Handler)?;
        counters.events += 1;
        if flow == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

/// Decode one raw line and dispatch it. Keep-alives and malformed lines
/// are counted and skipped.
pub fn process_line(
    raw: &[u8],
    handler: &mut dyn EventHandler,
    counters: &mut FeedCounters,
) -> Result<Flow, StreamError> {
    match decode_line(raw) {
        LineOutcome::KeepAlive => {
            counters.keep_alives += 1;
            Ok(Flow::Continue)
        }
        LineOutcome::Malformed(reason) => {
            counters.malformed += 1;
            tracing::warn!(%reason, "skipping malformed stream line");
            Ok(Flow::Continue)
        }
        LineOutcome::Envelope(envelope) => {
            for err in &envelope.errors {
                tracing::warn!(code = err.code, message = %err.message, "stream reported an error");
            }
            dispatch(&envelope, handler, counters)
        }
    }
}

/// Receiving end of the line pump.
pub struct LinePump {
    /// Raw lines, at most `MAX_LINE_BYTES + 1` bytes each. Disconnects on
    /// EOF; a read error is sent once before that.
    pub lines: Receiver<io::Result<Vec<u8>>>,
    /// Never receives; disconnects once the thread has dropped the body.
    pub closed: Receiver<()>,
}

/// Spawn the thread that turns the body into a channel of raw lines.
///
/// A line longer than `MAX_LINE_BYTES` is cut at `MAX_LINE_BYTES + 1`
/// bytes, the rest of it is discarded up to the next newline, and the cut
/// prefix is forwarded so the decoder reports it as malformed.
pub fn spawn_line_pump(body: Box<dyn Read + Send>) -> io::Result<LinePump> {
    let (tx, lines) = bounded(LINE_BUFFER);
    let (closed_tx, closed) = bounded::<()>(0);
    thread::Builder::new()
        .name("ctw-stream-reader".into())
        .spawn(move || {
            // Declared first so it is dropped after `reader`.
            let _closed = closed_tx;
            let mut reader = BufReader::new(body);
            loop {
                let mut line = Vec::new();
                let mut capped = reader.by_ref().take(MAX_LINE_BYTES as u64 + 1);
                let mut read = capped.read_until(b'\n', &mut line);
                if line.len() > MAX_LINE_BYTES && !line.ends_with(b"\n") {
                    if let Err(e) = skip_line(&mut reader) {
                        read = Err(e);
                    }
                }
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        // The receiver is gone once the session moved on.
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(LinePump { lines, closed })
}

/// Discard input up to and including the next newline.
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Read one connection until it ends. Cancellation is checked at every
/// line boundary and while waiting for the next line.
///
/// On a stall the body is not read any further. The call waits up to
/// another `stall_timeout` for the pump to release it, so the old
/// connection is closed before the caller opens a new one.
pub fn read_feed(
    body: Box<dyn Read + Send>,
    handler: &mut dyn EventHandler,
    cancel: &CancelToken,
    stall_timeout: Duration,
    counters: &mut FeedCounters,
) -> Result<ReadOutcome, StreamError> {
    let LinePump { lines, closed } = spawn_line_pump(body).map_err(StreamError::Spawn)?;

    let outcome = loop {
        if cancel.is_cancelled() {
            break ReadOutcome::Cancelled;
        }
        select! {
            recv(lines) -> msg => match msg {
                Ok(Ok(line)) => {
                    if process_line(&line, handler, counters)? == Flow::Stop {
                        break ReadOutcome::Stopped;
                    }
                }
                Ok(Err(e)) => break ReadOutcome::Disconnected(format!("read error: {e}")),
                Err(_) => break ReadOutcome::Disconnected("EOF".into()),
            },
            recv(cancel.signal()) -> _ => break ReadOutcome::Cancelled,
            default(stall_timeout) => break ReadOutcome::Disconnected(STALLED.into()),
        }
    };

    if matches!(&outcome, ReadOutcome::Disconnected(reason) if reason == STALLED) {
        drop(lines);
        select! {
            recv(closed) -> _ => {}
            recv(cancel.signal()) -> _ => {}
            default(stall_timeout) => {
                tracing::warn!("stalled connection is still open, reconnecting anyway");
            }
        }
    }
    Ok(outcome)
}

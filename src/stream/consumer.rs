// Reconnect loop around `reader::read_feed`.
//
// State machine:
//   Connecting -> Streaming -> Disconnected -> BackingOff -> Connecting ...
// with Cancelled reachable from any state once the token fires. Only the
// very first connection of a session may fail with an API error; after the
// stream has been up once, every failure is a disconnect and gets retried.

use std::time::{Duration, Instant};

use super::backoff::{Backoff, BackoffPolicy};
use super::reader::{read_feed, EventHandler, FeedCounters, ReadOutcome};
use super::{StreamError, STREAM_PATH};
use crate::api::{ApiResponse, Gateway, GatewayError, Query};
use crate::cancel::{CancelToken, Wait};
use crate::config::StreamSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Streaming,
    Disconnected,
    BackingOff,
    Cancelled,
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// The handler returned `Flow::Stop`.
    HandlerStop,
}

/// Passed to the disconnect observer before each backoff wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub reason: String,
    /// 1 for the first reconnect of the session.
    pub attempt: u32,
    pub wait: Duration,
}

/// Aggregate numbers for one `run`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub events: u64,
    pub malformed: u64,
    pub elapsed: Duration,
    pub reconnects: u32,
    pub last_disconnect: Option<String>,
    pub stopped_by: StopReason,
}

impl SessionStats {
    pub fn events_per_minute(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.events as f64 / secs * 60.0
    }
}

type DisconnectObserver<'a> = Box<dyn FnMut(&DisconnectNotice) + 'a>;

/// Long-lived filtered stream reader with reconnect and backoff.
pub struct StreamConsumer<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    cancel: CancelToken,
    backoff: Backoff,
    stall_timeout: Duration,
    state: ConnectionState,
    on_disconnect: Option<DisconnectObserver<'a>>,
}

impl<'a, G: Gateway + ?Sized> StreamConsumer<'a, G> {
    pub fn new(gateway: &'a G, settings: &StreamSettings, cancel: CancelToken) -> Self {
        StreamConsumer {
            gateway,
            cancel,
            backoff: Backoff::new(BackoffPolicy::from(settings)),
            stall_timeout: settings.stall_timeout,
            state: ConnectionState::Disconnected,
            on_disconnect: None,
        }
    }

    /// Replace the backoff policy derived from the settings.
    pub fn with_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Backoff::new(policy);
        self
    }

    /// Called after every disconnect, before the backoff wait starts.
    pub fn on_disconnect<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&DisconnectNotice) + 'a,
    {
        self.on_disconnect = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "stream state");
            self.state = next;
        }
    }

    fn connect(&self, fields: &Query) -> Result<ApiResponse, GatewayError> {
        self.gateway
            .get_streaming(STREAM_PATH, fields)?
            .error_for_status()
    }

    /// Stream until cancelled or until the handler stops or fails.
    ///
    /// Disconnects, stalls and malformed lines are absorbed here. The only
    /// errors returned are a rejected first connection, a handler error,
    /// or failing to start the reader thread.
    pub fn run(
        &mut self,
        fields: &Query,
        handler: &mut dyn EventHandler,
    ) -> Result<SessionStats, StreamError> {
        let started = Instant::now();
        let mut counters = FeedCounters::default();
        let mut reconnects: u32 = 0;
        let mut last_disconnect: Option<String> = None;
        let mut ever_connected = false;

        let stopped_by = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            self.transition(ConnectionState::Connecting);
            let mut hint = None;
            let reason = match self.connect(fields) {
                Ok(response) => {
                    ever_connected = true;
                    self.transition(ConnectionState::Streaming);
                    let limits = response.rate_limits();
                    tracing::info!(
                        limit = ?limits.limit,
                        remaining = ?limits.remaining,
                        "connected to filtered stream"
                    );

                    let connected_at = Instant::now();
                    let outcome = read_feed(
                        response.body,
                        handler,
                        &self.cancel,
                        self.stall_timeout,
                        &mut counters,
                    )?;
                    match outcome {
                        ReadOutcome::Stopped => break StopReason::HandlerStop,
                        ReadOutcome::Cancelled => break StopReason::Cancelled,
                        ReadOutcome::Disconnected(reason) => {
                            self.backoff.connection_lasted(connected_at.elapsed());
                            reason
                        }
                    }
                }
                Err(err @ GatewayError::Api(_)) if !ever_connected => {
                    return Err(StreamError::Connect(err));
                }
                Err(err) => {
                    if let Some(api) = err.as_api().filter(|api| api.is_rate_limited()) {
                        hint = api.rate_limits.reset_in(chrono::Utc::now().timestamp());
                    }
                    err.to_string()
                }
            };

            self.transition(ConnectionState::Disconnected);
            reconnects += 1;
            let wait = self.backoff.next_wait(hint);
            tracing::warn!(%reason, attempt = reconnects, ?wait, "stream disconnected");
            let notice = DisconnectNotice {
                reason: reason.clone(),
                attempt: reconnects,
                wait,
            };
            last_disconnect = Some(reason);
            if let Some(observer) = self.on_disconnect.as_mut() {
                observer(&notice);
            }

            self.transition(ConnectionState::BackingOff);
            if self.cancel.wait(wait) == Wait::Cancelled {
                break StopReason::Cancelled;
            }
        };

        match stopped_by {
            StopReason::Cancelled => self.transition(ConnectionState::Cancelled),
            StopReason::HandlerStop => self.transition(ConnectionState::Disconnected),
        }

        let stats = SessionStats {
            events: counters.events,
            malformed: counters.malformed,
            elapsed: started.elapsed(),
            reconnects,
            last_disconnect,
            stopped_by,
        };
        tracing::info!(
            events = stats.events,
            reconnects = stats.reconnects,
            elapsed = ?stats.elapsed,
            "stream session ended"
        );
        Ok(stats)
    }
}

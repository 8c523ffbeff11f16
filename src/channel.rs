//! A duplex WebSocket channel with backpressure-aware sends.
//!
//! One [`WsChannel`] owns one physical connection.  Two background tasks
//! run per channel:
//!
//! - A **writer task** that applies flow control: a send is held until the
//!   transport's outstanding buffered bytes drop to the configured high
//!   watermark, polling at a fixed interval.  There is exactly one such
//!   drain-watch per channel; concurrent sends queue behind it in FIFO
//!   order.
//! - A **socket task** that owns the WebSocket stream: it performs the
//!   actual writes, fans inbound frames out to subscribers, answers
//!   protocol pings, and distinguishes clean from unclean closure.
//!
//! The channel is torn down when its abort token fires, when the peer
//! closes the connection, or on a socket error.  A send queued behind the
//! flow-control gate when the channel dies is rejected with
//! [`PulseLinkError::ClosedBeforeBuffered`], which is distinct from the
//! [`PulseLinkError::ConnectionClosed`] returned for a send attempted
//! against a channel that is already closed.

use crate::{
    error::{PulseLinkError, Result},
    event_handlers::{ConnectionError, DisconnectReason, EventHandlers},
    models::{ChannelOptions, Payload},
    timeouts::PulseLinkTimeouts,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tokio_util::sync::CancellationToken;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Capacity of the per-channel send queue.
const SEND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the writer-to-socket handoff queue.
const WIRE_QUEUE_CAPACITY: usize = 64;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// The WebSocket handshake is in progress.
    Connecting,
    /// The channel is open and usable.
    Open,
    /// The channel is shutting down.
    Closing,
    /// The channel is fully closed.
    Closed,
}

/// A queued outbound message with its completion signal.
struct SendOp {
    payload: Payload,
    ack: oneshot::Sender<Result<()>>,
}

/// A live duplex channel over one WebSocket connection.
///
/// Created via [`WsChannel::open`].  All I/O happens in background tasks;
/// this handle is cheap to share behind an `Arc`.
pub struct WsChannel {
    send_tx: mpsc::Sender<SendOp>,
    events: broadcast::Sender<Result<Payload>>,
    state_rx: watch::Receiver<ChannelState>,
    activity_rx: watch::Receiver<()>,
    /// Fires when the channel is torn down for any reason.
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<PulseLinkError>>>,
    buffered: Arc<AtomicUsize>,
}

impl WsChannel {
    /// Open a channel to `url`.
    ///
    /// Resolves once the WebSocket handshake has completed.  Rejects with
    /// [`PulseLinkError::Cancelled`] if `abort` is already cancelled (or
    /// fires during the handshake), with
    /// [`PulseLinkError::ConnectionFailed`] if the connection cannot be
    /// established, and with [`PulseLinkError::TimeoutError`] if the
    /// handshake exceeds `connect_timeout`.
    pub async fn open(
        url: &str,
        abort: CancellationToken,
        options: &ChannelOptions,
        connect_timeout: Duration,
        handlers: EventHandlers,
    ) -> Result<Arc<WsChannel>> {
        if abort.is_cancelled() {
            return Err(PulseLinkError::Cancelled);
        }
        log::debug!("[pulse-link] Opening channel to {}", url);

        let connect = async {
            if PulseLinkTimeouts::is_no_timeout(connect_timeout) {
                connect_async(url).await.map_err(connect_error)
            } else {
                match tokio::time::timeout(connect_timeout, connect_async(url)).await {
                    Ok(result) => result.map_err(connect_error),
                    Err(_) => Err(PulseLinkError::TimeoutError(format!(
                        "Connection timeout ({:?})",
                        connect_timeout
                    ))),
                }
            }
        };

        let (ws, _response) = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(PulseLinkError::Cancelled),
            result = connect => match result {
                Ok(pair) => pair,
                Err(e) => {
                    handlers.emit_error(ConnectionError::new(e.to_string(), true));
                    return Err(e);
                },
            },
        };

        log::debug!("[pulse-link] Channel to {} established", url);
        handlers.emit_connect();

        let (channel, parts) = assemble(&abort, options);
        tokio::spawn(socket_task(ws, parts, handlers));
        Ok(channel)
    }

    /// Send a payload over the channel.
    ///
    /// Resolves once the message has been handed to the transport with the
    /// outstanding buffered bytes at or below the configured high
    /// watermark.  Rejects with [`PulseLinkError::ConnectionClosed`] if
    /// the channel is already closed, and with
    /// [`PulseLinkError::ClosedBeforeBuffered`] if the channel goes down
    /// while the message is still queued behind the flow-control gate.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        if self.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_tx
            .send(SendOp {
                payload,
                ack: ack_tx,
            })
            .await
            .map_err(|_| self.closed_error())?;
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(closed_while_queued()),
        }
    }

    /// Subscribe to inbound payloads and the channel's terminal error.
    ///
    /// Dropping the returned subscription unsubscribes.  A terminal error
    /// is delivered at most once, after which the stream ends; clean
    /// closure and explicit aborts end the stream without an error.
    pub fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription {
            rx: self.events.subscribe(),
            shutdown: self.shutdown.clone(),
            done: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Token that fires once the channel has been torn down.
    pub fn terminated(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Why the channel closed, if it has.
    pub fn close_reason(&self) -> Option<PulseLinkError> {
        self.close_reason
            .lock()
            .expect("channel close_reason mutex poisoned")
            .clone()
    }

    /// Bytes handed to the transport but not yet flushed.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Watch that ticks on every outbound write and inbound frame.
    pub(crate) fn activity(&self) -> watch::Receiver<()> {
        self.activity_rx.clone()
    }

    fn closed_error(&self) -> PulseLinkError {
        self.close_reason
            .lock()
            .expect("channel close_reason mutex poisoned")
            .clone()
            .unwrap_or_else(|| PulseLinkError::closed("Channel is closed", true))
    }
}

/// A per-consumer view of a channel's inbound messages.
pub struct ChannelSubscription {
    rx: broadcast::Receiver<Result<Payload>>,
    shutdown: CancellationToken,
    done: bool,
}

impl ChannelSubscription {
    /// Receive the next inbound payload.
    ///
    /// Returns `None` once the channel has closed (cleanly or by abort);
    /// a terminal channel error is yielded once before the end of the
    /// stream.
    pub async fn next(&mut self) -> Option<Result<Payload>> {
        if self.done {
            return None;
        }
        loop {
            tokio::select! {
                biased;
                received = self.rx.recv() => match received {
                    Ok(Ok(payload)) => return Some(Ok(payload)),
                    Ok(Err(error)) => {
                        self.done = true;
                        return Some(Err(error));
                    },
                    Err(broadcast::error::RecvError::Closed) => {
                        self.done = true;
                        return None;
                    },
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!(
                            "[pulse-link] Channel subscriber lagging, dropped {} messages",
                            count
                        );
                    },
                },
                _ = self.shutdown.cancelled() => {
                    // Drain already-delivered items, then end the stream.
                    loop {
                        match self.rx.try_recv() {
                            Ok(Ok(payload)) => return Some(Ok(payload)),
                            Ok(Err(error)) => {
                                self.done = true;
                                return Some(Err(error));
                            },
                            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                                log::warn!(
                                    "[pulse-link] Channel subscriber lagging, dropped {} messages",
                                    count
                                );
                            },
                            Err(_) => {
                                self.done = true;
                                return None;
                            },
                        }
                    }
                },
            }
        }
    }
}

// ── Internal assembly ───────────────────────────────────────────────────────

/// Everything the socket task needs; also handed to tests in place of a
/// real socket.
struct SocketParts {
    wire_rx: mpsc::Receiver<Payload>,
    events: broadcast::Sender<Result<Payload>>,
    buffered: Arc<AtomicUsize>,
    activity: watch::Sender<()>,
    state: watch::Sender<ChannelState>,
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<PulseLinkError>>>,
    max_message_bytes: usize,
}

/// Build the channel handle and spawn the writer task.  The socket task
/// (or a test rig standing in for it) consumes the returned parts.
fn assemble(abort: &CancellationToken, options: &ChannelOptions) -> (Arc<WsChannel>, SocketParts) {
    let shutdown = abort.child_token();
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let (wire_tx, wire_rx) = mpsc::channel(WIRE_QUEUE_CAPACITY);
    let (events_tx, _events_rx) = broadcast::channel(options.event_channel_capacity);
    let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
    let (activity_tx, activity_rx) = watch::channel(());
    let buffered = Arc::new(AtomicUsize::new(0));
    let close_reason = Arc::new(Mutex::new(None));

    let channel = Arc::new(WsChannel {
        send_tx,
        events: events_tx.clone(),
        state_rx,
        activity_rx,
        shutdown: shutdown.clone(),
        close_reason: close_reason.clone(),
        buffered: buffered.clone(),
    });

    tokio::spawn(writer_task(
        send_rx,
        wire_tx,
        buffered.clone(),
        options.send_high_watermark_bytes,
        options.drain_poll_interval(),
        shutdown.clone(),
    ));

    let parts = SocketParts {
        wire_rx,
        events: events_tx,
        buffered,
        activity: activity_tx,
        state: state_tx,
        shutdown,
        close_reason,
        max_message_bytes: options.max_message_bytes,
    };
    (channel, parts)
}

fn connect_error(error: WsError) -> PulseLinkError {
    PulseLinkError::ConnectionFailed(error.to_string())
}

fn closed_while_queued() -> PulseLinkError {
    PulseLinkError::ClosedBeforeBuffered("channel went down while the send was queued".into())
}

/// Serializes outbound sends and applies the flow-control gate.
async fn writer_task(
    mut send_rx: mpsc::Receiver<SendOp>,
    wire_tx: mpsc::Sender<Payload>,
    buffered: Arc<AtomicUsize>,
    high_watermark: usize,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    'outer: loop {
        let op = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break 'outer,
            op = send_rx.recv() => match op {
                Some(op) => op,
                None => return,
            },
        };

        // Flow-control gate: hold the message until the transport buffer
        // drains to the high watermark.
        while buffered.load(Ordering::Acquire) > high_watermark {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let _ = op.ack.send(Err(closed_while_queued()));
                    break 'outer;
                },
                _ = tokio::time::sleep(poll_interval) => {},
            }
        }

        buffered.fetch_add(op.payload.len(), Ordering::AcqRel);
        if wire_tx.send(op.payload).await.is_err() {
            let _ = op.ack.send(Err(closed_while_queued()));
            break 'outer;
        }
        let _ = op.ack.send(Ok(()));
    }

    // Reject anything still queued behind the gate.
    send_rx.close();
    while let Ok(op) = send_rx.try_recv() {
        let _ = op.ack.send(Err(closed_while_queued()));
    }
}

/// Why the socket task's event loop exited.
enum Teardown {
    /// The channel's abort token fired, or every handle was dropped.
    Aborted,
    /// The server sent a normal close frame.
    Clean(String, Option<u16>),
    /// Socket error, abnormal close frame, or the stream ended mid-flight.
    Faulted(PulseLinkError),
}

/// Owns the WebSocket stream: performs writes handed over by the writer
/// task, routes inbound frames to subscribers, answers pings, and runs
/// the teardown sequence.
async fn socket_task(mut ws: WsStream, parts: SocketParts, handlers: EventHandlers) {
    let SocketParts {
        mut wire_rx,
        events,
        buffered,
        activity,
        state,
        shutdown,
        close_reason,
        max_message_bytes,
    } = parts;

    let _ = state.send(ChannelState::Open);

    let teardown = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break Teardown::Aborted,
            outbound = wire_rx.recv() => match outbound {
                Some(payload) => {
                    let len = payload.len();
                    handlers.emit_send(&payload);
                    let result = ws.send(to_ws_message(payload)).await;
                    buffered.fetch_sub(len, Ordering::AcqRel);
                    match result {
                        Ok(()) => {
                            let _ = activity.send(());
                        },
                        Err(e) => break Teardown::Faulted(PulseLinkError::closed(
                            format!("WebSocket write failed: {}", e),
                            false,
                        )),
                    }
                },
                // Every channel handle was dropped; nothing can send or
                // subscribe any more.
                None => break Teardown::Aborted,
            },
            frame = ws.next() => match frame {
                Some(Ok(message)) => {
                    let _ = activity.send(());
                    match message {
                        Message::Text(text) => {
                            if text.len() > max_message_bytes {
                                log::warn!(
                                    "[pulse-link] Inbound text message too large ({} bytes), dropping",
                                    text.len()
                                );
                            } else {
                                let payload = Payload::Text(text.to_string());
                                handlers.emit_receive(&payload);
                                let _ = events.send(Ok(payload));
                            }
                        },
                        Message::Binary(data) => {
                            if data.len() > max_message_bytes {
                                log::warn!(
                                    "[pulse-link] Inbound binary message too large ({} bytes), dropping",
                                    data.len()
                                );
                            } else {
                                let payload = Payload::Binary(data);
                                handlers.emit_receive(&payload);
                                let _ = events.send(Ok(payload));
                            }
                        },
                        Message::Ping(data) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        },
                        Message::Pong(_) | Message::Frame(_) => {},
                        Message::Close(frame) => {
                            let (clean, message, code) = match frame {
                                Some(f) => {
                                    let code = u16::from(f.code);
                                    (code == 1000, f.reason.to_string(), Some(code))
                                },
                                None => (false, String::new(), None),
                            };
                            let message = if message.is_empty() {
                                match code {
                                    Some(c) => format!("Connection closed with code {}", c),
                                    None => "Server closed connection".to_string(),
                                }
                            } else {
                                message
                            };
                            if clean {
                                break Teardown::Clean(message, code);
                            }
                            break Teardown::Faulted(PulseLinkError::closed(message, false));
                        },
                    }
                },
                Some(Err(e)) => break Teardown::Faulted(PulseLinkError::closed(
                    format!("WebSocket error: {}", e),
                    false,
                )),
                None => break Teardown::Faulted(PulseLinkError::closed(
                    "WebSocket stream ended",
                    false,
                )),
            },
        }
    };

    let _ = state.send(ChannelState::Closing);
    match teardown {
        Teardown::Aborted => {
            let _ = ws.close(None).await;
            set_reason(&close_reason, PulseLinkError::closed("Channel closed by client", true));
            handlers.emit_disconnect(DisconnectReason::new("Channel closed by client"));
        },
        Teardown::Clean(message, code) => {
            let _ = ws.close(None).await;
            set_reason(&close_reason, PulseLinkError::closed(message.clone(), true));
            let reason = match code {
                Some(c) => DisconnectReason::with_code(message, c),
                None => DisconnectReason::new(message),
            };
            handlers.emit_disconnect(reason);
        },
        Teardown::Faulted(error) => {
            set_reason(&close_reason, error.clone());
            handlers.emit_error(ConnectionError::new(error.to_string(), true));
            handlers.emit_disconnect(DisconnectReason::new(error.to_string()));
            // Surface the terminal error to every subscriber exactly once.
            let _ = events.send(Err(error));
        },
    }
    let _ = state.send(ChannelState::Closed);
    shutdown.cancel();
}

fn set_reason(slot: &Mutex<Option<PulseLinkError>>, reason: PulseLinkError) {
    *slot.lock().expect("channel close_reason mutex poisoned") = Some(reason);
}

fn to_ws_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(data) => Message::Binary(data),
    }
}

// ── Test rig ────────────────────────────────────────────────────────────────

/// Socket-less channel internals for tests: the writer task runs for
/// real, while the test plays the socket role through these handles.
#[cfg(test)]
#[allow(dead_code)]
pub(crate) struct ChannelStub {
    pub wire_rx: mpsc::Receiver<Payload>,
    pub buffered: Arc<AtomicUsize>,
    pub activity: watch::Sender<()>,
    pub events: broadcast::Sender<Result<Payload>>,
    pub state: watch::Sender<ChannelState>,
    pub abort: CancellationToken,
}

#[cfg(test)]
impl WsChannel {
    /// Build a channel without a network socket.
    pub(crate) fn stub(options: &ChannelOptions) -> (Arc<WsChannel>, ChannelStub) {
        let abort = CancellationToken::new();
        let (channel, parts) = assemble(&abort, options);
        let _ = parts.state.send(ChannelState::Open);
        let stub = ChannelStub {
            wire_rx: parts.wire_rx,
            buffered: parts.buffered,
            activity: parts.activity,
            events: parts.events,
            state: parts.state,
            abort,
        };
        (channel, stub)
    }
}

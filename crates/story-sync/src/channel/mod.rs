//! Realtime push channel.
//!
//! One persistent WebSocket to the backend per project, with automatic
//! reconnection and topic subscription. Transport work (handshake, socket
//! reads and writes, backoff timers) runs in spawned tasks that report back
//! over a single mpsc queue. Each task is stamped with the connection epoch
//! it was started for; anything reported by an older epoch is dropped, which
//! is how `disconnect` guarantees that no handler fires afterwards.
//!
//! Callers drive the channel by awaiting [`RealtimeSyncChannel::next_event`];
//! inbound frames are parsed and dispatched to handlers from inside that
//! call, in the order the transport delivered them.

pub mod handlers;
pub mod state;

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use story_core::{OutboundFrame, PushMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::reconnect::{ReconnectConfig, ReconnectState};
pub use handlers::{Handler, HandlerRegistry, SubscriptionId};
pub use state::{ChannelInput, ChannelState};

/// How long `disconnect` waits for the close frame to go out.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel is already following project {current}, not {requested}")]
    OtherProject { current: String, requested: String },
    #[error("illegal transition: {input} while {from}")]
    IllegalTransition {
        from: ChannelState,
        input: ChannelInput,
    },
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    StateChanged {
        from: ChannelState,
        to: ChannelState,
    },
    /// An inbound message was dispatched to `handlers` subscribers.
    Delivered { topic: &'static str, handlers: usize },
    /// Reconnect attempts are exhausted; the channel is disconnected.
    GaveUp { attempts: u32 },
}

/// Reported by transport tasks.
#[derive(Debug)]
enum TransportEvent {
    Opened { writer: mpsc::UnboundedSender<Message> },
    Failed { error: String },
    Frame { text: String },
    Closed,
    RetryDue,
}

#[derive(Debug)]
struct Tagged {
    epoch: u64,
    event: TransportEvent,
}

pub struct RealtimeSyncChannel {
    ws_url: Url,
    reconnect_config: ReconnectConfig,
    state: ChannelState,
    project_id: Option<String>,
    token: Option<String>,
    handlers: HandlerRegistry,
    reconnect: ReconnectState,
    /// Bumped for every connection attempt and on disconnect
    epoch: u64,
    /// Frames sent before the transport opened
    outbox: VecDeque<OutboundFrame>,
    writer: Option<mpsc::UnboundedSender<Message>>,
    transport_tx: mpsc::UnboundedSender<Tagged>,
    transport_rx: mpsc::UnboundedReceiver<Tagged>,
    connection_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    pending: VecDeque<ChannelEvent>,
}

impl RealtimeSyncChannel {
    pub fn new(ws_url: Url, reconnect_config: ReconnectConfig) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            ws_url,
            reconnect_config,
            state: ChannelState::Disconnected,
            project_id: None,
            token: None,
            handlers: HandlerRegistry::new(),
            reconnect: ReconnectState::new(),
            epoch: 0,
            outbox: VecDeque::new(),
            writer: None,
            transport_tx,
            transport_rx,
            connection_task: None,
            retry_task: None,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// Token used for the next handshake (updated by `token_refresh`).
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts
    }

    /// Start connecting. A no-op while the channel is already live for the
    /// same project.
    pub fn connect(&mut self, project_id: &str, token: &str) -> Result<(), ChannelError> {
        if self.state != ChannelState::Disconnected {
            return match self.project_id.as_deref() {
                Some(current) if current != project_id => Err(ChannelError::OtherProject {
                    current: current.to_string(),
                    requested: project_id.to_string(),
                }),
                _ => {
                    debug!("connect() while {}; ignoring", self.state);
                    Ok(())
                }
            };
        }

        self.project_id = Some(project_id.to_string());
        self.token = Some(token.to_string());
        self.reconnect.reset();
        self.transition(ChannelInput::Connect)?;
        self.start_attempt();
        Ok(())
    }

    /// Register `handler` for every inbound message on `topic`.
    pub fn subscribe(&mut self, topic: &str, handler: Handler) -> Result<SubscriptionId, ChannelError> {
        if !self.state.accepts_subscriptions() {
            return Err(ChannelError::NotConnected);
        }
        let id = self.handlers.subscribe(topic, handler);
        debug!("Subscribed to {} ({:?})", topic, id);
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.handlers.unsubscribe(id)
    }

    pub fn unsubscribe_all(&mut self) -> usize {
        self.handlers.unsubscribe_all()
    }

    /// Send a frame, buffering it while the transport is not open.
    pub fn send(&mut self, frame: OutboundFrame) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Disconnected => Err(ChannelError::NotConnected),
            ChannelState::Connected => {
                if let Some(frame) = self.write(frame) {
                    self.outbox.push_back(frame);
                }
                Ok(())
            }
            ChannelState::Connecting | ChannelState::Reconnecting => {
                debug!("Buffering {} until the channel opens", frame.channel);
                self.outbox.push_back(frame);
                Ok(())
            }
        }
    }

    /// Tear down the transport, cancel any pending retry and drop every
    /// handler. Nothing fires after this until `connect` is called again.
    pub async fn disconnect(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(Message::Close(None));
        }
        if let Some(mut task) = self.connection_task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }

        let dropped = self.handlers.unsubscribe_all();
        self.outbox.clear();
        self.pending.clear();
        while self.transport_rx.try_recv().is_ok() {}

        let from = self.state;
        self.state = ChannelState::Disconnected;
        info!("Channel disconnected ({} handlers dropped)", dropped);
        if from != ChannelState::Disconnected {
            self.pending.push_back(ChannelEvent::StateChanged {
                from,
                to: ChannelState::Disconnected,
            });
        }
    }

    /// Event already processed but not yet handed out, if any.
    pub fn poll_event(&mut self) -> Option<ChannelEvent> {
        self.pending.pop_front()
    }

    /// Wait for the next channel event, processing transport traffic (and
    /// dispatching inbound messages) along the way. Returns `None` once the
    /// channel is disconnected and has nothing left to report.
    ///
    /// Cancel safe: no transport event is lost if the future is dropped.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state == ChannelState::Disconnected {
                return None;
            }
            let tagged = self.transport_rx.recv().await?;
            self.process(tagged);
        }
    }

    fn process(&mut self, tagged: Tagged) {
        if tagged.epoch != self.epoch {
            debug!(
                "Dropping event from stale connection (epoch {} != {})",
                tagged.epoch, self.epoch
            );
            return;
        }

        match tagged.event {
            TransportEvent::Opened { writer } => self.on_opened(writer),
            TransportEvent::Frame { text } => self.on_frame(&text),
            TransportEvent::Failed { error } => {
                warn!("Channel handshake failed: {}", error);
                self.on_transport_lost();
            }
            TransportEvent::Closed => {
                info!("Channel transport closed");
                self.on_transport_lost();
            }
            TransportEvent::RetryDue => {
                self.retry_task = None;
                if self.transition(ChannelInput::RetryDue).is_ok() {
                    self.start_attempt();
                }
            }
        }
    }

    fn on_opened(&mut self, writer: mpsc::UnboundedSender<Message>) {
        if self.transition(ChannelInput::Opened).is_err() {
            return;
        }
        self.writer = Some(writer);
        self.reconnect.reset();

        if let Some(project_id) = self.project_id.clone() {
            info!("Channel open; subscribing to {}", project_id);
            if let Some(frame) = self.write(OutboundFrame::subscribe(&project_id)) {
                self.outbox.push_front(frame);
            }
        }
        while let Some(frame) = self.outbox.pop_front() {
            if let Some(frame) = self.write(frame) {
                self.outbox.push_front(frame);
                break;
            }
        }
    }

    fn on_frame(&mut self, text: &str) {
        if self.state != ChannelState::Connected {
            return;
        }
        let message = match PushMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping unparseable push message: {}", e);
                return;
            }
        };

        if let PushMessage::TokenRefresh { token } = &message {
            debug!("Push token refreshed");
            self.token = Some(token.clone());
        }

        let topic = message.topic();
        let handlers = self.handlers.dispatch(&message);
        debug!("Dispatched {} to {} handlers", topic, handlers);
        self.pending
            .push_back(ChannelEvent::Delivered { topic, handlers });
    }

    fn on_transport_lost(&mut self) {
        self.writer = None;
        self.connection_task = None;
        if self.transition(ChannelInput::TransportLost).is_err() {
            return;
        }

        let Some(delay) = self.reconnect.next_delay(&self.reconnect_config) else {
            let attempts = self.reconnect.attempts;
            error!("Giving up on the push channel after {} attempts", attempts);
            if self.transition(ChannelInput::GiveUp).is_ok() {
                self.outbox.clear();
                self.pending.push_back(ChannelEvent::GaveUp { attempts });
            }
            return;
        };
        info!(
            "Reconnecting in {:?} (attempt {})",
            delay, self.reconnect.attempts
        );
        let tx = self.transport_tx.clone();
        let epoch = self.epoch;
        self.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Tagged {
                epoch,
                event: TransportEvent::RetryDue,
            });
        }));
    }

    /// Hand a frame to the writer task. Gives the frame back if there is no
    /// live writer.
    fn write(&mut self, frame: OutboundFrame) -> Option<OutboundFrame> {
        let Some(writer) = &self.writer else {
            return Some(frame);
        };
        match writer.send(Message::Text(frame.to_text())) {
            Ok(()) => None,
            Err(_) => {
                self.writer = None;
                Some(frame)
            }
        }
    }

    fn transition(&mut self, input: ChannelInput) -> Result<(), ChannelError> {
        let from = self.state;
        match from.next(input) {
            Some(to) => {
                self.state = to;
                if from != to {
                    debug!("Channel {} -> {} ({})", from, to, input);
                    self.pending.push_back(ChannelEvent::StateChanged { from, to });
                }
                Ok(())
            }
            None => {
                warn!("Ignoring {} while {}", input, from);
                Err(ChannelError::IllegalTransition { from, input })
            }
        }
    }

    fn attempt_url(&self) -> Url {
        let mut url = self.ws_url.clone();
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }

    fn start_attempt(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let url = self.attempt_url();
        let tx = self.transport_tx.clone();

        debug!("Connecting to {}", self.ws_url);
        self.connection_task = Some(tokio::spawn(async move {
            run_connection(url.to_string(), epoch, tx).await;
        }));
    }
}

impl Drop for RealtimeSyncChannel {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }
}

/// One connection attempt: handshake, then pump frames both ways until
/// either side closes.
async fn run_connection(url: String, epoch: u64, tx: mpsc::UnboundedSender<Tagged>) {
    let report = |event| {
        let _ = tx.send(Tagged { epoch, event });
    };

    let ws_stream = match connect_async(url).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            report(TransportEvent::Failed {
                error: e.to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (writer, mut outgoing) = mpsc::unbounded_channel::<Message>();
    report(TransportEvent::Opened { writer });

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Channel write failed: {}", e);
                    break;
                }
                if closing {
                    return;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => report(TransportEvent::Frame { text }),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => report(TransportEvent::Frame { text }),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => break,
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    report(TransportEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> RealtimeSyncChannel {
        RealtimeSyncChannel::new(
            Url::parse("ws://127.0.0.1:9/ws").unwrap(),
            ReconnectConfig::default(),
        )
    }

    fn noop() -> Handler {
        Box::new(|_msg: &PushMessage| {})
    }

    #[test]
    fn test_subscribe_requires_connect() {
        let mut channel = channel();
        assert_eq!(
            channel.subscribe("git_update", noop()),
            Err(ChannelError::NotConnected)
        );
        assert_eq!(
            channel.send(OutboundFrame::sync_request("p1")),
            Err(ChannelError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        let epoch = channel.epoch;

        channel.connect("p1", "t1").unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(channel.epoch, epoch);

        assert!(matches!(
            channel.connect("p2", "t1"),
            Err(ChannelError::OtherProject { .. })
        ));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_frames_buffer_while_connecting() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        channel.send(OutboundFrame::sync_request("p1")).unwrap();
        assert_eq!(channel.outbox.len(), 1);

        channel.disconnect().await;
        assert!(channel.outbox.is_empty());
    }

    #[test]
    fn test_attempt_url_carries_token() {
        let mut channel = channel();
        channel.token = Some("a b".into());
        assert_eq!(
            channel.attempt_url().as_str(),
            "ws://127.0.0.1:9/ws?token=a+b"
        );
    }

    #[tokio::test]
    async fn test_disconnect_drops_handlers_and_stale_events() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        channel.subscribe("git_update", noop()).unwrap();
        let stale_epoch = channel.epoch;

        channel.disconnect().await;
        assert_eq!(channel.handler_count(), 0);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // Late report from the aborted attempt
        channel.process(Tagged {
            epoch: stale_epoch,
            event: TransportEvent::Closed,
        });
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        let (writer, _outgoing) = mpsc::unbounded_channel();
        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Opened { writer },
        });
        assert_eq!(channel.state(), ChannelState::Connected);
        channel.pending.clear();

        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Frame {
                text: "{not json".into(),
            },
        });
        assert_eq!(channel.state(), ChannelState::Connected);
        assert!(channel.poll_event().is_none());
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_token_refresh_is_kept_for_reconnects() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        let (writer, _outgoing) = mpsc::unbounded_channel();
        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Opened { writer },
        });

        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Frame {
                text: r#"{"channel":"token_refresh","data":{"token":"t2"}}"#.into(),
            },
        });
        assert_eq!(channel.token(), Some("t2"));
        assert!(channel.attempt_url().as_str().ends_with("token=t2"));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_sent_first_on_open() {
        let mut channel = channel();
        channel.connect("p1", "t1").unwrap();
        channel.send(OutboundFrame::sync_request("p1")).unwrap();

        let (writer, mut outgoing) = mpsc::unbounded_channel();
        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Opened { writer },
        });

        let Some(Message::Text(first)) = outgoing.recv().await else {
            panic!("expected text frame");
        };
        assert!(first.contains("subscribe:p1"));
        let Some(Message::Text(second)) = outgoing.recv().await else {
            panic!("expected text frame");
        };
        assert!(second.contains("sync-request:p1"));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_give_up_after_max_attempts() {
        let mut channel = RealtimeSyncChannel::new(
            Url::parse("ws://127.0.0.1:9/ws").unwrap(),
            ReconnectConfig {
                max_attempts: Some(0),
                ..Default::default()
            },
        );
        channel.connect("p1", "t1").unwrap();
        channel.pending.clear();

        channel.process(Tagged {
            epoch: channel.epoch,
            event: TransportEvent::Failed {
                error: "refused".into(),
            },
        });

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_eq!(
            channel.pending.back(),
            Some(&ChannelEvent::GaveUp { attempts: 0 })
        );
    }
}

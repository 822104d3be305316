// ============================================
// WebSocket Connection Handler
// ============================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper_tungstenite::tungstenite::{Error as WsError, Message};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::error::Elapsed;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::coordinator::{Departure, SessionCoordinator};
use crate::error::SessionError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::relay::{Envelope, RelayOutcome, RelayTarget};
use crate::state::{AppState, Outbound};
use crate::ConnId;

/// Runs `disconnect` for a connection exactly once.
///
/// Call [`ConnectionLifecycle::close`] on the normal exit path. If the guard
/// is dropped without that (the connection task panicked or was cancelled)
/// the disconnect is spawned onto the runtime instead.
pub struct ConnectionLifecycle {
    conn_id: ConnId,
    coordinator: SessionCoordinator,
    closed: bool,
}

impl ConnectionLifecycle {
    pub fn new(conn_id: ConnId, coordinator: SessionCoordinator) -> Self {
        Self {
            conn_id,
            coordinator,
            closed: false,
        }
    }

    pub async fn close(mut self) -> Option<Departure> {
        let departure = finish(&self.coordinator, &self.conn_id).await;
        self.closed = true;
        departure
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let conn_id = std::mem::take(&mut self.conn_id);
        let coordinator = self.coordinator.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    finish(&coordinator, &conn_id).await;
                });
            }
            Err(_) => warn!("No runtime left to clean up connection {}", conn_id),
        }
    }
}

async fn finish(coordinator: &SessionCoordinator, conn_id: &ConnId) -> Option<Departure> {
    match coordinator.disconnect(conn_id).await {
        Ok(departure) => {
            if let Some(d) = &departure {
                debug!(
                    "{} ({}) left {} on disconnect; notified {} member(s), room closed: {}",
                    d.member.display_name,
                    conn_id,
                    d.room_id,
                    d.notified.len(),
                    d.room_closed
                );
            }
            info!("Connection {} cleaned up", conn_id);
            departure
        }
        Err(e) => {
            debug!("Disconnect for {} already handled: {}", conn_id, e);
            None
        }
    }
}

pub async fn handle_connection(
    ws: hyper_tungstenite::WebSocketStream<hyper::upgrade::Upgraded>,
    addr: SocketAddr,
    state: Arc<AppState>,
) {
    let conn_id: ConnId = uuid::Uuid::new_v4().to_string();
    info!("WebSocket connection {} established from {}", conn_id, addr);

    let (ws_sender, mut ws_receiver) = ws.split();

    // Create channel for sending messages to this WebSocket
    let (tx, rx) = mpsc::unbounded_channel::<Arc<ServerMessage>>();

    // Spawn task to forward messages from channel to WebSocket, pinging on the side
    let mut send_task = tokio::spawn(write_loop(ws_sender, rx, state.config.ping_interval()));

    state.coordinator.connect(conn_id.clone(), tx.clone()).await;
    let lifecycle = ConnectionLifecycle::new(conn_id.clone(), state.coordinator.clone());

    tokio::select! {
        end = read_loop(&mut ws_receiver, &conn_id, &state, &tx) => {
            info!("Connection {} ({}) ended: {:?}", conn_id, addr, end);
        }
        _ = &mut send_task => {
            info!("Connection {} ({}) writer stopped", conn_id, addr);
        }
    }

    // Clean up when connection closes
    lifecycle.close().await;
    send_task.abort();
}

/// Why the inbound side of a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Closed,
    StreamEnded,
    Failed,
    IdleTimeout,
}

/// Consume inbound frames until the peer goes away. Every frame, pongs
/// included, restarts the idle timer.
async fn read_loop<S>(stream: &mut S, conn_id: &ConnId, state: &AppState, reply: &Outbound) -> ReadEnd
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let idle_timeout = state.config.idle_timeout();
    loop {
        match next_frame(stream, idle_timeout).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                handle_text(&text, conn_id, state, reply).await;
            }
            Ok(Some(Ok(Message::Close(_)))) => return ReadEnd::Closed,
            Ok(Some(Ok(Message::Binary(_)))) => {
                warn!("Ignoring binary frame from {}", conn_id);
            }
            // pongs and pings; tungstenite answers pings on its own
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                error!("WebSocket error from {}: {}", conn_id, e);
                return ReadEnd::Failed;
            }
            Ok(None) => return ReadEnd::StreamEnded,
            Err(_) => {
                info!("Connection {} missed pongs for too long; dropping", conn_id);
                return ReadEnd::IdleTimeout;
            }
        }
    }
}

/// Serialize queued messages onto the socket and send a ping every
/// `ping_interval`.
async fn write_loop<K>(
    mut sink: K,
    mut rx: mpsc::UnboundedReceiver<Arc<ServerMessage>>,
    ping_interval: Option<Duration>,
) where
    K: Sink<Message> + Unpin,
{
    let mut pings = ping_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let json = match serde_json::to_string(msg.as_ref()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            _ = next_tick(&mut pings) => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_frame<S>(stream: &mut S, idle_timeout: Option<Duration>) -> Result<Option<S::Item>, Elapsed>
where
    S: Stream + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}

/// Parse and dispatch one text frame, answering the sender on failure.
pub async fn handle_text(text: &str, conn_id: &ConnId, state: &AppState, reply: &Outbound) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to parse message from {}: {}", conn_id, e);
            let _ = reply.send(Arc::new(ServerMessage::invalid_request(format!(
                "Invalid message format: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = dispatch(msg, conn_id, state).await {
        match ServerMessage::from_error(&e) {
            Some(frame) => {
                warn!("Error handling message from {}: {}", conn_id, e);
                let _ = reply.send(Arc::new(frame));
            }
            None => debug!("Ignoring request from {}: {}", conn_id, e),
        }
    }
}

pub async fn dispatch(msg: ClientMessage, conn_id: &ConnId, state: &AppState) -> Result<(), SessionError> {
    let router = &state.router;
    match msg {
        ClientMessage::JoinRoom {
            room_id,
            display_name,
            intent,
        } => {
            let admission = state
                .coordinator
                .join(conn_id, &room_id, &display_name, intent)
                .await?;
            debug!(
                "{} admitted to {} alongside {} member(s) (created: {})",
                conn_id,
                admission.room_id,
                admission.members.len(),
                admission.created
            );
        }
        ClientMessage::LeaveRoom => {
            state.coordinator.leave(conn_id).await;
        }
        ClientMessage::Signal { payload, target } => {
            let target = match target {
                Some(to) => RelayTarget::DirectToConnection(to),
                None => RelayTarget::RoomExceptSender,
            };
            best_effort(router.relay(conn_id, Envelope::Signal(payload), target).await)?;
        }
        ClientMessage::DrawLine { payload } => {
            router
                .relay(conn_id, Envelope::DrawLine(payload), RelayTarget::RoomExceptSender)
                .await?;
        }
        ClientMessage::DrawText { payload } => {
            router
                .relay(conn_id, Envelope::DrawText(payload), RelayTarget::RoomExceptSender)
                .await?;
        }
        ClientMessage::ClearBoard { payload } => {
            router
                .relay(conn_id, Envelope::ClearBoard(payload), RelayTarget::RoomExceptSender)
                .await?;
        }
        ClientMessage::BoardSnapshotRequest { payload } => {
            router
                .relay(
                    conn_id,
                    Envelope::BoardSnapshotRequest(payload),
                    RelayTarget::RoomIncludingSender,
                )
                .await?;
        }
        ClientMessage::BoardSnapshot { payload, target } => {
            best_effort(
                router
                    .relay(
                        conn_id,
                        Envelope::BoardSnapshot(payload),
                        RelayTarget::DirectToConnection(target),
                    )
                    .await,
            )?;
        }
        ClientMessage::ChatMessage { text } => {
            router
                .relay(conn_id, Envelope::ChatMessage(text), RelayTarget::RoomExceptSender)
                .await?;
        }
        ClientMessage::ChatFile { payload } => {
            router
                .relay(conn_id, Envelope::ChatFile(payload), RelayTarget::RoomExceptSender)
                .await?;
        }
        ClientMessage::PrivateMessage { text, target } => {
            let res = router
                .relay(
                    conn_id,
                    Envelope::PrivateMessage(text),
                    RelayTarget::DirectToConnection(target),
                )
                .await;
            if state.config.report_unreachable_targets {
                res?;
            } else {
                best_effort(res)?;
            }
        }
    }
    Ok(())
}

/// Direct relays of fire-and-forget kinds swallow unreachable targets.
fn best_effort(res: Result<RelayOutcome, SessionError>) -> Result<(), SessionError> {
    match res {
        Ok(RelayOutcome::Delivered { recipients: 0 }) => {
            debug!("Direct relay accepted by no transport");
            Ok(())
        }
        Err(SessionError::TargetUnreachable(to)) => {
            debug!("Dropping direct relay to unreachable {}", to);
            Ok(())
        }
        other => other.map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ErrorCode;
    use crate::tests::{connect, drain};
    use serde_json::json;

    fn app(config: ServerConfig) -> AppState {
        AppState::new(config)
    }

    async fn join(state: &AppState, conn_id: &str, room: &str, name: &str) {
        state
            .coordinator
            .create_room(&conn_id.to_string(), room, name)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_answers_invalid_request() {
        let state = app(ServerConfig::default());
        let mut rx = connect(&state.coordinator, "a").await;
        drain(&mut rx);
        let (reply, mut reply_rx) = mpsc::unbounded_channel();

        handle_text("{not json", &"a".to_string(), &state, &reply).await;
        assert!(matches!(
            *reply_rx.try_recv().unwrap(),
            ServerMessage::Error { code: ErrorCode::InvalidRequest, .. }
        ));
    }

    #[tokio::test]
    async fn missing_room_is_reported_to_sender() {
        let state = app(ServerConfig::default());
        let _rx = connect(&state.coordinator, "y").await;
        let (reply, mut reply_rx) = mpsc::unbounded_channel();

        let frame = json!({
            "type": "join-room", "room_id": "ZZZZZZ", "display_name": "Yan", "intent": "join"
        })
        .to_string();
        handle_text(&frame, &"y".to_string(), &state, &reply).await;
        assert!(matches!(
            *reply_rx.try_recv().unwrap(),
            ServerMessage::Error { code: ErrorCode::RoomNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn signal_to_missing_target_is_silent() {
        let state = app(ServerConfig::default());
        let _rx = connect(&state.coordinator, "a").await;
        join(&state, "a", "r", "Ann").await;

        let msg = ClientMessage::Signal {
            payload: json!({ "candidate": "c" }),
            target: Some("gone".into()),
        };
        assert_eq!(dispatch(msg, &"a".to_string(), &state).await, Ok(()));
    }

    #[tokio::test]
    async fn private_message_reporting_follows_config() {
        let msg = || ClientMessage::PrivateMessage {
            text: "hi".into(),
            target: "gone".into(),
        };

        let reporting = app(ServerConfig::default());
        let _a = connect(&reporting.coordinator, "a").await;
        join(&reporting, "a", "r", "Ann").await;
        assert_eq!(
            dispatch(msg(), &"a".to_string(), &reporting).await,
            Err(SessionError::TargetUnreachable("gone".into()))
        );

        let quiet = app(ServerConfig {
            report_unreachable_targets: false,
            ..ServerConfig::default()
        });
        let _a = connect(&quiet.coordinator, "a").await;
        join(&quiet, "a", "r", "Ann").await;
        assert_eq!(dispatch(msg(), &"a".to_string(), &quiet).await, Ok(()));
    }

    #[tokio::test]
    async fn chat_file_goes_to_the_rest_of_the_room() {
        let state = app(ServerConfig::default());
        let mut a = connect(&state.coordinator, "a").await;
        let mut b = connect(&state.coordinator, "b").await;
        join(&state, "a", "r", "Ann").await;
        join(&state, "b", "r", "Ben").await;
        drain(&mut a);
        drain(&mut b);

        let payload = json!({ "name": "notes.pdf", "size": 3, "data": "AAEC" });
        dispatch(
            ClientMessage::ChatFile { payload: payload.clone() },
            &"a".to_string(),
            &state,
        )
        .await
        .unwrap();

        assert!(drain(&mut a).is_empty());
        assert!(matches!(
            drain(&mut b).as_slice(),
            [ServerMessage::ChatFile { payload: p, from_name, .. }] if *p == payload && from_name == "Ann"
        ));
    }

    #[tokio::test]
    async fn lifecycle_close_runs_disconnect_once() {
        let state = app(ServerConfig::default());
        let _a = connect(&state.coordinator, "a").await;
        let mut b = connect(&state.coordinator, "b").await;
        join(&state, "a", "r", "Ann").await;
        join(&state, "b", "r", "Ben").await;
        drain(&mut b);

        let guard = ConnectionLifecycle::new("a".into(), state.coordinator.clone());
        let departure = guard.close().await.unwrap();
        assert_eq!(departure.notified, vec!["b".to_string()]);

        // a second guard for the same id finds nothing left to do
        let again = ConnectionLifecycle::new("a".into(), state.coordinator.clone());
        assert!(again.close().await.is_none());
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[tokio::test]
    async fn dropped_lifecycle_still_disconnects() {
        let state = app(ServerConfig::default());
        let _a = connect(&state.coordinator, "a").await;
        join(&state, "a", "r", "Ann").await;

        drop(ConnectionLifecycle::new("a".into(), state.coordinator.clone()));
        for _ in 0..10 {
            if state.coordinator.stats().await.connections == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let stats = state.coordinator.stats().await;
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.rooms, 0);
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let mut silent = futures_util::stream::pending::<u8>();
        let res = next_frame(&mut silent, Some(Duration::from_millis(10))).await;
        assert!(res.is_err());

        let mut one = futures_util::stream::iter(vec![7u8]);
        assert_eq!(next_frame(&mut one, None).await.unwrap(), Some(7));
    }

    fn capture(tx: mpsc::UnboundedSender<Message>) -> impl Sink<Message, Error = ()> + Unpin {
        Box::pin(futures_util::sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| ())?;
            Ok::<_, ()>(tx)
        }))
    }

    fn frames(
        rx: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        }))
    }

    fn pinging_config() -> ServerConfig {
        ServerConfig {
            idle_timeout_secs: 10,
            ping_interval_secs: 3,
            ..ServerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_on_interval_and_forwards_messages() {
        let (to_client, mut inbox) = mpsc::unbounded_channel();
        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(capture(to_client), rx, Some(Duration::from_secs(3))));
        outbound.send(Arc::new(ServerMessage::welcome("a"))).unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        let mut sent = Vec::new();
        while let Ok(frame) = inbox.try_recv() {
            sent.push(frame);
        }
        assert!(matches!(&sent[0], Message::Text(t) if t.contains("welcome")));
        assert_eq!(sent.iter().filter(|f| matches!(f, Message::Ping(_))).count(), 2);

        drop(outbound);
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_client_answering_pings_outlives_idle_timeout() {
        let state = app(pinging_config());
        let (to_client, mut client_inbox) = mpsc::unbounded_channel();
        let (to_server, server_inbox) = mpsc::unbounded_channel();
        let (_outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(capture(to_client), rx, state.config.ping_interval()));

        // sends nothing of its own, but pongs like a browser does
        let client = tokio::spawn(async move {
            while let Some(frame) = client_inbox.recv().await {
                if let Message::Ping(data) = frame {
                    if to_server.send(Ok(Message::Pong(data))).is_err() {
                        break;
                    }
                }
            }
        });

        let mut inbound = frames(server_inbox);
        let (reply, _reply_rx) = mpsc::unbounded_channel();
        let conn_id = "quiet".to_string();
        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            read_loop(&mut inbound, &conn_id, &state, &reply),
        )
        .await;
        assert!(outcome.is_err(), "live connection ended early: {:?}", outcome);

        writer.abort();
        client.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn client_that_stops_ponging_is_dropped() {
        let state = app(pinging_config());
        let (_to_server, server_inbox) = mpsc::unbounded_channel();
        let mut inbound = frames(server_inbox);
        let (reply, _reply_rx) = mpsc::unbounded_channel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            read_loop(&mut inbound, &"gone".to_string(), &state, &reply),
        )
        .await;
        assert_eq!(outcome.unwrap(), ReadEnd::IdleTimeout);
    }

    #[tokio::test]
    async fn close_frame_ends_read_loop() {
        let state = app(ServerConfig::default());
        let (to_server, server_inbox) = mpsc::unbounded_channel();
        to_server.send(Ok(Message::Close(None))).unwrap();
        let mut inbound = frames(server_inbox);
        let (reply, _reply_rx) = mpsc::unbounded_channel();

        let end = read_loop(&mut inbound, &"a".to_string(), &state, &reply).await;
        assert_eq!(end, ReadEnd::Closed);
    }
}

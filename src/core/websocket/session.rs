// src/core/websocket/session.rs

//! The session loop. One task per client connection owns both halves of
//! the socket; bus events, inbound frames, the token-expiry ticker, and
//! the server's cancellation are multiplexed through one `select!`.

use super::{WebsocketMessage, inbound, outbound};
use crate::core::environment::PowerPhase;
use crate::core::errors::{HelmsmanError, track_unexpected};
use crate::core::events::{self, Event, EventSink, topic};
use crate::core::metrics;
use crate::core::server::{PowerAction, Server};
use crate::core::token::{Claims, TokenValidator, permission};
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Topics relayed to authenticated clients.
const RELAY_TOPICS: &[&str] = &[
    topic::STATUS,
    topic::CONSOLE_OUTPUT,
    topic::INSTALL_OUTPUT,
    topic::INSTALL_STARTED,
    topic::INSTALL_COMPLETED,
    topic::STATS,
    topic::DAEMON_MESSAGE,
    topic::DAEMON_ERROR,
    topic::BACKUP_COMPLETED,
    topic::TRANSFER_STATUS,
    topic::TRANSFER_LOGS,
];

/// Capacity of this session's bus sink. Console bursts beyond this are
/// dropped for this client only.
const SINK_CAPACITY: usize = 256;

/// How often token expiry is re-checked.
const TOKEN_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How close to expiry the client is warned.
const TOKEN_EXPIRING_WINDOW: i64 = 3 * 60;

/// The generic message shown for errors a client may not see in detail.
const GENERIC_ERROR: &str = "an unexpected error was encountered while handling this request";

pub struct WebsocketSession {
    server: Arc<Server>,
    validator: Arc<TokenValidator>,
    claims: RwLock<Option<Claims>>,
}

impl WebsocketSession {
    pub fn new(server: Arc<Server>, validator: Arc<TokenValidator>) -> Self {
        Self {
            server,
            validator,
            claims: RwLock::new(None),
        }
    }

    fn claims(&self) -> Option<Claims> {
        self.claims.read().clone()
    }

    /// Whether the active token is present and unexpired.
    fn token_is_live(&self) -> bool {
        self.claims()
            .map(|claims| claims.exp > Utc::now().timestamp())
            .unwrap_or(false)
    }

    fn has_permission(&self, perm: &str) -> bool {
        self.claims()
            .map(|claims| claims.has_permission(perm))
            .unwrap_or(false)
    }

    /// Drives the session until the socket closes, the server is
    /// deleted, or a write fails.
    pub async fn run(self, socket: WebSocket) {
        metrics::WEBSOCKET_SESSIONS.inc();
        let result = self.run_inner(socket).await;
        metrics::WEBSOCKET_SESSIONS.dec();
        if let Err(err) = result {
            debug!(server = %self.server.uuid(), error = %err, "websocket session ended");
        }
    }

    async fn run_inner(&self, socket: WebSocket) -> Result<(), axum::Error> {
        let (mut tx, mut rx) = socket.split();

        // The bus sink is registered up-front but nothing flows until the
        // client authenticates; relay gating happens below.
        let (sink, mut bus_rx) = events::sink_pair(SINK_CAPACITY);
        // Session-local events (auth replies, errors) ride their own
        // channel so handlers never write to the socket directly.
        let (out_tx, mut out_rx) = mpsc::channel::<WebsocketMessage>(64);

        let mut authenticated_once = false;
        let mut expiry_announced = false;
        let mut ticker = tokio::time::interval(TOKEN_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let server_gone = self.server.context().clone();

        let result = loop {
            tokio::select! {
                frame = rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(raw))) => {
                            let Ok(message) = serde_json::from_str::<WebsocketMessage>(&raw) else {
                                continue;
                            };
                            self.handle_inbound(message, &sink, &out_tx, &mut authenticated_once, &mut expiry_announced).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Err(err),
                    }
                }
                event = bus_rx.recv() => {
                    let Some(event) = event else { break Ok(()) };
                    if let Some(message) = self.filter_outbound(event) {
                        if let Err(err) = send(&mut tx, &message).await {
                            break Err(err);
                        }
                    }
                }
                message = out_rx.recv() => {
                    // The sender side lives in this struct's handlers, so
                    // the channel cannot close before the loop ends.
                    let Some(message) = message else { break Ok(()) };
                    if let Err(err) = send(&mut tx, &message).await {
                        break Err(err);
                    }
                }
                _ = ticker.tick() => {
                    if let Some(message) = self.check_token_expiry(&mut expiry_announced) {
                        if let Err(err) = send(&mut tx, &message).await {
                            break Err(err);
                        }
                    }
                }
                _ = server_gone.cancelled() => {
                    let _ = tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "server deleted".into(),
                        })))
                        .await;
                    break Ok(());
                }
            }
        };

        self.server.events().unsubscribe_all(&sink);
        result
    }

    /// Applies permission filtering and error rewriting to a bus event
    /// before it reaches this client. Returns `None` to drop it.
    fn filter_outbound(&self, event: Event) -> Option<WebsocketMessage> {
        if !self.token_is_live() {
            return None;
        }
        match event.topic.as_str() {
            topic::INSTALL_OUTPUT => {
                if !self.has_permission(permission::ADMIN_INSTALL) {
                    return None;
                }
            }
            topic::BACKUP_COMPLETED => {
                if !self.has_permission(permission::BACKUP_READ) {
                    return None;
                }
            }
            topic::TRANSFER_LOGS => {
                if !self.has_permission(permission::ADMIN_TRANSFER) {
                    return None;
                }
            }
            _ => {}
        }
        Some(WebsocketMessage::new(
            &event.topic,
            vec![event.payload_string()],
        ))
    }

    async fn handle_inbound(
        &self,
        message: WebsocketMessage,
        sink: &EventSink,
        out: &mpsc::Sender<WebsocketMessage>,
        authenticated_once: &mut bool,
        expiry_announced: &mut bool,
    ) {
        if message.event == inbound::AUTH {
            self.handle_auth(&message, sink, out, authenticated_once, expiry_announced)
                .await;
            return;
        }

        // Nothing else is processed before authentication or after the
        // token lapses.
        if !self.token_is_live() {
            let _ = out
                .send(WebsocketMessage::new(
                    outbound::JWT_ERROR,
                    vec!["could not authenticate the request".to_string()],
                ))
                .await;
            return;
        }

        match message.event.as_str() {
            inbound::SET_STATE => self.handle_set_state(&message, out).await,
            inbound::SEND_COMMAND => self.handle_send_command(&message, out).await,
            inbound::SEND_LOGS => self.handle_send_logs(out).await,
            _ => {}
        }
    }

    async fn handle_auth(
        &self,
        message: &WebsocketMessage,
        sink: &EventSink,
        out: &mpsc::Sender<WebsocketMessage>,
        authenticated_once: &mut bool,
        expiry_announced: &mut bool,
    ) {
        let Some(raw) = message.args.first() else {
            return;
        };

        let claims = match self.validator.validate(raw) {
            Ok(claims) => claims,
            Err(err) => {
                let _ = out
                    .send(WebsocketMessage::new(
                        outbound::JWT_ERROR,
                        vec![err.to_string()],
                    ))
                    .await;
                return;
            }
        };

        if claims.server_uuid() != Some(self.server.uuid())
            || !claims.has_permission(permission::CONNECT)
        {
            let _ = out
                .send(WebsocketMessage::new(
                    outbound::JWT_ERROR,
                    vec!["you are not authorized to connect to this server".to_string()],
                ))
                .await;
            return;
        }

        *self.claims.write() = Some(claims);
        *expiry_announced = false;
        let _ = out.send(WebsocketMessage::bare(outbound::AUTH_SUCCESS)).await;

        // Only the first authentication primes the session; token
        // refreshes must not replay the current state.
        if !*authenticated_once {
            *authenticated_once = true;
            self.server.events().subscribe(sink.clone(), RELAY_TOPICS);

            let phase = self.server.phase();
            let _ = out
                .send(WebsocketMessage::new(
                    topic::STATUS,
                    vec![phase.to_string()],
                ))
                .await;
            if phase == PowerPhase::Offline {
                let usage = self.server.last_resource_usage();
                let _ = out
                    .send(WebsocketMessage::new(
                        topic::STATS,
                        vec![json!(usage).to_string()],
                    ))
                    .await;
            }
        }
    }

    async fn handle_set_state(
        &self,
        message: &WebsocketMessage,
        out: &mpsc::Sender<WebsocketMessage>,
    ) {
        let Some(raw) = message.args.first() else {
            return;
        };
        let Ok(action) = PowerAction::from_str(raw) else {
            self.send_error(out, HelmsmanError::InvalidRequest(format!(
                "unknown power action '{raw}'"
            )))
            .await;
            return;
        };

        let required = match action {
            PowerAction::Start => permission::POWER_START,
            PowerAction::Stop | PowerAction::Kill => permission::POWER_STOP,
            PowerAction::Restart => permission::POWER_RESTART,
        };
        if !self.has_permission(required) {
            return;
        }

        // Power actions can wait on the lock for a long time; never stall
        // the session loop on them.
        let server = self.server.clone();
        let out = out.clone();
        let errors_visible = self.has_permission(permission::ADMIN_ERRORS);
        tokio::spawn(async move {
            if let Err(err) = server.handle_power_action(action, None).await {
                let _ = out
                    .send(error_message(err, errors_visible))
                    .await;
            }
        });
    }

    async fn handle_send_command(
        &self,
        message: &WebsocketMessage,
        out: &mpsc::Sender<WebsocketMessage>,
    ) {
        if !self.has_permission(permission::SEND_COMMAND) {
            return;
        }
        let Some(line) = message.args.first() else {
            return;
        };
        match self.server.send_command(line).await {
            // A command to a stopped server is silently dropped.
            Ok(()) | Err(HelmsmanError::IsOffline) => {}
            Err(err) => self.send_error(out, err).await,
        }
    }

    async fn handle_send_logs(&self, out: &mpsc::Sender<WebsocketMessage>) {
        for line in self.server.recent_logs() {
            if out
                .send(WebsocketMessage::new(topic::CONSOLE_OUTPUT, vec![line]))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    /// Emits `token expiring` inside the warning window and `token
    /// expired` (once) after expiry.
    fn check_token_expiry(&self, expiry_announced: &mut bool) -> Option<WebsocketMessage> {
        let claims = self.claims()?;
        let remaining = claims.exp - Utc::now().timestamp();

        if remaining <= 0 {
            if *expiry_announced {
                return None;
            }
            *expiry_announced = true;
            return Some(WebsocketMessage::bare(outbound::TOKEN_EXPIRED));
        }
        if remaining <= TOKEN_EXPIRING_WINDOW {
            return Some(WebsocketMessage::bare(outbound::TOKEN_EXPIRING));
        }
        None
    }

    async fn send_error(&self, out: &mpsc::Sender<WebsocketMessage>, err: HelmsmanError) {
        let errors_visible = self.has_permission(permission::ADMIN_ERRORS);
        let _ = out.send(error_message(err, errors_visible)).await;
    }
}

/// Renders an error for the client: expected user errors verbatim,
/// anything else anonymized behind a UUID unless the token carries the
/// errors-observer permission.
fn error_message(err: HelmsmanError, errors_visible: bool) -> WebsocketMessage {
    let text = if err.is_user_error() || errors_visible {
        err.to_string()
    } else {
        let id = track_unexpected(&anyhow::Error::new(err));
        format!("{GENERIC_ERROR}: {id}")
    };
    WebsocketMessage::new(outbound::DAEMON_ERROR, vec![text])
}

async fn send<S>(tx: &mut S, message: &WebsocketMessage) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let payload = serde_json::to_string(message).unwrap_or_default();
    tx.send(Message::Text(payload.into())).await
}

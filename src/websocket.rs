//! # Presenter WebSocket
//!
//! The persistent, authenticated connection a presenter drives the broadcast
//! through. Clients connect to `/ws/presenter` with a token and send JSON
//! commands; each command gets exactly one JSON reply.
//!
//! ## Protocol:
//! 1. **Connection**: the token (bearer header or `?token=`) is verified before
//!    the upgrade; a bad token never reaches the actor
//! 2. **Commands**: `{type: "start_stream" | "pause_stream" | "resume_stream" |
//!    "stop_stream" | "reconnect_stream", config?: {title, presenter}}`
//! 3. **Replies**: `{type: "stream_started" | "stream_paused" |
//!    "stream_resumed" | "stream_stopped" | "error", message}`
//! 4. **Liveness**: the server pings every `ping_interval_secs`; a client silent
//!    for `client_timeout_secs` is dropped
//! 5. **Disconnect**: a connection that closes without `stop_stream` pauses the
//!    broadcast instead of ending it, so the same presenter can reconnect
//!
//! Commands from one connection are applied one at a time, in arrival order.

use crate::auth::{authenticate, Identity, Role};
use crate::config::PresenterConfig;
use crate::session::{Command, CoordinatorError, PublicState, SessionCoordinator};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Broadcast metadata supplied with `start_stream`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub title: Option<String>,
    #[serde(alias = "lecturer")]
    pub presenter: Option<String>,
}

/// Commands accepted from a presenter. Anything else is answered with an
/// `error` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenterCommand {
    StartStream {
        #[serde(default)]
        config: Option<StreamConfig>,
    },
    PauseStream,
    ResumeStream,
    StopStream,
    ReconnectStream,
}

impl PresenterCommand {
    fn reply_kind(&self) -> ReplyKind {
        match self {
            PresenterCommand::StartStream { .. } => ReplyKind::StreamStarted,
            PresenterCommand::PauseStream => ReplyKind::StreamPaused,
            PresenterCommand::ResumeStream | PresenterCommand::ReconnectStream => {
                ReplyKind::StreamResumed
            }
            PresenterCommand::StopStream => ReplyKind::StreamStopped,
        }
    }
}

impl From<PresenterCommand> for Command {
    fn from(command: PresenterCommand) -> Self {
        match command {
            PresenterCommand::StartStream { config } => {
                let config = config.unwrap_or_default();
                Command::Start {
                    title: non_empty(config.title),
                    presenter: non_empty(config.presenter),
                }
            }
            PresenterCommand::PauseStream => Command::Pause,
            PresenterCommand::ResumeStream => Command::Resume,
            PresenterCommand::StopStream => Command::Stop,
            PresenterCommand::ReconnectStream => Command::Reconnect,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    StreamStarted,
    StreamPaused,
    StreamResumed,
    StreamStopped,
    Error,
}

/// One server-to-presenter message.
#[derive(Debug, Clone, Serialize)]
pub struct PresenterReply {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<PublicState>,
}

impl PresenterReply {
    fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            message: message.into(),
            code: Some(code),
            state: None,
        }
    }

    fn from_outcome(kind: ReplyKind, outcome: Result<PublicState, CoordinatorError>) -> Self {
        match outcome {
            Ok(state) => Self {
                kind,
                message: success_message(kind, &state),
                code: None,
                state: Some(state),
            },
            Err(e) => Self::error(e.code(), e.to_string()),
        }
    }
}

fn success_message(kind: ReplyKind, state: &PublicState) -> String {
    let title = state.title.as_deref().unwrap_or("untitled broadcast");
    match kind {
        ReplyKind::StreamStarted => format!("You are on air: {}", title),
        ReplyKind::StreamPaused => "Broadcast paused".to_string(),
        ReplyKind::StreamResumed => format!("Back on air: {}", title),
        ReplyKind::StreamStopped => "Broadcast ended".to_string(),
        ReplyKind::Error => String::new(),
    }
}

/// One presenter connection.
pub struct PresenterSocket {
    /// Distinguishes this connection from the same identity's other ones
    id: Uuid,
    identity: Identity,
    coordinator: Arc<SessionCoordinator>,
    last_heartbeat: Instant,
    ping_interval: Duration,
    client_timeout: Duration,
}

impl PresenterSocket {
    pub fn new(
        identity: Identity,
        coordinator: Arc<SessionCoordinator>,
        config: &PresenterConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            coordinator,
            last_heartbeat: Instant::now(),
            ping_interval: config.ping_interval(),
            client_timeout: config.client_timeout(),
        }
    }

    fn send_reply(ctx: &mut ws::WebsocketContext<Self>, reply: &PresenterReply) {
        match serde_json::to_string(reply) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("failed to serialise presenter reply: {}", e),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let command = match serde_json::from_str::<PresenterCommand>(text) {
            Ok(command) => command,
            Err(e) => {
                warn!(connection = %self.id, "rejected presenter message: {}", e);
                Self::send_reply(ctx, &PresenterReply::error("INVALID_MESSAGE", e.to_string()));
                return;
            }
        };

        debug!(connection = %self.id, ?command, "presenter command");
        let kind = command.reply_kind();
        let coordinator = self.coordinator.clone();
        let identity = self.identity.clone();
        let connection = self.id;

        let fut = async move {
            let stream_url = coordinator.stream_url().to_string();
            coordinator
                .execute(&identity, Some(connection), command.into())
                .await
                .map(|session| PublicState::from_session(&session, &stream_url))
        };

        // `wait` holds back further frames until this command is answered.
        ctx.wait(fut.into_actor(self).map(move |outcome, _act, ctx| {
            Self::send_reply(ctx, &PresenterReply::from_outcome(kind, outcome));
        }));
    }
}

impl Actor for PresenterSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection = %self.id, identity = %self.identity.id, "presenter connected");

        ctx.run_interval(self.ping_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(connection = %act.id, "presenter heartbeat timed out, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection = %self.id, identity = %self.identity.id, "presenter disconnected");

        let coordinator = self.coordinator.clone();
        let identity = self.identity.id.clone();
        let connection = self.id;
        tokio::spawn(async move {
            if let Err(e) = coordinator.handle_disconnect(&identity, connection).await {
                error!(%connection, "failed to record presenter disconnect: {}", e);
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PresenterSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                Self::send_reply(
                    ctx,
                    &PresenterReply::error("INVALID_MESSAGE", "binary frames are not supported"),
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection = %self.id, "presenter closed socket: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection = %self.id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection = %self.id, "presenter protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/presenter`: authenticate, then upgrade.
pub async fn presenter_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let identity = authenticate(&req)?;
    identity.require_any(&[Role::Presenter, Role::Admin])?;

    info!(
        identity = %identity.id,
        peer = ?req.connection_info().peer_addr(),
        "presenter connection accepted"
    );
    let actor = PresenterSocket::new(
        identity,
        state.coordinator.clone(),
        &state.get_config().presenter,
    );
    ws::start(actor, &req, stream)
}

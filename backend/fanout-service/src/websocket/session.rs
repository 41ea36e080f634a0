//! WebSocket session actor for live timeline delivery.
//!
//! One actor per admitted socket. Broadcasts from the hub arrive as
//! `PushFrame` messages and are written to the peer; liveness is tracked via
//! ping/pong, and the hub registration is torn down when the actor stops.
//! Reconnection policy (backoff, retry caps) lives entirely in the client.

use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web_actors::ws;
use uuid::Uuid;

use crate::metrics;
use crate::websocket::{PushHub, PushMessage, SubscriberId};

/// How often the server pings the peer.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Close the socket when no pong (or any liveness signal) arrives in time.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serialized frame forwarded from the hub to this socket.
#[derive(ActixMessage)]
#[rtype(result = "()")]
pub struct PushFrame(pub String);

pub struct PushSession {
    user_id: Uuid,
    subscriber_id: SubscriberId,
    hub: PushHub,
    hb: Instant,
}

impl PushSession {
    pub fn new(user_id: Uuid, subscriber_id: SubscriberId, hub: PushHub) -> Self {
        Self {
            user_id,
            subscriber_id,
            hub,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(user_id = %act.user_id, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for PushSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, "WebSocket session started");
        self.hb(ctx);

        if let Ok(frame) = serde_json::to_string(&PushMessage::connected()) {
            ctx.text(frame);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(user_id = %self.user_id, "WebSocket session stopped");
        metrics::record_ws_disconnected();

        let hub = self.hub.clone();
        let user_id = self.user_id;
        let subscriber_id = self.subscriber_id;
        actix::spawn(async move {
            hub.unsubscribe(user_id, subscriber_id).await;
        });
    }
}

impl Handler<PushFrame> for PushSession {
    type Result = ();

    fn handle(&mut self, msg: PushFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PushSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.hb = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                // Any well-formed client frame counts as liveness; the only
                // application-level frame clients send is the keep-alive.
                self.hb = Instant::now();
                match serde_json::from_str::<PushMessage>(&text) {
                    Ok(PushMessage::Ping { .. }) => {
                        if let Ok(frame) = serde_json::to_string(&PushMessage::pong()) {
                            ctx.text(frame);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(user_id = %self.user_id, error = %e, "Unparseable WebSocket frame");
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(user_id = %self.user_id, "Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(user_id = %self.user_id, reason = ?reason, "WebSocket close received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

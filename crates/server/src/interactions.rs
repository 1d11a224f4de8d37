//! `POST /interactions`: the endpoint Discord calls for slash commands.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use tallybot_chat::interactions::{parse_interaction, Inbound, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use tracing::{error, info, warn};

use crate::bootstrap::InteractionIngress;

pub fn router(ingress: InteractionIngress) -> Router {
    Router::new().route("/interactions", post(receive)).with_state(ingress)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn rejection(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

pub async fn receive(
    State(ingress): State<InteractionIngress>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let (Some(signature), Some(timestamp)) =
        (header(&headers, SIGNATURE_HEADER), header(&headers, TIMESTAMP_HEADER))
    else {
        return rejection(StatusCode::UNAUTHORIZED, "missing interaction signature");
    };
    if let Err(error) = ingress.verifier.verify(signature, timestamp, &body) {
        warn!(
            event_name = "ingress.chat.signature_rejected",
            error = %error,
            "rejected unsigned interaction"
        );
        return rejection(StatusCode::UNAUTHORIZED, error.to_string());
    }

    let inbound = match parse_interaction(&body) {
        Ok(inbound) => inbound,
        Err(error) => {
            warn!(
                event_name = "ingress.chat.decode_failed",
                error = %error,
                "interaction payload could not be decoded"
            );
            return rejection(StatusCode::BAD_REQUEST, error.to_string());
        }
    };

    let response = inbound.immediate_response();
    if let Inbound::Command(command) = inbound {
        let correlation_id = command.interaction_id.clone();
        let name = command.payload.command.clone();
        if let Err(error) = ingress.sender.submit(command).await {
            error!(
                event_name = "ingress.chat.queue_closed",
                correlation_id = %correlation_id,
                error = %error,
                "interaction could not be queued"
            );
            return rejection(StatusCode::SERVICE_UNAVAILABLE, error.to_string());
        }
        info!(
            event_name = "ingress.chat.interaction_queued",
            correlation_id = %correlation_id,
            command = %name,
            "interaction deferred and queued"
        );
    }

    (StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::{json, Value};
    use tallybot_chat::commands::CommandReply;
    use tallybot_chat::events::ChatEvent;
    use tallybot_chat::gateway::GatewayTransport;
    use tallybot_chat::interactions::{
        interaction_channel, InteractionResponder, InteractionTransport, InteractionVerifier,
    };
    use tallybot_chat::ChatError;
    use tower::ServiceExt;

    use crate::bootstrap::InteractionIngress;
    use crate::interactions::router;

    struct SilentResponder;

    #[async_trait]
    impl InteractionResponder for SilentResponder {
        async fn deliver(&self, _token: &str, _reply: &CommandReply) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    fn setup() -> (SigningKey, Router, InteractionTransport) {
        let key = SigningKey::from_bytes(&[3_u8; 32]);
        let verifier =
            InteractionVerifier::from_hex(&hex(key.verifying_key().as_bytes())).expect("verifier");
        let (sender, transport) = interaction_channel(4, Arc::new(SilentResponder));
        let app = router(InteractionIngress { verifier: Arc::new(verifier), sender });
        (key, app, transport)
    }

    fn signed(key: &SigningKey, body: &Value) -> Request<Body> {
        let body = body.to_string();
        let timestamp = "1760600000";
        let signature = key.sign(format!("{timestamp}{body}").as_bytes());
        Request::post("/interactions")
            .header("content-type", "application/json")
            .header("x-signature-ed25519", hex(&signature.to_bytes()))
            .header("x-signature-timestamp", timestamp)
            .body(Body::from(body))
            .expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn signed_ping_gets_pong() {
        let (key, app, _transport) = setup();

        let response = app.oneshot(signed(&key, &json!({ "id": "1", "type": 1 }))).await.expect("call");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "type": 1 }));
    }

    #[tokio::test]
    async fn unsigned_or_forged_requests_are_rejected() {
        let (_key, app, _transport) = setup();
        let forger = SigningKey::from_bytes(&[9_u8; 32]);

        let missing = Request::post("/interactions").body(Body::from("{}")).expect("request");
        let response = app.clone().oneshot(missing).await.expect("call");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response =
            app.oneshot(signed(&forger, &json!({ "id": "1", "type": 1 }))).await.expect("call");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn slash_command_is_deferred_and_queued() {
        let (key, app, transport) = setup();
        let body = json!({
            "id": "77",
            "type": 2,
            "token": "tok",
            "channel_id": "100",
            "member": { "user": { "id": "U1" } },
            "data": { "name": "poll-results" }
        });

        let response = app.oneshot(signed(&key, &body)).await.expect("call");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "type": 5 }));
        let envelope = transport.next_envelope().await.expect("queued");
        assert_eq!(envelope.envelope_id, "77");
        assert!(matches!(
            envelope.event,
            ChatEvent::SlashCommand(ref payload) if payload.channel_id == "100"
        ));
    }
}

//! HTTP hooks: channel events in, sweep trigger, pair lifecycle.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use matura_channels::parse_webhook_event;
use matura_core::StoreError;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::PairControl;
use crate::inbound::ReplyListener;

#[derive(Debug)]
pub(crate) struct HookState {
    pub listener: ReplyListener,
    pub control: PairControl,
}

pub(crate) fn router(state: Arc<HookState>) -> Router {
    Router::new()
        .route("/webhook", post(receive_event))
        .route("/sweep", post(trigger_sweep))
        .route("/pairs/:id/:action", post(pair_action))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// Always 200: the channel retries anything else, and an event we cannot
/// use will not become usable on retry.
async fn receive_event(
    State(state): State<Arc<HookState>>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    let Some(event) = parse_webhook_event(&payload) else {
        debug!("webhook payload is not a message event");
        return Json(json!({ "result": "ignored", "reason": "not_a_message" }));
    };
    let outcome = state.listener.on_inbound(&event).await;
    Json(serde_json::to_value(outcome).unwrap_or(Value::Null))
}

async fn trigger_sweep(State(state): State<Arc<HookState>>) -> Result<Json<Value>, StatusCode> {
    match state.control.sweep_once().await {
        Ok(report) => Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null))),
        Err(e) => {
            error!(error = %e, "sweep via webhook failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `start`, `pause` or `stop` a pair through the running supervisor.
async fn pair_action(
    State(state): State<Arc<HookState>>,
    Path((id, action)): Path<(String, String)>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let result = match action.as_str() {
        "start" => state.control.start_pair(&id).await,
        "pause" => state.control.pause_pair(&id).await,
        "stop" => state.control.stop_pair(&id).await,
        _ => return Err((StatusCode::NOT_FOUND, format!("unknown action: {action}"))),
    };
    match result {
        Ok(transition) => Ok(Json(json!({
            "pair_id": id,
            "action": action,
            "result": transition.to_string(),
        }))),
        Err(e) => {
            let status = match e.downcast_ref::<StoreError>() {
                Some(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                Some(StoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            warn!(pair.id = %id, action = %action, error = %e, "pair action failed");
            Err((status, e.to_string()))
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<HookState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webhook server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("webhook server stopped");
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::advance::Advancer;
    use crate::pair_loop::LoopSettings;
    use crate::supervisor::Supervisor;
    use crate::sweep::Sweeper;
    use crate::testkit::Harness;
    use axum::body::Body;
    use axum::http::Request;
    use matura_core::{DriverKind, IdentityResolver, PairStatus, PairStore, ScriptSource};
    use std::time::Duration;
    use tower::ServiceExt;

    fn control(h: &Harness, advancer: &Arc<Advancer>) -> PairControl {
        PairControl::new(
            h.pair_store(),
            Arc::clone(&h.identities) as Arc<dyn IdentityResolver>,
            Arc::clone(&h.scripts) as Arc<dyn ScriptSource>,
        )
        .with_drivers(
            Arc::clone(advancer),
            Arc::new(Sweeper::new(
                Arc::clone(advancer),
                h.config.lease.sweep_ttl(),
            )),
            h.config.lease.loop_ttl(),
        )
    }

    fn app(h: &Harness) -> (Router, Arc<Advancer>) {
        let advancer = h.advancer();
        let state = Arc::new(HookState {
            listener: ReplyListener::new(
                h.pair_store(),
                Arc::clone(&h.identities) as Arc<dyn IdentityResolver>,
                None,
                false,
            ),
            control: control(h, &advancer),
        });
        (router(state), advancer)
    }

    async fn post_json(app: Router, uri: &str, body: &Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn status_of(app: Router, uri: &str) -> StatusCode {
        let request = Request::post(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn webhook_marks_reply() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        let (app, advancer) = app(&h);
        let pair = h.store.pair("p1").unwrap();
        advancer
            .advance(
                &pair,
                DriverKind::Loop,
                "loop:t",
                Duration::from_secs(60),
                &CancellationToken::new(),
            )
            .await;

        let payload = json!({
            "event": "messages.upsert",
            "instance": "chip-b",
            "data": {
                "key": { "remoteJid": "5511900000001@s.whatsapp.net", "fromMe": false },
                "message": { "conversation": "kkkk" },
                "messageTimestamp": 1_700_000_000
            }
        });
        let (status, body) = post_json(app, "/webhook", &payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "matched");
        assert_eq!(body["pair_id"], "p1");
        assert!(!h.store.pair("p1").unwrap().waiting_for_reply);
    }

    #[tokio::test]
    async fn webhook_ignores_other_events() {
        let h = Harness::new();
        let (app, _) = app(&h);
        let payload = json!({ "event": "connection.update", "instance": "chip-a" });
        let (status, body) = post_json(app, "/webhook", &payload).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "ignored");
    }

    #[tokio::test]
    async fn sweep_endpoint_returns_report() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        let (app, _) = app(&h);

        let (status, body) = post_json(app, "/sweep", &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 1);
        assert_eq!(body["succeeded"], 1);
        assert_eq!(body["entries"][0]["pair_id"], "p1");
        assert_eq!(h.store.pair("p1").unwrap().turn_counter, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pair_actions_drive_the_supervisor() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        h.store.set_status("p1", PairStatus::Stopped).await.unwrap();
        let advancer = h.advancer();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&advancer),
            LoopSettings::from_config(&h.config),
            CancellationToken::new(),
        ));
        let state = Arc::new(HookState {
            listener: ReplyListener::new(
                h.pair_store(),
                Arc::clone(&h.identities) as Arc<dyn IdentityResolver>,
                Some(Arc::clone(&supervisor)),
                false,
            ),
            control: control(&h, &advancer).with_supervisor(Arc::clone(&supervisor)),
        });
        let app = router(state);

        let (status, body) = post_json(app.clone(), "/pairs/p1/start", &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "changed");
        assert!(supervisor.is_running("p1"));

        let (status, body) = post_json(app.clone(), "/pairs/p1/pause", &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "changed");
        assert!(!supervisor.is_running("p1"));
        assert_eq!(h.store.pair("p1").unwrap().status, PairStatus::Paused);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn pair_action_errors_map_to_status_codes() {
        let h = Harness::new();
        h.store.insert_running("p1", "alice", "bob", 0);
        h.store.set_status("p1", PairStatus::Paused).await.unwrap();
        let (app, _) = app(&h);

        assert_eq!(status_of(app.clone(), "/pairs/nope/start").await, StatusCode::NOT_FOUND);
        assert_eq!(status_of(app.clone(), "/pairs/p1/explode").await, StatusCode::NOT_FOUND);
        // paused -> stopped is not an allowed edge.
        assert_eq!(status_of(app, "/pairs/p1/stop").await, StatusCode::CONFLICT);
    }
}

//! Out-of-process plugins reached over HTTP.
//!
//! For each invocation the plugin receives
//!
//! ```json
//! { "point": "llm_call_before", "data": { ... }, "context": { ... } }
//! ```
//!
//! and answers with the replacement payload. An empty body or a JSON
//! `null` means "no change".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::dispatcher::{HookCallback, HookRegistration};
use crate::{HookContext, HookError, HookPoint};

pub struct HttpHookCallback {
    url: String,
    client: reqwest::Client,
}

impl HttpHookCallback {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl HookCallback for HttpHookCallback {
    async fn call(&self, data: Value, ctx: HookContext) -> Result<Option<Value>, HookError> {
        let body = json!({
            "point": ctx.point,
            "data": data,
            "context": ctx.info(),
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HookError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HookError::Http(format!("{} returned {status}", self.url)));
        }
        let text = response
            .text()
            .await
            .map_err(|e| HookError::Http(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| HookError::Http(format!("invalid JSON from {}: {e}", self.url)))?;
        debug!(url = %self.url, changed = !value.is_null(), "HTTP hook answered");
        Ok((!value.is_null()).then_some(value))
    }
}

/// Registration body for an HTTP plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHookRegistration {
    pub strategy_id: String,
    #[serde(default)]
    pub order: i32,
    pub url: String,
    pub points: Vec<HookPoint>,
}

impl HttpHookRegistration {
    /// One shared callback answering every listed point.
    pub fn into_registration(self, client: reqwest::Client) -> HookRegistration {
        let callback: Arc<dyn HookCallback> = Arc::new(HttpHookCallback::new(self.url, client));
        self.points.into_iter().fold(
            HookRegistration::new(self.strategy_id, self.order),
            |registration, point| registration.on(point, callback.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HookDispatcher;
    use axum::{Json, Router, routing::post};
    use loomweave_core::View;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn plugin_replaces_payload() {
        let router = Router::new().route(
            "/hook",
            post(|Json(body): Json<Value>| async move {
                let text = body["data"]["text"].as_str().unwrap_or_default().to_uppercase();
                Json(json!({"text": text, "point": body["point"]}))
            }),
        );
        let base = serve(router).await;

        let dispatcher = HookDispatcher::default();
        let registration = HttpHookRegistration {
            strategy_id: "upper".into(),
            order: 0,
            url: format!("{base}/hook"),
            points: vec![HookPoint::SaveResponseBefore],
        };
        dispatcher
            .register(registration.into_registration(reqwest::Client::new()))
            .await
            .unwrap();

        let ctx = HookContext::new(None, View::Model, false);
        let out = dispatcher
            .dispatch(HookPoint::SaveResponseBefore, json!({"text": "hi"}), &ctx)
            .await;
        assert_eq!(out, json!({"text": "HI", "point": "save_response_before"}));
    }

    #[tokio::test]
    async fn null_and_empty_bodies_mean_unchanged() {
        let router = Router::new()
            .route("/null", post(|| async { Json(Value::Null) }))
            .route("/empty", post(|| async { "" }));
        let base = serve(router).await;
        let ctx = HookContext::new(None, View::Model, false)
            .for_callback(HookPoint::LlmCallBefore, "p");

        for path in ["null", "empty"] {
            let callback = HttpHookCallback::new(format!("{base}/{path}"), reqwest::Client::new());
            let out = callback.call(json!({"x": 1}), ctx.clone()).await.unwrap();
            assert_eq!(out, None, "{path}");
        }
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let router = Router::new().route(
            "/fail",
            post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
        );
        let base = serve(router).await;
        let callback = HttpHookCallback::new(format!("{base}/fail"), reqwest::Client::new());
        let ctx = HookContext::new(None, View::User, false);
        assert!(matches!(
            callback.call(json!(null), ctx).await,
            Err(HookError::Http(_))
        ));
    }
}

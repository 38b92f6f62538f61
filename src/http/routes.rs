use std::error::Error as _;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use super::{AppState, SAS_TOKEN_HEADER};
use crate::cache::ConnectionFactory;
use crate::error::{ConnectionError, GatewayError};

#[derive(Debug)]
pub enum ApiError {
    MissingDeviceId,
    SharedAccessDisabled,
    Gateway(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Connection(ConnectionError::MissingDeviceId) => ApiError::MissingDeviceId,
            other => ApiError::Gateway(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::MissingDeviceId => (StatusCode::BAD_REQUEST, "Missing deviceId".to_owned()),
            ApiError::SharedAccessDisabled => (
                StatusCode::BAD_REQUEST,
                "Shared access is not enabled".to_owned(),
            ),
            ApiError::Gateway(e) => (StatusCode::INTERNAL_SERVER_ERROR, error_chain(&e)),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn error_chain(e: &GatewayError) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<String>,
}

/// The request's device token, or `None` for an allowed account-scoped request.
fn credential<'a, F: ConnectionFactory>(
    state: &AppState<F>,
    device_id: &str,
    headers: &'a HeaderMap,
) -> Result<Option<&'a str>, ApiError> {
    if device_id.trim().is_empty() {
        return Err(ApiError::MissingDeviceId);
    }

    let token = headers
        .get(SAS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty());

    if token.is_none() && !state.shared_access_enabled {
        warn!(device_id = %device_id, "Refused request without device token");
        return Err(ApiError::SharedAccessDisabled);
    }
    Ok(token)
}

pub(super) async fn send_event<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let token = credential(&state, &device_id, &headers)?;

    let body = Bytes::from(payload.to_string());
    state.gateway.send_event(&device_id, body, token).await?;
    Ok(StatusCode::OK)
}

pub(super) async fn update_reported_properties<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let token = credential(&state, &device_id, &headers)?;

    state
        .gateway
        .update_reported_properties(&device_id, payload.to_string(), token)
        .await?;
    Ok(StatusCode::OK)
}

pub(super) async fn get_twin<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = credential(&state, &device_id, &headers)?;

    let twin = state.gateway.get_twin(&device_id, token).await?;
    Ok(([(header::CONTENT_TYPE, "application/json")], twin).into_response())
}

pub(super) async fn list_devices<F: ConnectionFactory>(
    State(state): State<AppState<F>>,
) -> Json<DevicesResponse> {
    Json(DevicesResponse {
        devices: state.gateway.registered_devices().into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::MockFactory;
    use crate::cache::{CacheSettings, DeviceConnectionCache};
    use crate::clock::ManualClock;
    use crate::gateway::Gateway;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;

    fn state(factory: MockFactory, shared_access_enabled: bool) -> AppState<MockFactory> {
        let clock = Arc::new(ManualClock::at_unix(1_699_990_000));
        let settings = CacheSettings {
            default_lifetime: Duration::from_secs(30 * 60),
            open_timeout: Duration::from_secs(1),
        };
        let cache = DeviceConnectionCache::with_clock(factory, settings, clock);
        AppState {
            gateway: Arc::new(Gateway::new(cache)),
            shared_access_enabled,
        }
    }

    fn with_token(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SAS_TOKEN_HEADER, HeaderValue::from_str(token).unwrap());
        headers
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_send_event_with_token() {
        let state = state(MockFactory::new(), false);

        let status = send_event(
            State(state.clone()),
            Path("dev1".into()),
            with_token("sr=x&se=1700000000"),
            Json(json!({ "temp": 21 })),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        let handle = state
            .gateway
            .cache()
            .resolve("dev1", None, None)
            .await
            .unwrap();
        let events = handle.events.lock().unwrap();
        let sent: Value = serde_json::from_slice(&events[0]).unwrap();
        assert_eq!(sent, json!({ "temp": 21 }));
    }

    #[tokio::test]
    async fn test_missing_token_without_shared_access() {
        let state = state(MockFactory::new(), false);

        let response = send_event(
            State(state.clone()),
            Path("dev1".into()),
            HeaderMap::new(),
            Json(json!({})),
        )
        .await
        .unwrap_err()
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Shared access is not enabled" })
        );
        assert_eq!(state.gateway.cache().factory().opens(), 0);
    }

    #[tokio::test]
    async fn test_shared_access_request() {
        let state = state(MockFactory::new(), true);

        let status = update_reported_properties(
            State(state.clone()),
            Path("dev1".into()),
            HeaderMap::new(),
            Json(json!({ "fw": "1.2" })),
        )
        .await
        .unwrap();

        assert_eq!(status, StatusCode::OK);
        let handle = state
            .gateway
            .cache()
            .resolve("dev1", None, None)
            .await
            .unwrap();
        assert_eq!(
            handle.properties.lock().unwrap().as_slice(),
            &[r#"{"fw":"1.2"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_device_id() {
        let state = state(MockFactory::new(), true);

        let response = get_twin(State(state), Path(" ".into()), HeaderMap::new())
            .await
            .unwrap_err()
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({ "error": "Missing deviceId" }));
    }

    #[tokio::test]
    async fn test_get_twin() {
        let state = state(MockFactory::new(), false);

        let response = get_twin(State(state), Path("dev1".into()), with_token("token"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            body_json(response).await,
            json!({ "deviceId": "dev1", "version": 1 })
        );
    }

    #[tokio::test]
    async fn test_connection_failure_is_server_error() {
        let factory = MockFactory::new();
        factory.fail_next(1);
        let state = state(factory, false);

        let response = send_event(
            State(state),
            Path("dev1".into()),
            with_token("token"),
            Json(json!({})),
        )
        .await
        .unwrap_err()
        .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        let message = body["error"].as_str().unwrap();
        assert!(message.contains("dev1"));
        assert!(message.contains("refused"));
    }

    #[tokio::test]
    async fn test_list_devices_sorted() {
        let state = state(MockFactory::new(), true);
        for device_id in ["pump-2", "pump-1"] {
            state.gateway.get_twin(device_id, None).await.unwrap();
        }

        let Json(response) = list_devices(State(state)).await;
        assert_eq!(response.devices, vec!["pump-1", "pump-2"]);
    }
}

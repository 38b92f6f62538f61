//! REST front end for the gateway.
//!
//! | route | |
//! |---|---|
//! | `POST /gateway/{device_id}` | send a device-to-cloud message (JSON body) |
//! | `POST /gateway/{device_id}/properties` | update reported properties (JSON body) |
//! | `GET /gateway/{device_id}/twin` | read the device twin |
//! | `GET /admin/devices` | devices with an open connection |
//!
//! A device token is passed in the `sas_token` header. Without one the request
//! is account-scoped, which is refused unless shared access is enabled.

mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;

use crate::cache::ConnectionFactory;
use crate::gateway::Gateway;

pub use routes::{ApiError, DevicesResponse};

pub const SAS_TOKEN_HEADER: &str = "sas_token";

pub struct AppState<F: ConnectionFactory> {
    pub gateway: Arc<Gateway<F>>,
    pub shared_access_enabled: bool,
}

impl<F: ConnectionFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            shared_access_enabled: self.shared_access_enabled,
        }
    }
}

pub fn router<F: ConnectionFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/gateway/{device_id}", post(routes::send_event::<F>))
        .route(
            "/gateway/{device_id}/properties",
            post(routes::update_reported_properties::<F>),
        )
        .route("/gateway/{device_id}/twin", get(routes::get_twin::<F>))
        .route("/admin/devices", get(routes::list_devices::<F>))
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` resolves.
pub async fn serve<F, S>(listener: TcpListener, state: AppState<F>, shutdown: S) -> std::io::Result<()>
where
    F: ConnectionFactory,
    S: Future<Output = ()> + Send + 'static,
{
    info!(
        addr = ?listener.local_addr().ok(),
        shared_access = state.shared_access_enabled,
        "HTTP gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

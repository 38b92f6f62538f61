//! Device connections backed by relay device links.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use devicelink::{
    DeviceLink, LinkCredential, LinkError, LinkOpError, LinkPool, MethodHandler, MethodRequest,
    MethodResponse,
};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::auth::Credential;
use crate::cache::{ConnectionFactory, DeviceConnection};
use crate::config::AccessPolicy;
use crate::error::HandleError;

const EVENT_CONTENT_TYPE: &str = "application/json";
const EVENT_CONTENT_ENCODING: &str = "utf-8";

/// Status returned for cloud-to-device methods nobody handles.
pub const METHOD_NOT_IMPLEMENTED: i32 = 501;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkFactoryError {
    #[error("account-scoped access requested but no access policy is configured")]
    NoAccessPolicy,

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Opens [`DeviceLink`]s from a bounded [`LinkPool`].
pub struct LinkFactory {
    pool: LinkPool,
    access_policy: Option<AccessPolicy>,
}

impl LinkFactory {
    pub fn new(pool: LinkPool, access_policy: Option<AccessPolicy>) -> Self {
        Self {
            pool,
            access_policy,
        }
    }

    pub fn pool(&self) -> &LinkPool {
        &self.pool
    }

    fn link_credential(&self, credential: &Credential) -> Result<LinkCredential, LinkFactoryError> {
        match credential {
            Credential::Token(token) => Ok(LinkCredential::Token(token.clone())),
            Credential::Account => {
                let policy = self
                    .access_policy
                    .as_ref()
                    .ok_or(LinkFactoryError::NoAccessPolicy)?;
                Ok(LinkCredential::AccessPolicy {
                    name: policy.name.clone(),
                    key: policy.key.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for LinkFactory {
    type Connection = DeviceLink;
    type Error = LinkFactoryError;

    async fn open(
        &self,
        device_id: &str,
        credential: &Credential,
    ) -> Result<DeviceLink, LinkFactoryError> {
        let credential = self.link_credential(credential)?;
        Ok(self.pool.open(device_id, &credential).await?)
    }
}

#[async_trait]
impl DeviceConnection for DeviceLink {
    async fn send_event(&self, payload: Bytes) -> Result<(), HandleError> {
        DeviceLink::send_event(self, &payload, EVENT_CONTENT_TYPE, EVENT_CONTENT_ENCODING)
            .await
            .map(|_| ())
            .map_err(handle_error)
    }

    async fn update_reported_properties(&self, properties: String) -> Result<(), HandleError> {
        DeviceLink::update_reported_properties(self, &properties)
            .await
            .map_err(handle_error)
    }

    async fn twin(&self) -> Result<String, HandleError> {
        DeviceLink::twin(self)
            .await
            .map(|doc| doc.json)
            .map_err(handle_error)
    }

    async fn close(&self) -> Result<(), HandleError> {
        DeviceLink::close(self).await;
        Ok(())
    }
}

/// Answers every direct method with [`METHOD_NOT_IMPLEMENTED`].
pub fn unhandled_method_handler() -> MethodHandler {
    Arc::new(|device_id: &str, request: MethodRequest| {
        info!(
            device_id = %device_id,
            method = %request.method_name,
            "Direct method received"
        );
        MethodResponse {
            request_id: request.request_id,
            status: METHOD_NOT_IMPLEMENTED,
            payload_json: json!({
                "error": format!("method '{}' is not implemented", request.method_name)
            })
            .to_string(),
        }
    })
}

fn handle_error(e: LinkOpError) -> HandleError {
    match e {
        LinkOpError::Closed => HandleError::ConnectionLost(e.to_string()),
        LinkOpError::TwinUnavailable(timeout) => HandleError::Timeout(timeout),
        other => HandleError::Rejected(other.to_string()),
    }
}

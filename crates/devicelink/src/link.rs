use futures::{Stream, StreamExt};
use moq_lite::{BroadcastConsumer, BroadcastProducer, OriginConsumer, OriginProducer, Session, Track};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LinkConfig, LinkCredential};
use crate::connection::{LinkInbound, LinkOutbound};
use crate::error::{LinkError, LinkOpError};
use crate::messages::{
    DeviceEvent, MethodRequest, MethodResponse, ReportedProperties, TwinDocument, now_ms,
};
use crate::relay::{RelaySession, connect_relay};

/// Answers cloud-to-device method calls for a device.
///
/// Receives the device id and the request; the returned response's
/// `request_id` is overwritten with the request's.
pub type MethodHandler = Arc<dyn Fn(&str, MethodRequest) -> MethodResponse + Send + Sync>;

type DecodedStream<M> = Pin<Box<dyn Stream<Item = Result<M, LinkOpError>> + Send>>;

/// One authenticated relay session for one device identity.
///
/// Publishes device events and reported properties, and keeps the latest
/// twin document pushed by the cloud. Owns a pool permit until closed.
pub struct DeviceLink {
    device_id: String,
    link_id: Uuid,
    config: Arc<LinkConfig>,
    state: Mutex<Option<LinkState>>,
    twin: watch::Receiver<Option<TwinDocument>>,
    listener: JoinHandle<()>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("device_id", &self.device_id)
            .field("link_id", &self.link_id)
            .finish_non_exhaustive()
    }
}

// Everything that must be dropped to tear the session down.
struct LinkState {
    _session: Session,
    _origin: OriginProducer,
    _broadcast: BroadcastProducer,
    events: LinkOutbound,
    properties: LinkOutbound,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLink {
    pub(crate) async fn connect(
        config: Arc<LinkConfig>,
        device_id: &str,
        credential: &LinkCredential,
        permit: OwnedSemaphorePermit,
        methods: Option<MethodHandler>,
    ) -> Result<Self, LinkError> {
        let url = config.relay_url_for(device_id, credential)?;
        let RelaySession {
            session,
            producer,
            consumer,
        } = connect_relay(url).await?;

        let device_path = config.device_path(device_id).to_string();
        let mut broadcast = producer.create_broadcast(&device_path).ok_or_else(|| {
            LinkError::BroadcastCreate(format!(
                "failed to create device broadcast at '{device_path}'"
            ))
        })?;

        let events = LinkOutbound::new(broadcast.create_track(Track::new(&config.events_track)));
        let properties =
            LinkOutbound::new(broadcast.create_track(Track::new(&config.properties_track)));

        let responder = match methods {
            Some(handler) if config.methods_enabled => Some(MethodResponder {
                outbound: LinkOutbound::new(
                    broadcast.create_track(Track::new(&config.method_responses_track)),
                ),
                handler,
            }),
            _ => None,
        };

        let cloud_root = format!("{}/", config.cloud_prefix);
        let announcements = consumer.with_root(&cloud_root).ok_or_else(|| {
            LinkError::Unauthorized(format!("prefix '{cloud_root}' not authorized"))
        })?;

        let (twin_tx, twin_rx) = watch::channel(None);
        let listener = CloudListener {
            device_id: device_id.to_owned(),
            config: Arc::clone(&config),
            twin: twin_tx,
            responder,
        };
        let listener = tokio::spawn(listener.run(announcements));

        let link_id = Uuid::new_v4();
        info!(
            device_id = %device_id,
            link_id = %link_id,
            path = %device_path,
            "Device link established"
        );

        Ok(Self {
            device_id: device_id.to_owned(),
            link_id,
            config,
            state: Mutex::new(Some(LinkState {
                _session: session,
                _origin: producer,
                _broadcast: broadcast,
                events,
                properties,
                _permit: permit,
            })),
            twin: twin_rx,
            listener,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn link_id(&self) -> Uuid {
        self.link_id
    }

    /// Publish a device-to-cloud message. Returns the generated message id.
    pub async fn send_event(
        &self,
        body: &[u8],
        content_type: &str,
        content_encoding: &str,
    ) -> Result<String, LinkOpError> {
        let event = DeviceEvent {
            message_id: Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            body: body.to_vec(),
            content_type: content_type.to_owned(),
            content_encoding: content_encoding.to_owned(),
            timestamp_ms: now_ms(),
        };

        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(LinkOpError::Closed)?;
        state.events.send(&event)?;

        debug!(
            device_id = %self.device_id,
            message_id = %event.message_id,
            bytes = event.body.len(),
            "Event published"
        );
        Ok(event.message_id)
    }

    /// Publish a reported-properties patch.
    pub async fn update_reported_properties(&self, json: &str) -> Result<(), LinkOpError> {
        let patch = ReportedProperties {
            device_id: self.device_id.clone(),
            json: json.to_owned(),
            timestamp_ms: now_ms(),
        };

        let mut state = self.state.lock().await;
        let state = state.as_mut().ok_or(LinkOpError::Closed)?;
        state.properties.send(&patch)?;
        Ok(())
    }

    /// The latest twin pushed by the cloud, waiting up to the operation timeout for a first one.
    pub async fn twin(&self) -> Result<TwinDocument, LinkOpError> {
        if self.is_closed().await {
            return Err(LinkOpError::Closed);
        }

        let timeout = self.config.operation_timeout;
        let mut twin = self.twin.clone();
        match tokio::time::timeout(timeout, twin.wait_for(Option::is_some)).await {
            Ok(Ok(doc)) => (*doc).clone().ok_or(LinkOpError::Closed),
            // The listener stopped before any twin arrived.
            Ok(Err(_)) => Err(LinkOpError::Closed),
            Err(_) => Err(LinkOpError::TwinUnavailable(timeout)),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.is_none()
    }

    /// Tear down the session and release the pool permit. Idempotent.
    pub async fn close(&self) {
        let state = self.state.lock().await.take();
        self.listener.abort();
        if state.is_some() {
            info!(device_id = %self.device_id, link_id = %self.link_id, "Device link closed");
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct MethodResponder {
    outbound: LinkOutbound,
    handler: MethodHandler,
}

/// Follows the cloud broadcast for one device: twin updates and method calls.
struct CloudListener {
    device_id: String,
    config: Arc<LinkConfig>,
    twin: watch::Sender<Option<TwinDocument>>,
    responder: Option<MethodResponder>,
}

impl CloudListener {
    async fn run(mut self, mut announcements: OriginConsumer) {
        loop {
            match announcements.announced().await {
                Some((path, Some(broadcast))) if path.to_string() == self.device_id => {
                    debug!(device_id = %self.device_id, "Cloud broadcast announced");
                    self.serve(broadcast).await;
                }
                Some((path, None)) if path.to_string() == self.device_id => {
                    debug!(device_id = %self.device_id, "Cloud broadcast departed");
                }
                Some(_) => {}
                None => {
                    debug!(device_id = %self.device_id, "Announcement stream closed");
                    break;
                }
            }
        }
    }

    async fn serve(&mut self, broadcast: BroadcastConsumer) {
        let mut twins: DecodedStream<TwinDocument> =
            Box::pin(LinkInbound::new(&broadcast, &self.config.twin_track).decoded());
        let mut methods: Option<DecodedStream<MethodRequest>> = self.responder.as_ref().map(|_| {
            Box::pin(LinkInbound::new(&broadcast, &self.config.methods_track).decoded())
                as DecodedStream<MethodRequest>
        });

        loop {
            tokio::select! {
                twin = twins.next() => match twin {
                    Some(Ok(doc)) => {
                        debug!(device_id = %self.device_id, version = doc.version, "Twin updated");
                        self.twin.send_replace(Some(doc));
                    }
                    Some(Err(e)) => {
                        warn!(device_id = %self.device_id, error = %e, "Dropping twin frame");
                    }
                    None => {
                        debug!(device_id = %self.device_id, "Twin track closed");
                        break;
                    }
                },
                request = next_or_pending(&mut methods) => match request {
                    Some(Ok(request)) => self.respond(request),
                    Some(Err(e)) => {
                        warn!(device_id = %self.device_id, error = %e, "Dropping method frame");
                    }
                    None => methods = None,
                },
            }
        }
    }

    fn respond(&mut self, request: MethodRequest) {
        let Some(responder) = self.responder.as_mut() else {
            return;
        };

        let request_id = request.request_id.clone();
        let method_name = request.method_name.clone();
        let mut response = (responder.handler)(&self.device_id, request);
        response.request_id = request_id;

        match responder.outbound.send(&response) {
            Ok(()) => info!(
                device_id = %self.device_id,
                method = %method_name,
                status = response.status,
                "Method call answered"
            ),
            Err(e) => warn!(
                device_id = %self.device_id,
                method = %method_name,
                error = %e,
                "Failed to publish method response"
            ),
        }
    }
}

async fn next_or_pending<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

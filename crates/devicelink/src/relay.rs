use moq_lite::{Client, Origin, OriginConsumer, OriginProducer, Session};
use url::Url;
use web_transport_quinn::ClientBuilder;

use crate::error::LinkError;

/// A live relay session with its publish and consume origins.
///
/// Dropping it closes the session.
pub struct RelaySession {
    pub session: Session,
    pub producer: OriginProducer,
    pub consumer: OriginConsumer,
}

/// Connect to the relay as a publisher + subscriber (bidirectional).
pub async fn connect_relay(relay_url: Url) -> Result<RelaySession, LinkError> {
    let pub_origin = Origin::produce();
    let sub_origin = Origin::produce();

    let wt_client = ClientBuilder::new()
        .dangerous()
        .with_no_certificate_verification()
        .map_err(|e| LinkError::Connect(e.to_string()))?;
    let wt_session = wt_client
        .connect(relay_url)
        .await
        .map_err(|e| LinkError::Connect(e.to_string()))?;

    let client = Client::new()
        .with_publish(pub_origin.consumer)
        .with_consume(sub_origin.producer);
    let session = client
        .connect(wt_session)
        .await
        .map_err(|e| LinkError::Session(e.to_string()))?;

    Ok(RelaySession {
        session,
        producer: pub_origin.producer,
        consumer: sub_origin.consumer,
    })
}

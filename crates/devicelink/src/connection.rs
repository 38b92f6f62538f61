use async_stream::stream;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use moq_lite::{BroadcastConsumer, Track, TrackProducer};
use prost::Message;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{LinkOpError, LinkWireError};

/// Frames arriving on one track of a broadcast, oldest group first.
///
/// A failed group is reported once and skipped; a failed track ends the stream.
pub struct LinkInbound {
    frames: BoxStream<'static, Result<Bytes, LinkWireError>>,
}

impl LinkInbound {
    pub fn new(broadcast: &BroadcastConsumer, track_name: &str) -> Self {
        let mut track = broadcast.subscribe_track(&Track::new(track_name));

        let frames = stream! {
            loop {
                let mut group = match track.next_group().await {
                    Ok(Some(group)) => group,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(LinkWireError::from(e));
                        break;
                    }
                };

                loop {
                    match group.read_frame().await {
                        Ok(Some(frame)) => yield Ok(frame),
                        Ok(None) => break,
                        Err(e) => {
                            yield Err(LinkWireError::from(e));
                            break;
                        }
                    }
                }
            }
        };

        Self {
            frames: frames.boxed(),
        }
    }

    /// Decode every frame as `M`. Wire errors surface as [`LinkOpError::Closed`].
    pub fn decoded<M>(self) -> impl Stream<Item = Result<M, LinkOpError>> + Send
    where
        M: Message + Default + 'static,
    {
        self.map(|frame| match frame {
            Ok(bytes) => M::decode(bytes).map_err(LinkOpError::from),
            Err(_) => Err(LinkOpError::Closed),
        })
    }
}

impl Stream for LinkInbound {
    type Item = Result<Bytes, LinkWireError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx)
    }
}

/// Publishes protobuf messages on a track, one frame per message.
pub struct LinkOutbound {
    track: TrackProducer,
}

impl LinkOutbound {
    pub fn new(track: TrackProducer) -> Self {
        Self { track }
    }

    pub fn send<M: Message>(&mut self, msg: &M) -> Result<(), LinkOpError> {
        let mut frame = Vec::with_capacity(msg.encoded_len());
        msg.encode(&mut frame)?;
        self.track.write_frame(Bytes::from(frame));
        Ok(())
    }
}

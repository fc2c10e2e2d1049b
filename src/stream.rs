//! Observation of the JSON-RPC message stream.
//!
//! Subscribers receive a copy of every frame flowing through a connection,
//! in both directions, without interfering with dispatch. Used for
//! debugging, logging, and tests that assert on emitted notifications.

use std::sync::Arc;

use anyhow::Result;
use serde_json::value::RawValue;

use crate::Error;

/// A message that flowed through the connection, tagged with its
/// direction relative to this side.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub direction: StreamMessageDirection,
    pub message: StreamMessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMessageDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone)]
pub enum StreamMessageContent {
    Request {
        id: i64,
        method: Arc<str>,
        params: Option<serde_json::Value>,
    },
    Response {
        id: i64,
        result: Result<Option<serde_json::Value>, Error>,
    },
    Notification {
        method: Arc<str>,
        params: Option<serde_json::Value>,
    },
}

/// A receiver for observing the message stream.
pub struct StreamReceiver(async_broadcast::Receiver<StreamMessage>);

impl StreamReceiver {
    /// Waits for the next message, failing once the connection is gone.
    pub async fn recv(&mut self) -> Result<StreamMessage> {
        Ok(self.0.recv().await?)
    }
}

pub(crate) struct StreamSender(async_broadcast::Sender<StreamMessage>);

impl StreamSender {
    pub(crate) fn outgoing_request(
        &self,
        id: i64,
        method: impl Into<Arc<str>>,
        params: Option<&serde_json::Value>,
    ) {
        self.send(StreamMessageDirection::Outgoing, StreamMessageContent::Request {
            id,
            method: method.into(),
            params: params.cloned(),
        });
    }

    pub(crate) fn outgoing_response(
        &self,
        id: i64,
        result: Result<Option<serde_json::Value>, Error>,
    ) {
        self.send(
            StreamMessageDirection::Outgoing,
            StreamMessageContent::Response { id, result },
        );
    }

    pub(crate) fn outgoing_notification(
        &self,
        method: impl Into<Arc<str>>,
        params: Option<&serde_json::Value>,
    ) {
        self.send(
            StreamMessageDirection::Outgoing,
            StreamMessageContent::Notification {
                method: method.into(),
                params: params.cloned(),
            },
        );
    }

    pub(crate) fn incoming_request(
        &self,
        id: i64,
        method: impl Into<Arc<str>>,
        params: Option<&serde_json::Value>,
    ) {
        self.send(StreamMessageDirection::Incoming, StreamMessageContent::Request {
            id,
            method: method.into(),
            params: params.cloned(),
        });
    }

    pub(crate) fn incoming_response(&self, id: i64, result: Result<Option<&RawValue>, &Error>) {
        let result = match result {
            Ok(Some(value)) => Ok(serde_json::from_str(value.get()).ok()),
            Ok(None) => Ok(None),
            Err(err) => Err(err.clone()),
        };
        self.send(
            StreamMessageDirection::Incoming,
            StreamMessageContent::Response { id, result },
        );
    }

    pub(crate) fn incoming_notification(
        &self,
        method: impl Into<Arc<str>>,
        params: Option<&serde_json::Value>,
    ) {
        self.send(
            StreamMessageDirection::Incoming,
            StreamMessageContent::Notification {
                method: method.into(),
                params: params.cloned(),
            },
        );
    }

    fn send(&self, direction: StreamMessageDirection, message: StreamMessageContent) {
        if self.0.receiver_count() == 0 {
            return;
        }
        self.0
            .try_broadcast(StreamMessage { direction, message })
            .ok();
    }
}

/// A broadcast for observing RPC message streams.
pub(crate) struct StreamBroadcast {
    receiver: async_broadcast::InactiveReceiver<StreamMessage>,
}

impl StreamBroadcast {
    pub(crate) fn new() -> (StreamSender, Self) {
        let (sender, receiver) = async_broadcast::broadcast(1);
        (
            StreamSender(sender),
            Self {
                receiver: receiver.deactivate(),
            },
        )
    }

    pub(crate) fn receiver(&self) -> StreamReceiver {
        let was_empty = self.receiver.receiver_count() == 0;
        let mut new_receiver = self.receiver.activate_cloned();
        if was_empty {
            // Grow capacity once we actually have a receiver
            new_receiver.set_capacity(256);
        }
        StreamReceiver(new_receiver)
    }
}

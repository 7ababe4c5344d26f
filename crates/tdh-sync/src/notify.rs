//! Fan-out of change events to independent publish channels.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tdh_core::NotifierResponse;
use tdh_storage::{FetchError, HttpClient};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use crate::config::ChannelConfig;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("channel {channel} timed out after {timeout_ms} ms")]
    Timeout { channel: String, timeout_ms: u64 },
    #[error("channel {channel} rejected push with status {status}")]
    Rejected { channel: String, status: u16 },
    #[error("channel {channel} unreachable: {message}")]
    Transport {
        channel: String,
        status: u16,
        message: String,
    },
    #[error("channel {0} is not configured")]
    UnknownChannel(String),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::Timeout { .. } => 504,
            DispatchError::Rejected { status, .. } | DispatchError::Transport { status, .. } => *status,
            DispatchError::UnknownChannel(_) => 404,
        }
    }
}

/// What a record mutation asks the dispatcher to announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub record_id: String,
    pub record_type: String,
    pub channels: BTreeSet<String>,
    pub image_changed: bool,
    pub is_delete: bool,
}

/// Body handed to every channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub origin: String,
    pub imageschanged: bool,
    pub isdelete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAck {
    pub status: u16,
    pub echoed_id: Option<String>,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn push(&self, message: &PushMessage) -> Result<PushAck, DispatchError>;
}

/// POSTs the push message as JSON; any 2xx counts as delivered.
pub struct HttpPushChannel {
    name: String,
    url: String,
    http: Arc<HttpClient>,
}

impl HttpPushChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>, http: Arc<HttpClient>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            http,
        }
    }
}

fn echoed_id(body: &[u8]) -> Option<String> {
    let value: JsonValue = serde_json::from_slice(body).ok()?;
    ["id", "notificationId", "Id"]
        .iter()
        .find_map(|key| match value.get(*key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

#[async_trait]
impl NotificationChannel for HttpPushChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &PushMessage) -> Result<PushAck, DispatchError> {
        match self.http.post_json(&self.name, &self.url, message).await {
            Ok(resp) => Ok(PushAck {
                status: resp.status.as_u16(),
                echoed_id: echoed_id(&resp.body),
            }),
            Err(FetchError::HttpStatus { status, .. }) => Err(DispatchError::Rejected {
                channel: self.name.clone(),
                status,
            }),
            Err(err) => Err(DispatchError::Transport {
                channel: self.name.clone(),
                status: err.status_code(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<dyn NotificationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP channels for every enabled entry of `channels.yaml`.
    pub fn from_configs(configs: &[ChannelConfig], http: Arc<HttpClient>) -> Self {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            registry.register(Arc::new(HttpPushChannel::new(
                config.name.clone(),
                config.url.clone(),
                http.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NotificationChannel>> {
        self.channels.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

pub struct NotificationDispatcher {
    registry: Arc<ChannelRegistry>,
    origin: String,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(registry: Arc<ChannelRegistry>, origin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            registry,
            origin: origin.into(),
            timeout,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Pushes to every requested channel that is configured, concurrently.
    /// Channels outside the registry are skipped.
    pub async fn dispatch(&self, request: &DispatchRequest) -> BTreeMap<String, NotifierResponse> {
        let message = self.message_for(
            &request.record_id,
            &request.record_type,
            request.image_changed,
            request.is_delete,
        );
        let pushes = request
            .channels
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|channel| {
                let message = &message;
                async move {
                    let response = self.push_with_timeout(channel.as_ref(), message).await;
                    (channel.name().to_string(), response)
                }
            });
        join_all(pushes).await.into_iter().collect()
    }

    /// Single channel delivery, used by the retry worker.
    pub async fn push_one(&self, channel: &str, message: &PushMessage) -> NotifierResponse {
        match self.registry.get(channel) {
            Some(channel) => self.push_with_timeout(channel.as_ref(), message).await,
            None => {
                let err = DispatchError::UnknownChannel(channel.to_string());
                NotifierResponse::failed(channel, err.status(), err.to_string())
            }
        }
    }

    pub fn message_for(&self, record_id: &str, record_type: &str, image_changed: bool, is_delete: bool) -> PushMessage {
        PushMessage {
            id: record_id.to_string(),
            record_type: record_type.to_string(),
            origin: self.origin.clone(),
            imageschanged: image_changed,
            isdelete: is_delete,
        }
    }

    async fn push_with_timeout(&self, channel: &dyn NotificationChannel, message: &PushMessage) -> NotifierResponse {
        let name = channel.name();
        let span = info_span!("push", channel = name, record_id = %message.id);
        async {
            let result = match tokio::time::timeout(self.timeout, channel.push(message)).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Timeout {
                    channel: name.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };
            match result {
                Ok(ack) => NotifierResponse::delivered(name, ack.status, ack.echoed_id),
                Err(err) => {
                    warn!(error = %err, "push failed");
                    NotifierResponse::failed(name, err.status(), err.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// In-process channels for exercising the dispatcher without a network.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Behaviour {
        Accept,
        Reject(u16),
        Hang,
    }

    /// Scripted channel recording every message it receives.
    pub struct ScriptedChannel {
        name: String,
        behaviour: Mutex<Behaviour>,
        received: Mutex<Vec<PushMessage>>,
    }

    impl ScriptedChannel {
        pub fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behaviour: Mutex::new(behaviour),
                received: Mutex::new(Vec::new()),
            })
        }

        pub fn set_behaviour(&self, behaviour: Behaviour) {
            *self.behaviour.lock().expect("behaviour lock") = behaviour;
        }

        pub fn received(&self) -> Vec<PushMessage> {
            self.received.lock().expect("received lock").clone()
        }
    }

    #[async_trait]
    impl NotificationChannel for ScriptedChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn push(&self, message: &PushMessage) -> Result<PushAck, DispatchError> {
            self.received.lock().expect("received lock").push(message.clone());
            let behaviour = *self.behaviour.lock().expect("behaviour lock");
            match behaviour {
                Behaviour::Accept => Ok(PushAck {
                    status: 200,
                    echoed_id: Some(format!("{}-{}", self.name, message.id)),
                }),
                Behaviour::Reject(status) => Err(DispatchError::Rejected {
                    channel: self.name.clone(),
                    status,
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(PushAck {
                        status: 200,
                        echoed_id: None,
                    })
                }
            }
        }
    }
}

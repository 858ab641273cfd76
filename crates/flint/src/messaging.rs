//! Messaging collaborator
//!
//! Publish/subscribe over NATS. [`MessagingService`] and [`MessageStream`]
//! are the seams; [`NatsMessaging`] is the `async-nats` adapter.
//! [`run_subscription`] drives a stream until interrupted, timed out, told to
//! stop by the handler, or closed, and always unsubscribes on the way out.

use async_nats::{ConnectOptions, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::environment::{MessagingAuth, MessagingConfig};
use crate::identity::CollaboratorError;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const CLIENT_NAME: &str = "flint";

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
    pub received_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            headers: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }

    /// Payload parsed as JSON, when it is JSON
    pub fn payload_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// A message to publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub subject: String,
    /// Subject the receiver should answer on
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Vec<(String, String)>,
}

/// Handler verdict after each message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Why a subscription loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    TimedOut,
    HandlerStopped,
    StreamClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Interrupted => "interrupted",
            Self::TimedOut => "timed out",
            Self::HandlerStopped => "message limit reached",
            Self::StreamClosed => "subscription closed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOutcome {
    pub reason: StopReason,
    pub delivered: u64,
}

/// An open subscription
#[async_trait]
pub trait MessageStream: Send {
    /// Next message, or `None` once the subscription is closed
    async fn next_message(&mut self) -> Option<ReceivedMessage>;

    async fn unsubscribe(&mut self) -> Result<(), CollaboratorError>;
}

/// Publish and subscribe
#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), CollaboratorError>;

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn MessageStream>, CollaboratorError>;
}

/// Drive `stream` until one of the stop conditions fires.
///
/// Handler errors are logged and the loop carries on. The stream is
/// unsubscribed on every exit path; a failed unsubscribe is logged only.
pub async fn run_subscription<S, H, E, I>(
    stream: &mut S,
    mut handler: H,
    timeout: Option<Duration>,
    interrupt: I,
) -> SubscriptionOutcome
where
    S: MessageStream + ?Sized,
    H: FnMut(&ReceivedMessage) -> Result<Flow, E>,
    E: fmt::Display,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let deadline = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => futures::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut delivered = 0u64;
    let reason = loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => break StopReason::Interrupted,
            _ = &mut deadline => break StopReason::TimedOut,
            next = stream.next_message() => {
                let Some(message) = next else {
                    break StopReason::StreamClosed;
                };
                delivered += 1;
                match handler(&message) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => break StopReason::HandlerStopped,
                    Err(e) => warn!(subject = %message.subject, "message handler failed: {}", e),
                }
            }
        }
    };

    if let Err(e) = stream.unsubscribe().await {
        warn!("failed to unsubscribe: {}", e);
    }
    debug!(%reason, delivered, "subscription finished");

    SubscriptionOutcome { reason, delivered }
}

/// Future that resolves on Ctrl-C
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {}", e);
        futures::future::pending::<()>().await;
    }
}

/// Parse a `key=value` header argument
pub fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("invalid header '{}': expected key=value", raw)),
    }
}

fn messaging_error(e: impl fmt::Display) -> CollaboratorError {
    CollaboratorError::Messaging(e.to_string())
}

/// `async-nats` adapter
#[derive(Debug, Clone)]
pub struct NatsMessaging {
    client: async_nats::Client,
}

impl NatsMessaging {
    /// Connect with the environment's credentials. `creds_file` is the
    /// already-resolved credentials path for the `creds` method.
    pub async fn connect(
        config: &MessagingConfig,
        creds_file: Option<&Path>,
    ) -> Result<Self, CollaboratorError> {
        if config.servers.is_empty() {
            return Err(CollaboratorError::Messaging(
                "no NATS servers configured".into(),
            ));
        }

        let options = match (&config.auth, creds_file) {
            (
                MessagingAuth::UserPass {
                    username: Some(username),
                    password: Some(password),
                },
                _,
            ) => ConnectOptions::new().user_and_password(username.clone(), password.clone()),
            (MessagingAuth::Token { token: Some(token) }, _) => {
                ConnectOptions::new().token(token.clone())
            }
            (MessagingAuth::Creds { .. }, Some(path)) => {
                ConnectOptions::with_credentials_file(path)
                    .await
                    .map_err(|e| {
                        CollaboratorError::Messaging(format!(
                            "failed to load credentials file {}: {}",
                            path.display(),
                            e
                        ))
                    })?
            }
            (auth, _) => {
                return Err(CollaboratorError::Messaging(format!(
                    "NATS {} authentication is not configured. Run 'flint auth nats'",
                    auth.method()
                )))
            }
        };

        if config.tls_enabled && !config.tls_verify {
            warn!("tls_verify=false is not supported by the NATS client; certificates will be verified");
        }

        let servers = config.servers.join(",");
        info!(servers = %servers, method = %config.auth.method(), "connecting to NATS");

        let client = options
            .name(CLIENT_NAME)
            .require_tls(config.tls_enabled)
            .connection_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .connect(servers)
            .await
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl MessagingService for NatsMessaging {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), CollaboratorError> {
        let subject = message.subject.clone();
        let payload = message.payload.clone();
        debug!(
            subject = %subject,
            reply = message.reply.as_deref(),
            bytes = payload.len(),
            "publishing"
        );

        let headers = (!message.headers.is_empty()).then(|| {
            let mut map = HeaderMap::new();
            for (key, value) in &message.headers {
                map.insert(key.as_str(), value.as_str());
            }
            map
        });

        let sent = match (message.reply.clone(), headers) {
            (None, None) => self.client.publish(subject, payload).await,
            (None, Some(map)) => self.client.publish_with_headers(subject, map, payload).await,
            (Some(reply), None) => self.client.publish_with_reply(subject, reply, payload).await,
            (Some(reply), Some(map)) => {
                self.client
                    .publish_with_reply_and_headers(subject, reply, map, payload)
                    .await
            }
        };
        sent.map_err(messaging_error)?;
        self.client.flush().await.map_err(messaging_error)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
    ) -> Result<Box<dyn MessageStream>, CollaboratorError> {
        debug!(subject, queue, "subscribing");
        let subscriber = match queue {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(messaging_error)?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(messaging_error)?,
        };
        Ok(Box::new(NatsStream { subscriber }))
    }
}

struct NatsStream {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl MessageStream for NatsStream {
    async fn next_message(&mut self) -> Option<ReceivedMessage> {
        let message = self.subscriber.next().await?;
        let headers = message
            .headers
            .as_ref()
            .map(|map| {
                map.iter()
                    .flat_map(|(name, values)| {
                        values
                            .iter()
                            .map(move |value| (name.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(ReceivedMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|r| r.to_string()),
            payload: message.payload,
            headers,
            received_at: Utc::now(),
        })
    }

    async fn unsubscribe(&mut self) -> Result<(), CollaboratorError> {
        self.subscriber.unsubscribe().await.map_err(messaging_error)
    }
}

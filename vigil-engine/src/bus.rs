//! Message bus seams plus an in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use vigil_protocol::Message;

use crate::context::CancelToken;
use crate::error::{BusError, HandlerError};

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

type Envelope = (String, Message);

/// In-memory bus: an unbounded queue routed to per-topic subscribers.
///
/// Every published message is also kept in a history so callers can inspect what was
/// sent. After the router's shutdown token fires, messages are still accepted but no
/// longer delivered.
pub struct ChannelBus {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    history: Mutex<Vec<Envelope>>,
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.subscribers
            .write()
            .entry(topic.into())
            .or_default()
            .push(handler);
    }

    /// Messages published on `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.history
            .lock()
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Routes queued messages to subscribers until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancelToken) -> Result<(), BusError> {
        let mut receiver = self.receiver.lock().take().ok_or(BusError::Closed)?;
        info!("message router started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some((topic, message)) => self.dispatch(&topic, message).await,
                    None => break,
                },
            }
        }
        *self.receiver.lock() = Some(receiver);
        info!("message router stopped");
        Ok(())
    }

    async fn dispatch(&self, topic: &str, message: Message) {
        let handlers = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(topic, message_id = %message.uuid, "no subscriber for message");
            return;
        }
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle(message.clone())),
        )
        .await;
        for result in results {
            if let Err(err) = result {
                error!(topic, message_id = %message.uuid, error = %err, "message handler failed");
            }
        }
    }
}

#[async_trait]
impl Publisher for ChannelBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        self.history.lock().push((topic.to_string(), message.clone()));
        self.sender
            .send((topic.to_string(), message))
            .map_err(|_| BusError::Closed)
    }
}

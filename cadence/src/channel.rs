//! Change channel: a reconnecting subscription to one collection's change
//! stream.
//!
//! Events are forwarded in the order the store reports them. The channel
//! does not deduplicate and promises nothing across a reconnect; every
//! (re)connect is followed by `ResyncRequired` so the owner reloads the full
//! collection instead of assuming delivery continuity.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ChangeEvent, RemoteStore};
use crate::types::{CollectionRef, SyncConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(ChangeEvent),
    Status(ChannelStatus),
    /// The subscription was (re)established; reload the collection.
    ResyncRequired,
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for ChannelOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            backoff: config.reconnect_backoff(),
            backoff_max: config.reconnect_backoff_max(),
        }
    }
}

/// Live subscription. Dropping the handle cancels it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    collection: CollectionRef,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn collection(&self) -> &CollectionRef {
        &self.collection
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ChangeChannel {
    store: Arc<dyn RemoteStore>,
    options: ChannelOptions,
}

impl ChangeChannel {
    pub fn new(store: Arc<dyn RemoteStore>, options: ChannelOptions) -> Self {
        Self { store, options }
    }

    /// Subscribe to `collection`. Must be called inside a tokio runtime.
    pub fn subscribe<F>(&self, collection: CollectionRef, on_message: F) -> SubscriptionHandle
    where
        F: FnMut(ChannelMessage) + Send + 'static,
    {
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.store),
            collection.clone(),
            self.options,
            on_message,
        ));
        SubscriptionHandle { collection, task }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        debug!(collection = %handle.collection, "unsubscribing");
        drop(handle);
    }
}

async fn run_subscription<F>(
    store: Arc<dyn RemoteStore>,
    collection: CollectionRef,
    options: ChannelOptions,
    mut on_message: F,
) where
    F: FnMut(ChannelMessage) + Send + 'static,
{
    let mut backoff = options.backoff;
    // Disconnected is reported once per outage, not once per failed attempt.
    let mut reported_down = false;

    loop {
        match store.subscribe(&collection).await {
            Ok(mut stream) => {
                info!(collection = %collection, "change channel connected");
                backoff = options.backoff;
                on_message(ChannelMessage::Status(ChannelStatus::Connected));
                on_message(ChannelMessage::ResyncRequired);

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => on_message(ChannelMessage::Event(event)),
                        Err(e) => {
                            warn!(collection = %collection, error = %e, "change stream failed");
                            break;
                        }
                    }
                }

                reported_down = true;
                on_message(ChannelMessage::Status(ChannelStatus::Disconnected));
            }
            Err(e) => {
                warn!(collection = %collection, error = %e, "subscribe failed");
                if !reported_down {
                    reported_down = true;
                    on_message(ChannelMessage::Status(ChannelStatus::Disconnected));
                }
            }
        }

        debug!(collection = %collection, delay_ms = backoff.as_millis() as u64, "reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(options.backoff_max);
    }
}

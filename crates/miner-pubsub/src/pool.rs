//! Spread topics across several connections.
//!
//! The platform caps topics per connection, so a pool hands each new topic
//! to the first client with room and opens another client when all are full.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::PubSubClient;
use crate::config::ClientConfig;
use crate::dispatch::PubSubListener;
use crate::errors::PubSubError;
use crate::state::ConnectionState;
use crate::topic::Topic;

/// A set of clients sharing listeners and credentials.
pub struct PubSubPool {
    config: ClientConfig,
    inner: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    clients: Vec<PubSubClient>,
    listeners: Vec<Arc<dyn PubSubListener>>,
    auth_token: Option<String>,
}

impl PubSubPool {
    /// Create an empty pool; clients are opened on demand.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolState::default()),
        }
    }

    /// Set the token for current and future clients.
    ///
    /// Clients stopped by an auth failure that still hold topics reconnect
    /// with the new token.
    pub async fn set_auth_token(&self, token: impl Into<String>) {
        let token = token.into();
        let mut state = self.inner.lock().await;
        for client in &state.clients {
            client.set_auth_token(token.clone());
            if client.state() == ConnectionState::Closed && client.topic_count() > 0 {
                info!(topics = client.topic_count(), "reconnecting pool connection with new token");
                if let Err(err) = client.connect().await {
                    warn!(error = %err, "pool connection not up yet, retrying in background");
                }
            }
        }
        state.auth_token = Some(token);
    }

    /// Register a listener on every current and future client.
    pub async fn add_listener(&self, listener: Arc<dyn PubSubListener>) {
        let mut state = self.inner.lock().await;
        for client in &state.clients {
            let _ = client.add_listener(Arc::clone(&listener));
        }
        state.listeners.push(listener);
    }

    /// Listen to `topic` on some connection.
    ///
    /// No-op when a client already holds it. A new client is opened when
    /// every existing one is full; if its first connect fails it keeps
    /// retrying in the background and the topic is sent once it is up.
    pub async fn listen(&self, topic: Topic) -> Result<(), PubSubError> {
        let mut state = self.inner.lock().await;
        if state.clients.iter().any(|c| c.has_topic(&topic)) {
            return Ok(());
        }

        // a Closed client only comes back through set_auth_token
        if let Some(client) = state
            .clients
            .iter()
            .find(|c| c.has_capacity() && c.state() != ConnectionState::Closed)
        {
            return client.subscribe(topic).await;
        }

        let client = PubSubClient::new(self.config.clone());
        if let Some(token) = &state.auth_token {
            client.set_auth_token(token.clone());
        }
        for listener in &state.listeners {
            let _ = client.add_listener(Arc::clone(listener));
        }
        client.subscribe(topic.clone()).await?;
        info!(topic = %topic, clients = state.clients.len() + 1, "opening pool connection");
        state.clients.push(client.clone());
        drop(state);

        if let Err(err) = client.connect().await {
            warn!(topic = %topic, error = %err, "pool connection not up yet, retrying in background");
        }
        Ok(())
    }

    /// Stop listening to `topic`; a client left empty is closed.
    pub async fn unlisten(&self, topic: &Topic) -> Result<(), PubSubError> {
        let mut state = self.inner.lock().await;
        let Some(index) = state.clients.iter().position(|c| c.has_topic(topic)) else {
            return Ok(());
        };
        let client = state.clients[index].clone();
        let result = client.unsubscribe(topic).await;
        if client.topic_count() == 0 {
            debug!(topic = %topic, "closing empty pool connection");
            let _ = state.clients.remove(index);
            client.close().await;
        }
        result
    }

    /// Close every client.
    pub async fn close(&self) {
        let clients = std::mem::take(&mut self.inner.lock().await.clients);
        let _ = join_all(clients.iter().map(PubSubClient::close)).await;
    }

    /// Number of open clients.
    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Topics across all clients.
    pub async fn topic_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .clients
            .iter()
            .map(PubSubClient::topic_count)
            .sum()
    }

    /// Every topic, grouped by client.
    pub async fn topics(&self) -> Vec<Vec<Topic>> {
        self.inner
            .lock()
            .await
            .clients
            .iter()
            .map(PubSubClient::topics)
            .collect()
    }
}

//! Connection Registry (spec §4.7): process-wide map from connection id to
//! server stream processor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::processor::ServerStreamProcessor;

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<ServerStreamProcessor>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<ServerStreamProcessor>> {
        self.inner.read().await.get(connection_id).cloned()
    }

    /// Idempotent: if a different processor is already registered for this
    /// id, closes it first (defends against duplicate client reconnects).
    pub async fn register(&self, processor: Arc<ServerStreamProcessor>) {
        let connection_id = processor.connection_id().to_owned();
        let previous = {
            let mut map = self.inner.write().await;
            map.insert(connection_id.clone(), processor.clone())
        };
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &processor) {
                previous.close().await;
            }
        }
    }

    pub async fn remove(&self, connection_id: &str) {
        if let Some(processor) = self.inner.write().await.remove(connection_id) {
            processor.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = ConnectionRegistry::new();
        let processor = Arc::new(ServerStreamProcessor::new("conn_abc1234567"));
        registry.register(processor.clone()).await;
        let fetched = registry.get("conn_abc1234567").await.unwrap();
        assert!(Arc::ptr_eq(&fetched, &processor));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn registering_a_different_processor_for_same_id_closes_the_old_one() {
        let registry = ConnectionRegistry::new();
        let first = Arc::new(ServerStreamProcessor::new("conn_abc1234567"));
        let second = Arc::new(ServerStreamProcessor::new("conn_abc1234567"));
        registry.register(first.clone()).await;
        registry.register(second.clone()).await;
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let processor = Arc::new(ServerStreamProcessor::new("conn_abc1234567"));
        registry.register(processor).await;
        registry.remove("conn_abc1234567").await;
        registry.remove("conn_abc1234567").await;
        assert!(registry.is_empty().await);
    }
}

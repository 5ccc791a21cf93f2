use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

use crate::container::{ContainerState, ListenerContainer};
use crate::error::ListenerError;
use crate::Result;

/// Application-owned set of listener containers, keyed by container id.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: IndexMap<String, Arc<ListenerContainer>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, container: ListenerContainer) -> Result<Arc<ListenerContainer>> {
        let id = container.id().to_string();
        if self.containers.contains_key(&id) {
            return Err(ListenerError::DuplicateContainer(id));
        }
        let container = Arc::new(container);
        self.containers.insert(id, container.clone());
        Ok(container)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ListenerContainer>> {
        self.containers
            .get(id)
            .cloned()
            .ok_or_else(|| ListenerError::ContainerNotFound(id.to_string()))
    }

    /// Start containers in registration order, stopping at the first failure
    pub async fn start_all(&self) -> Result<()> {
        for container in self.containers.values() {
            container.start().await?;
        }
        info!(containers = self.containers.len(), "All listener containers started");
        Ok(())
    }

    /// Stop every container concurrently
    pub async fn stop_all(&self) {
        join_all(self.containers.values().map(|container| container.stop())).await;
        info!(containers = self.containers.len(), "All listener containers stopped");
    }

    pub fn states(&self) -> Vec<(String, ContainerState)> {
        self.containers
            .iter()
            .map(|(id, container)| (id.clone(), container.state()))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

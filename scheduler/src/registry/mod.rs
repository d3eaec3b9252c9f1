//! Service-discovery client (spec.md §4.5/§6): an etcd-like KV store with
//! TTL leases and prefix watches. `Registry` is the contract the picker and
//! dispatcher depend on; `EtcdRegistry` is the concrete implementation
//! against `etcd-client`, keyed `{prefix}/{serviceName}/{address}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions, WatchOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Add(ServiceInstance),
    Delete(ServiceInstance),
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>, SchedulerError>;

    async fn subscribe(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<ServiceEvent>, SchedulerError>;

    async fn register(&self, instance: ServiceInstance) -> Result<(), SchedulerError>;

    async fn unregister(&self, instance: &ServiceInstance) -> Result<(), SchedulerError>;
}

pub struct EtcdRegistry {
    client: Client,
    key_prefix: String,
    lease_ttl: Duration,
}

impl EtcdRegistry {
    pub async fn connect(
        endpoints: &[String],
        key_prefix: String,
        lease_ttl: Duration,
    ) -> Result<Self, SchedulerError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix,
            lease_ttl,
        })
    }

    fn service_prefix(&self, name: &str) -> String {
        format!("{}/{}/", self.key_prefix, name)
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!("{}/{}/{}", self.key_prefix, instance.name, instance.address)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>, SchedulerError> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                self.service_prefix(name),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        let mut instances = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<ServiceInstance>(kv.value()) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(error = %e, "skipping malformed registry entry"),
            }
        }
        Ok(instances)
    }

    async fn subscribe(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<ServiceEvent>, SchedulerError> {
        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(
                self.service_prefix(name),
                Some(WatchOptions::new().with_prefix()),
            )
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = watcher.cancel().await;
                        return;
                    }
                    message = stream.message() => {
                        match message {
                            Ok(Some(resp)) => {
                                for event in resp.events() {
                                    let Some(kv) = event.kv() else { continue };
                                    let Ok(instance) =
                                        serde_json::from_slice::<ServiceInstance>(kv.value())
                                    else {
                                        continue;
                                    };
                                    let mapped = match event.event_type() {
                                        etcd_client::EventType::Put => ServiceEvent::Add(instance),
                                        etcd_client::EventType::Delete => {
                                            ServiceEvent::Delete(instance)
                                        }
                                    };
                                    if sender.send(mapped).is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok(None) => return,
                            Err(e) => {
                                error!(error = %e, "registry watch stream error");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }

    async fn register(&self, instance: ServiceInstance) -> Result<(), SchedulerError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.lease_ttl.as_secs() as i64, None)
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        let value = serde_json::to_vec(&instance)
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        client
            .put(
                self.instance_key(&instance),
                value,
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        let (mut keeper, mut keep_alive_stream) = client
            .lease_keep_alive(lease.id())
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                (lease.ttl().max(1) as u64) / 3,
            ));
            loop {
                interval.tick().await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                if keep_alive_stream.message().await.is_err() {
                    return;
                }
            }
        });

        info!(service = %instance.name, address = %instance.address, "registered with the service registry");
        Ok(())
    }

    async fn unregister(&self, instance: &ServiceInstance) -> Result<(), SchedulerError> {
        let mut client = self.client.clone();
        client
            .delete(self.instance_key(instance), None)
            .await
            .map_err(|e| SchedulerError::Registry(e.to_string()))?;
        Ok(())
    }
}

/// In-memory registry backing tests and local/single-node deployments;
/// avoids a hard dependency on a running etcd cluster in unit tests.
#[derive(Default, Clone)]
pub struct InMemoryRegistry {
    instances: Arc<RwLock<HashMap<String, Vec<ServiceInstance>>>>,
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn list_services(&self, name: &str) -> Result<Vec<ServiceInstance>, SchedulerError> {
        Ok(self
            .instances
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        _name: &str,
        _cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<ServiceEvent>, SchedulerError> {
        let (_sender, receiver) = mpsc::unbounded_channel();
        Ok(receiver)
    }

    async fn register(&self, instance: ServiceInstance) -> Result<(), SchedulerError> {
        let mut instances = self.instances.write().await;
        let entry = instances.entry(instance.name.clone()).or_default();
        entry.retain(|i| i.address != instance.address);
        entry.push(instance);
        Ok(())
    }

    async fn unregister(&self, instance: &ServiceInstance) -> Result<(), SchedulerError> {
        let mut instances = self.instances.write().await;
        if let Some(entry) = instances.get_mut(&instance.name) {
            entry.retain(|i| i.address != instance.address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_registry_register_list_unregister() {
        let registry = InMemoryRegistry::default();
        let instance = ServiceInstance {
            id: "worker-1".to_string(),
            name: "workers".to_string(),
            address: "10.0.0.1:9200".to_string(),
        };
        registry.register(instance.clone()).await.unwrap();

        let listed = registry.list_services("workers").await.unwrap();
        assert_eq!(listed, vec![instance.clone()]);

        registry.unregister(&instance).await.unwrap();
        let listed = registry.list_services("workers").await.unwrap();
        assert!(listed.is_empty());
    }
}

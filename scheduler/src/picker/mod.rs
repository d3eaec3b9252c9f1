//! Worker selection (spec.md §4.5). The original carries `specificNodeId`/
//! `excludedNodeId` as out-of-band hints on a call context; REDESIGN FLAGS
//! (spec.md §9) calls that out as foreign to Rust idiom and recommends an
//! explicit value threaded through the call instead — `DispatchOptions`.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IteratorRandom;

use crate::errors::SchedulerError;
use crate::registry::{Registry, ServiceInstance};

/// Sticky/excluded hints for one dispatch. `specific_node_id` is set by
/// `Runner::reschedule` (sticky placement back to the worker that asked for
/// it); `excluded_node_id` is set by `Runner::retry` (avoid the node that
/// just failed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub specific_node_id: Option<String>,
    pub excluded_node_id: Option<String>,
}

impl DispatchOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn specific(node_id: String) -> Self {
        Self {
            specific_node_id: Some(node_id),
            excluded_node_id: None,
        }
    }

    pub fn excluding(node_id: String) -> Self {
        Self {
            specific_node_id: None,
            excluded_node_id: Some(node_id),
        }
    }
}

#[async_trait]
pub trait WorkerPicker: Send + Sync {
    async fn pick(
        &self,
        service_name: &str,
        options: &DispatchOptions,
    ) -> Result<ServiceInstance, SchedulerError>;
}

pub struct BasePicker {
    registry: Arc<dyn Registry>,
}

impl BasePicker {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerPicker for BasePicker {
    async fn pick(
        &self,
        service_name: &str,
        options: &DispatchOptions,
    ) -> Result<ServiceInstance, SchedulerError> {
        let candidates = self.registry.list_services(service_name).await?;
        if candidates.is_empty() {
            return Err(SchedulerError::Registry(format!(
                "no instances registered for service {service_name}"
            )));
        }

        if let Some(wanted) = &options.specific_node_id {
            if let Some(found) = candidates.iter().find(|c| &c.id == wanted) {
                return Ok(found.clone());
            }
            // Sticky target is gone; fall through to a random pick over the
            // full set rather than failing the dispatch outright.
        }

        let filtered: Vec<&ServiceInstance> = match &options.excluded_node_id {
            Some(excluded) => candidates.iter().filter(|c| &c.id != excluded).collect(),
            None => candidates.iter().collect(),
        };

        let pool = if filtered.is_empty() {
            candidates.iter().collect::<Vec<_>>()
        } else {
            filtered
        };

        let mut rng = rand::rng();
        pool.into_iter()
            .choose(&mut rng)
            .cloned()
            .ok_or_else(|| SchedulerError::Registry(format!("no instances for service {service_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    async fn registry_with(names_addrs: &[(&str, &str)]) -> Arc<dyn Registry> {
        let registry = InMemoryRegistry::default();
        for (id, addr) in names_addrs {
            registry
                .register(ServiceInstance {
                    id: id.to_string(),
                    name: "workers".to_string(),
                    address: addr.to_string(),
                })
                .await
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn specific_node_id_is_honored() {
        let registry = registry_with(&[("a", "1.1.1.1"), ("b", "2.2.2.2")]).await;
        let picker = BasePicker::new(registry);
        let picked = picker
            .pick("workers", &DispatchOptions::specific("b".to_string()))
            .await
            .unwrap();
        assert_eq!(picked.id, "b");
    }

    #[tokio::test]
    async fn excluded_node_id_is_skipped() {
        let registry = registry_with(&[("a", "1.1.1.1")]).await;
        let picker = BasePicker::new(registry);
        // Only candidate is excluded — falls back to the full set rather
        // than failing the dispatch.
        let picked = picker
            .pick("workers", &DispatchOptions::excluding("a".to_string()))
            .await
            .unwrap();
        assert_eq!(picked.id, "a");
    }

    #[tokio::test]
    async fn empty_registry_is_an_error() {
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::default());
        let picker = BasePicker::new(registry);
        let result = picker.pick("workers", &DispatchOptions::none()).await;
        assert!(result.is_err());
    }
}

use std::collections::BTreeSet;
use shared::types::{FrontendResponse, PartitionEndpoint};

/// Where each service is reachable, per partition, once the balancer is configured.
///
/// Filled one (service, partition) pair at a time and never written to the
/// transport by itself; publishing reads it.
#[derive(Debug, Clone, Default)]
pub struct ReadinessRecord {
    services: FrontendResponse,
}

impl ReadinessRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a service as reachable on a partition. The last call for a
    /// given service and partition wins.
    pub fn loadbalancer_ready(
        &mut self,
        service_name: &str,
        partition: &str,
        addresses: Vec<String>,
        port: u16,
        protocol: &str,
    ) {
        self.services
            .entry(service_name.to_string())
            .or_default()
            .insert(
                partition.to_string(),
                PartitionEndpoint {
                    addresses,
                    port,
                    protocol: protocol.to_string(),
                },
            );
    }

    pub fn services(&self) -> &FrontendResponse {
        &self.services
    }

    /// Drop every service not in `requested`. Returns how many were dropped.
    pub fn retain_requested(&mut self, requested: &BTreeSet<String>) -> usize {
        let before = self.services.len();
        self.services.retain(|name, _| {
            let keep = requested.contains(name);
            if !keep {
                tracing::info!("Dropping readiness for withdrawn service {}", name);
            }
            keep
        });
        before - self.services.len()
    }

    /// The subset of readiness covering `service_names`. Names without
    /// recorded readiness are left out.
    pub fn response_for<'a, I>(&self, service_names: I) -> FrontendResponse
    where
        I: IntoIterator<Item = &'a String>,
    {
        service_names
            .into_iter()
            .filter_map(|name| {
                self.services
                    .get(name)
                    .map(|partitions| (name.clone(), partitions.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_call_wins() {
        let mut record = ReadinessRecord::new();
        record.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".into()], 80, "http");
        record.loadbalancer_ready("svc-a", "public", vec!["5.6.7.8".into()], 8080, "http");
        record.loadbalancer_ready("svc-a", "admin", vec!["10.0.0.1".into()], 80, "http");

        let partitions = record.services().get("svc-a").unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions["public"].addresses, vec!["5.6.7.8".to_string()]);
        assert_eq!(partitions["public"].port, 8080);
    }

    #[test]
    fn test_response_for_subset() {
        let mut record = ReadinessRecord::new();
        record.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".into()], 80, "http");
        record.loadbalancer_ready("svc-b", "public", vec!["1.2.3.5".into()], 81, "http");

        let wanted: BTreeSet<String> = ["svc-b".to_string(), "svc-c".to_string()].into();
        let response = record.response_for(&wanted);
        assert_eq!(response.keys().collect::<Vec<_>>(), vec!["svc-b"]);
    }

    #[test]
    fn test_retain_requested() {
        let mut record = ReadinessRecord::new();
        record.loadbalancer_ready("svc-a", "public", vec!["1.2.3.4".into()], 80, "http");
        record.loadbalancer_ready("svc-b", "public", vec!["1.2.3.5".into()], 81, "http");

        let requested: BTreeSet<String> = ["svc-a".to_string()].into();
        assert_eq!(record.retain_requested(&requested), 1);
        assert!(record.services().get("svc-a").is_some());
        assert!(record.services().get("svc-b").is_none());
    }
}

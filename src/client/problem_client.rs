use crate::client::api::{NodeApi, NodeObject};
use crate::error::ClientError;
use crate::types::{Condition, Event, Timestamp};
use log::{debug, info};
use std::sync::{Arc, Mutex};

/// Writes conditions and events for one node
///
/// Condition writes carry the last seen resource version. When the API
/// reports a conflict the node is fetched again and the write is retried
/// once against the fresh version.
pub struct ProblemClient {
    api: Arc<dyn NodeApi>,
    resource_version: Mutex<Option<String>>,
}

impl ProblemClient {
    pub fn new(api: Arc<dyn NodeApi>) -> Self {
        Self {
            api,
            resource_version: Mutex::new(None),
        }
    }

    fn cached_version(&self) -> Option<String> {
        self.resource_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember(&self, node: &NodeObject) {
        *self
            .resource_version
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(node.resource_version.clone());
    }

    /// Fetch the node and refresh the cached version
    pub async fn get_node(&self) -> Result<NodeObject, ClientError> {
        let node = self.api.get_node().await?;
        self.remember(&node);
        Ok(node)
    }

    /// Conditions currently stored on the node
    pub async fn get_conditions(&self) -> Result<Vec<Condition>, ClientError> {
        Ok(self.get_node().await?.conditions)
    }

    /// Write `conditions` to the node status
    pub async fn report_conditions(
        &self,
        conditions: &[Condition],
        heartbeat: Timestamp,
    ) -> Result<(), ClientError> {
        let version = match self.cached_version() {
            Some(version) => version,
            None => self.get_node().await?.resource_version,
        };

        let node = match self
            .api
            .patch_node_conditions(&version, conditions, heartbeat)
            .await
        {
            Err(ClientError::Conflict) => {
                info!("Node version {} is stale, refetching before retry", version);
                let fresh = self.get_node().await?;
                self.api
                    .patch_node_conditions(&fresh.resource_version, conditions, heartbeat)
                    .await?
            }
            other => other?,
        };

        debug!(
            "Wrote {} conditions, node now at version {}",
            conditions.len(),
            node.resource_version
        );
        self.remember(&node);
        Ok(())
    }

    /// Post one event
    pub async fn report_event(&self, event: &Event) -> Result<(), ClientError> {
        self.api.post_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::api::MockNodeApi;
    use crate::types::ConditionStatus;
    use chrono::Utc;

    fn deadlock(status: ConditionStatus) -> Condition {
        Condition::new(
            "KernelDeadlock",
            status,
            "DockerHung",
            "task docker blocked",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_first_write_fetches_version() {
        let api = MockNodeApi::new("node-a");
        let client = ProblemClient::new(Arc::new(api.clone()));

        client
            .report_conditions(&[deadlock(ConditionStatus::True)], Utc::now())
            .await
            .unwrap();

        let patches = api.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1, "1");
        assert_eq!(api.node().conditions[0].status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_conflict_refetches_and_retries_once() {
        let api = MockNodeApi::new("node-a");
        let client = ProblemClient::new(Arc::new(api.clone()));
        client
            .report_conditions(&[deadlock(ConditionStatus::True)], Utc::now())
            .await
            .unwrap();

        // Someone else updates the node; the cached version is now stale
        api.touch();
        client
            .report_conditions(&[deadlock(ConditionStatus::False)], Utc::now())
            .await
            .unwrap();

        let patches = api.patches();
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[1].1, "2");
        assert_eq!(patches[2].1, "3");
        assert_eq!(api.node().conditions[0].status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn test_second_conflict_is_returned() {
        let api = MockNodeApi::new("node-a");
        let client = ProblemClient::new(Arc::new(api.clone()));
        api.fail_next_patches(vec![ClientError::Conflict, ClientError::Conflict]);

        let result = client
            .report_conditions(&[deadlock(ConditionStatus::True)], Utc::now())
            .await;
        assert!(matches!(result, Err(ClientError::Conflict)));
        assert_eq!(api.patches().len(), 2);
    }

    #[tokio::test]
    async fn test_get_conditions() {
        let api = MockNodeApi::new("node-a");
        let client = ProblemClient::new(Arc::new(api.clone()));
        client
            .report_conditions(&[deadlock(ConditionStatus::True)], Utc::now())
            .await
            .unwrap();

        let conditions = client.get_conditions().await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].condition_type, "KernelDeadlock");
    }
}

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::types::{Condition, ConditionStatus, Event, EventSeverity, Timestamp};
use chrono::Utc;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// Future returned by [`NodeApi`] calls
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Operations the daemon needs from the control-plane API
pub trait NodeApi: Send + Sync {
    /// Fetch the node object
    fn get_node<'a>(&'a self) -> ApiFuture<'a, NodeObject>;

    /// Merge `conditions` into the node status, guarded by `resource_version`
    fn patch_node_conditions<'a>(
        &'a self,
        resource_version: &'a str,
        conditions: &'a [Condition],
        heartbeat: Timestamp,
    ) -> ApiFuture<'a, NodeObject>;

    /// Record an event against the node
    fn post_event<'a>(&'a self, event: &'a Event) -> ApiFuture<'a, ()>;
}

/// The parts of a node object this daemon reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeObject {
    pub name: String,
    pub resource_version: String,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeCondition {
    #[serde(rename = "type")]
    condition_type: String,
    status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_heartbeat_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_transition_time: Option<Timestamp>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Node {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectReference<'a> {
    kind: &'static str,
    name: &'a str,
    uid: &'a str,
}

#[derive(Debug, Serialize)]
struct EventSource<'a> {
    component: &'a str,
    host: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    metadata: ObjectMeta,
    involved_object: ObjectReference<'a>,
    reason: &'a str,
    message: &'a str,
    #[serde(rename = "type")]
    event_type: &'static str,
    source: EventSource<'a>,
    first_timestamp: Timestamp,
    last_timestamp: Timestamp,
    count: u32,
}

impl From<NodeCondition> for Condition {
    fn from(c: NodeCondition) -> Self {
        let transition_time = c.last_transition_time.unwrap_or_else(Utc::now);
        Condition::new(c.condition_type, c.status, c.reason, c.message, transition_time)
    }
}

impl From<Node> for NodeObject {
    fn from(node: Node) -> Self {
        NodeObject {
            name: node.metadata.name.unwrap_or_default(),
            resource_version: node.metadata.resource_version.unwrap_or_default(),
            conditions: node.status.conditions.into_iter().map(Condition::from).collect(),
        }
    }
}

/// [`NodeApi`] over the API server's REST interface
pub struct KubeApiClient {
    client: Client,
    api_server: String,
    node_name: String,
    namespace: String,
    token: Option<String>,
}

impl KubeApiClient {
    /// Build a client from settings, reading the bearer token file if one is set
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ClientError::Setup(format!("failed to create HTTP client: {}", e)))?;

        let token = match &config.token_file {
            Some(path) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    ClientError::Setup(format!("failed to read {}: {}", path.display(), e))
                })?;
                Some(token.trim().to_string())
            }
            None => None,
        };

        Ok(Self {
            client,
            api_server: config.api_server.trim_end_matches('/').to_string(),
            node_name: config.node_name.clone(),
            namespace: config.event_namespace.clone(),
            token,
        })
    }

    fn node_url(&self) -> String {
        format!("{}/api/v1/nodes/{}", self.api_server, self.node_name)
    }

    fn status_url(&self) -> String {
        format!("{}/status", self.node_url())
    }

    fn events_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/events",
            self.api_server, self.namespace
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Turn non-success responses into typed errors
    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(match status {
            StatusCode::CONFLICT => ClientError::Conflict,
            StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited,
            _ => ClientError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn decode_node(response: Response) -> Result<NodeObject, ClientError> {
        let node: Node = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(format!("failed to parse node object: {}", e)))?;
        Ok(node.into())
    }
}

impl NodeApi for KubeApiClient {
    fn get_node<'a>(&'a self) -> ApiFuture<'a, NodeObject> {
        Box::pin(async move {
            let response = self
                .authorize(self.client.get(self.node_url()))
                .send()
                .await?;
            Self::decode_node(Self::check(response).await?).await
        })
    }

    fn patch_node_conditions<'a>(
        &'a self,
        resource_version: &'a str,
        conditions: &'a [Condition],
        heartbeat: Timestamp,
    ) -> ApiFuture<'a, NodeObject> {
        Box::pin(async move {
            let patch = Node {
                metadata: ObjectMeta {
                    resource_version: Some(resource_version.to_string()),
                    ..ObjectMeta::default()
                },
                status: NodeStatus {
                    conditions: conditions
                        .iter()
                        .map(|c| NodeCondition {
                            condition_type: c.condition_type.clone(),
                            status: c.status,
                            last_heartbeat_time: Some(heartbeat),
                            last_transition_time: Some(c.transition_time),
                            reason: c.reason.clone(),
                            message: c.message.clone(),
                        })
                        .collect(),
                },
            };
            let body = serde_json::to_vec(&patch)
                .map_err(|e| ClientError::Decode(format!("failed to encode patch: {}", e)))?;

            debug!(
                "Patching {} conditions on node {} at version {}",
                conditions.len(),
                self.node_name,
                resource_version
            );
            let response = self
                .authorize(self.client.patch(self.status_url()))
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/strategic-merge-patch+json",
                )
                .body(body)
                .send()
                .await?;
            Self::decode_node(Self::check(response).await?).await
        })
    }

    fn post_event<'a>(&'a self, event: &'a Event) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let name = format!(
                "{}.{:x}",
                self.node_name,
                event.timestamp.timestamp_nanos_opt().unwrap_or_default()
            );
            let body = EventBody {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: Some(self.namespace.clone()),
                    ..ObjectMeta::default()
                },
                involved_object: ObjectReference {
                    kind: "Node",
                    name: &self.node_name,
                    uid: &self.node_name,
                },
                reason: &event.reason,
                message: &event.message,
                event_type: match event.severity {
                    EventSeverity::Normal => "Normal",
                    EventSeverity::Warning => "Warning",
                },
                source: EventSource {
                    component: &event.source,
                    host: &self.node_name,
                },
                first_timestamp: event.timestamp,
                last_timestamp: event.timestamp,
                count: 1,
            };

            let response = self
                .authorize(self.client.post(self.events_url()))
                .json(&body)
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        })
    }
}

/// Scripted in-memory [`NodeApi`] for tests and dry runs
///
/// Failures queued with [`MockNodeApi::fail_next_patches`] and
/// [`MockNodeApi::fail_next_events`] are returned before any call succeeds.
/// Every call is recorded with the tokio clock reading at call time.
#[derive(Clone, Default)]
pub struct MockNodeApi {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    node: NodeObject,
    version: u64,
    patch_failures: Vec<ClientError>,
    event_failures: Vec<ClientError>,
    get_failures: Vec<ClientError>,
    patches: Vec<(tokio::time::Instant, String, Vec<Condition>)>,
    events: Vec<Event>,
    event_attempts: usize,
}

impl MockNodeApi {
    pub fn new(node_name: &str) -> Self {
        let api = Self::default();
        {
            let mut state = api.state();
            state.node.name = node_name.to_string();
            state.version = 1;
            state.node.resource_version = "1".to_string();
        }
        api
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return these errors from the next patch calls, in order
    pub fn fail_next_patches(&self, errors: Vec<ClientError>) {
        self.state().patch_failures.extend(errors);
    }

    pub fn fail_next_events(&self, errors: Vec<ClientError>) {
        self.state().event_failures.extend(errors);
    }

    pub fn fail_next_gets(&self, errors: Vec<ClientError>) {
        self.state().get_failures.extend(errors);
    }

    /// Bump the stored version as if another writer updated the node
    pub fn touch(&self) {
        let mut state = self.state();
        state.version += 1;
        state.node.resource_version = state.version.to_string();
    }

    /// Patch calls seen so far: call time, version sent and conditions
    pub fn patches(&self) -> Vec<(tokio::time::Instant, String, Vec<Condition>)> {
        self.state().patches.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn event_attempts(&self) -> usize {
        self.state().event_attempts
    }

    pub fn node(&self) -> NodeObject {
        self.state().node.clone()
    }
}

impl NodeApi for MockNodeApi {
    fn get_node<'a>(&'a self) -> ApiFuture<'a, NodeObject> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.get_failures.is_empty() {
                return Err(state.get_failures.remove(0));
            }
            Ok(state.node.clone())
        })
    }

    fn patch_node_conditions<'a>(
        &'a self,
        resource_version: &'a str,
        conditions: &'a [Condition],
        _heartbeat: Timestamp,
    ) -> ApiFuture<'a, NodeObject> {
        Box::pin(async move {
            let mut state = self.state();
            state.patches.push((
                tokio::time::Instant::now(),
                resource_version.to_string(),
                conditions.to_vec(),
            ));
            if !state.patch_failures.is_empty() {
                return Err(state.patch_failures.remove(0));
            }
            if resource_version != state.node.resource_version {
                return Err(ClientError::Conflict);
            }

            for condition in conditions {
                match state
                    .node
                    .conditions
                    .iter_mut()
                    .find(|c| c.condition_type == condition.condition_type)
                {
                    Some(existing) => *existing = condition.clone(),
                    None => state.node.conditions.push(condition.clone()),
                }
            }
            state.version += 1;
            state.node.resource_version = state.version.to_string();
            Ok(state.node.clone())
        })
    }

    fn post_event<'a>(&'a self, event: &'a Event) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            state.event_attempts += 1;
            if !state.event_failures.is_empty() {
                return Err(state.event_failures.remove(0));
            }
            state.events.push(event.clone());
            Ok(())
        })
    }
}

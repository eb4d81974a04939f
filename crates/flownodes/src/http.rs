use crate::variables::render_references;
use async_trait::async_trait;
use flowcore::{Node, NodeConfig, NodeContext, NodeError, NodeRunResult, NodeType, Value};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BodyType {
    #[default]
    None,
    Json,
    RawText,
    XWwwFormUrlencoded,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Body {
    #[serde(default, rename = "type")]
    body_type: BodyType,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct HttpData {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    params: BTreeMap<String, String>,
    #[serde(default)]
    body: Body,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_request(&self, data: &HttpData, ctx: &NodeContext) -> Result<reqwest::RequestBuilder, NodeError> {
        let pool = &ctx.variable_pool;
        let url = render_references(&data.url, pool);
        let method = reqwest::Method::from_bytes(data.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", data.method)))?;

        let mut request = self
            .client
            .request(method, &url)
            .timeout(Duration::from_secs(data.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)));

        for (key, value) in &data.headers {
            request = request.header(key, render_references(value, pool));
        }
        if !data.params.is_empty() {
            let params: Vec<(&str, String)> = data
                .params
                .iter()
                .map(|(k, v)| (k.as_str(), render_references(v, pool)))
                .collect();
            request = request.query(&params);
        }

        request = match data.body.body_type {
            BodyType::None => request,
            BodyType::Json => match &data.body.data {
                serde_json::Value::String(text) => request
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(render_references(text, pool)),
                other => request.json(other),
            },
            BodyType::RawText => {
                let text = data.body.data.as_str().unwrap_or_default();
                request.body(render_references(text, pool))
            }
            BodyType::XWwwFormUrlencoded => {
                let fields: BTreeMap<String, String> = match &data.body.data {
                    serde_json::Value::Object(map) => map
                        .iter()
                        .map(|(k, v)| {
                            let text = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                            (k.clone(), render_references(&text, pool))
                        })
                        .collect(),
                    _ => BTreeMap::new(),
                };
                request.form(&fields)
            }
        };
        Ok(request)
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let data: HttpData = ctx.data()?;
        let request = self.build_request(&data, &ctx)?;
        let timeout = data.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);

        tracing::info!(node_id = %ctx.node_id, method = %data.method, url = %data.url, "HTTP request");

        let send = async {
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    NodeError::Timeout { seconds: timeout }
                } else {
                    NodeError::ExecutionFailed(format!("HTTP request failed: {}", e))
                }
            })?;

            let status = response.status().as_u16();
            let headers: BTreeMap<String, Value> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(v.to_str().unwrap_or(""))))
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;
            Ok::<_, NodeError>((status, headers, body))
        };

        let (status, headers, body) = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            outcome = send => outcome?,
        };
        tracing::debug!(node_id = %ctx.node_id, status, "HTTP response");

        let mut result = NodeRunResult::new()
            .with_input("url", data.url.clone())
            .with_input("method", data.method.clone())
            .with_output("status_code", i64::from(status))
            .with_output("headers", Value::Object(headers));
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
            result = result.with_output("json", Value::from_json(json));
        }
        Ok(result.with_output("body", body))
    }

    fn validate_config(&self, config: &NodeConfig) -> Result<(), NodeError> {
        let data: HttpData = config
            .decode_data()
            .map_err(|e| NodeError::Configuration(format!("http-request node {}: {}", config.id, e)))?;
        reqwest::Method::from_bytes(data.method.to_uppercase().as_bytes())
            .map(|_| ())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", data.method)))
    }
}

pub struct HttpRequestNodeFactory;

impl NodeFactory for HttpRequestNodeFactory {
    fn create(&self, _config: &NodeConfig) -> Result<Arc<dyn Node>, NodeError> {
        Ok(Arc::new(HttpRequestNode::new()))
    }

    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![PortDefinition::new("url", "Target URL, may reference variables", true)],
            outputs: vec![
                PortDefinition::new("status_code", "HTTP status", true),
                PortDefinition::new("body", "Response body as text", true),
                PortDefinition::new("headers", "Response headers", true),
                PortDefinition::new("json", "Response body parsed as JSON", false),
            ],
        }
    }
}

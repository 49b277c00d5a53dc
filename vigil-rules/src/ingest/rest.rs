use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;
use vigil_protocol::EntityWithProperties;

use super::{section_config, Checkpoint, IngestResult, Ingester};
use crate::error::{EngineError, IngestError};
use crate::provider::{Provider, RestRequest};
use crate::rule_type::IngestSpec;
use crate::template;

const METHODS: [&str; 6] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

#[derive(Debug, Clone, Default, Deserialize)]
struct Fallback {
    http_code: u16,
    body: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RestConfig {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    /// `json` parses the response, anything else keeps raw text.
    #[serde(default)]
    parse: Option<String>,
    #[serde(default)]
    fallback: Vec<Fallback>,
}

/// Validates the HTTP method and the endpoint template of a REST call.
pub(crate) fn check_endpoint(
    component: &'static str,
    method: &str,
    endpoint: &str,
) -> Result<(), EngineError> {
    if !METHODS.contains(&method) {
        return Err(EngineError::config(
            component,
            format!("unsupported method {method}"),
        ));
    }
    if endpoint.trim().is_empty() {
        return Err(EngineError::config(component, "endpoint cannot be empty"));
    }
    match Url::parse(endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        Ok(url) => Err(EngineError::config(
            component,
            format!("unsupported scheme {}", url.scheme()),
        )),
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(()),
        Err(_) if endpoint.contains("{{") => Ok(()),
        Err(err) => Err(EngineError::config(
            component,
            format!("invalid endpoint {endpoint:?}: {err}"),
        )),
    }
}

/// Calls an upstream REST endpoint through the provider.
pub struct RestIngester {
    spec: IngestSpec,
    config: RestConfig,
    method: String,
    provider: Arc<dyn Provider>,
}

impl RestIngester {
    pub fn new(spec: IngestSpec, provider: Arc<dyn Provider>) -> Result<Self, EngineError> {
        let config: RestConfig = section_config(&spec, "rest ingester")?;
        let method = config
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase();
        check_endpoint("rest ingester", &method, &config.endpoint)?;
        Ok(Self {
            spec,
            config,
            method,
            provider,
        })
    }

    fn parse_json(&self) -> bool {
        self.config
            .parse
            .as_deref()
            .map_or(false, |parse| parse.eq_ignore_ascii_case("json"))
    }

    fn decode(&self, body: &[u8]) -> Result<Value, IngestError> {
        if self.parse_json() {
            serde_json::from_slice(body).map_err(|err| IngestError::Parse(err.to_string()))
        } else {
            Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
        }
    }
}

#[async_trait]
impl Ingester for RestIngester {
    fn kind(&self) -> &str {
        &self.spec.kind
    }

    fn config(&self) -> &IngestSpec {
        &self.spec
    }

    async fn ingest(
        &self,
        entity: &EntityWithProperties,
        params: &Value,
    ) -> Result<IngestResult, IngestError> {
        let client = self
            .provider
            .as_rest()
            .ok_or(IngestError::Unsupported("rest"))?;

        let root = Value::Object(template::context(entity, &Value::Null, params));
        let url = template::render_str(&self.config.endpoint, &root).map_err(IngestError::Template)?;
        let body = self
            .config
            .body
            .as_ref()
            .map(|body| template::render_value(body, &root))
            .transpose()
            .map_err(IngestError::Template)?;

        debug!(method = %self.method, url = %url, "rest ingest");
        let response = client
            .request(RestRequest {
                method: self.method.clone(),
                url: url.clone(),
                body,
            })
            .await?;

        let object = if response.is_success() {
            self.decode(&response.body)?
        } else if let Some(fallback) = self
            .config
            .fallback
            .iter()
            .find(|fallback| fallback.http_code == response.status)
        {
            self.decode(fallback.body.as_bytes())?
        } else if response.status == 404 {
            return Err(IngestError::NotFound(url));
        } else {
            return Err(IngestError::Upstream(format!(
                "{} {url} returned {}",
                self.method, response.status
            )));
        };

        Ok(IngestResult {
            object,
            fs: None,
            checkpoint: Some(Checkpoint {
                url: Some(url),
                ..Checkpoint::now()
            }),
        })
    }
}

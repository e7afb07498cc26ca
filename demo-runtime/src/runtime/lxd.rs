//! [`RuntimeClient`] over the LXD REST API.
//!
//! Talks HTTPS to the daemon's remote API with a trusted client certificate.
//! Every response uses the LXD envelope (`type` = `sync` | `async` | `error`);
//! async requests return an operation path that is waited on separately.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, Identity, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{InstanceDescriptor, InterfaceAddress, NetworkState, OperationHandle, RuntimeClient};
use crate::config::parse_or;
use crate::error::{LeaseError, Result};

const INSTANCES_PATH: &str = "/1.0/instances";
/// Config key LXD hands to cloud-init as user data.
pub const USER_DATA_KEY: &str = "user.user-data";

#[derive(Clone, Debug)]
pub struct LxdConfig {
    pub url: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Accept the daemon's self-signed certificate.
    pub insecure_tls: bool,
    pub timeout: Duration,
}

impl Default for LxdConfig {
    fn default() -> Self {
        Self {
            url: "https://127.0.0.1:8443".to_string(),
            client_cert: None,
            client_key: None,
            insecure_tls: false,
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl LxdConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let url = lookup("LXD_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.url);
        let timeout = parse_or(&lookup, "REQUEST_TIMEOUT_SECS", crate::DEFAULT_TIMEOUT_SECS);
        LxdConfig {
            url,
            client_cert: lookup("LXD_CLIENT_CERT").map(PathBuf::from),
            client_key: lookup("LXD_CLIENT_KEY").map(PathBuf::from),
            insecure_tls: parse_or(&lookup, "LXD_INSECURE_TLS", false),
            timeout: Duration::from_secs(timeout),
        }
    }
}

/// LXD response envelope.
#[derive(Debug, Default, Deserialize)]
struct LxdResponse {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
struct InterfaceState {
    #[serde(default)]
    addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceState {
    #[serde(default)]
    network: Option<BTreeMap<String, InterfaceState>>,
}

pub struct LxdClient {
    base: Url,
    http: Client,
}

impl LxdClient {
    pub fn new(config: &LxdConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|err| LeaseError::Validation(format!("Invalid LXD_URL: {err}")))?;

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_tls);

        if let (Some(cert), Some(key)) = (&config.client_cert, &config.client_key) {
            let mut pem = std::fs::read(cert).map_err(|err| {
                LeaseError::Validation(format!("Failed to read {}: {err}", cert.display()))
            })?;
            let key_pem = std::fs::read(key).map_err(|err| {
                LeaseError::Validation(format!("Failed to read {}: {err}", key.display()))
            })?;
            pem.push(b'\n');
            pem.extend_from_slice(&key_pem);
            let identity = Identity::from_pem(&pem).map_err(|err| {
                LeaseError::Validation(format!("Invalid LXD client certificate: {err}"))
            })?;
            builder = builder.identity(identity);
        }

        let http = builder
            .build()
            .map_err(|err| LeaseError::Http(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { base, http })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| LeaseError::Http(format!("Invalid path '{path}': {err}")))
    }

    fn instance_path(instance_name: &str) -> String {
        format!("{INSTANCES_PATH}/{instance_name}")
    }

    /// Send one request and decode the envelope without judging the status.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, LxdResponse)> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut request = self.http.request(method, self.url(path)?).headers(headers);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|err| LeaseError::Http(format!("LXD request failed: {err}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| LeaseError::Http(format!("Failed to read LXD response: {err}")))?;
        let envelope = if text.trim().is_empty() {
            LxdResponse::default()
        } else {
            serde_json::from_str(&text).map_err(|err| {
                LeaseError::Http(format!("Invalid LXD response JSON ({status}): {err}"))
            })?
        };
        Ok((status, envelope))
    }

    /// Send and fail on HTTP or envelope errors.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<LxdResponse> {
        let (status, envelope) = self.send(method.clone(), path, body).await?;
        if !status.is_success() || envelope.kind == "error" {
            let detail = if envelope.error.is_empty() {
                status.to_string()
            } else {
                envelope.error
            };
            return Err(LeaseError::Runtime(format!("LXD {method} {path}: {detail}")));
        }
        Ok(envelope)
    }

    async fn request_operation(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<OperationHandle> {
        let envelope = self.request(method.clone(), path, Some(body)).await?;
        if envelope.operation.is_empty() {
            return Err(LeaseError::Runtime(format!(
                "LXD {method} {path}: expected an async operation"
            )));
        }
        Ok(OperationHandle(envelope.operation))
    }
}

#[async_trait::async_trait]
impl RuntimeClient for LxdClient {
    async fn copy_template(
        &self,
        template_name: &str,
        instance_name: &str,
        limits: &BTreeMap<String, String>,
        user_data: Option<&str>,
    ) -> Result<OperationHandle> {
        let mut config = limits.clone();
        if let Some(data) = user_data {
            config.insert(USER_DATA_KEY.to_string(), data.to_string());
        }
        let body = json!({
            "name": instance_name,
            "source": { "type": "copy", "source": template_name },
            "config": config,
        });
        self.request_operation(Method::POST, INSTANCES_PATH, body)
            .await
    }

    async fn await_completion(&self, operation: &OperationHandle) -> Result<()> {
        let path = format!("{}/wait", operation.0);
        let envelope = self.request(Method::GET, &path, None).await?;
        let status_code = envelope
            .metadata
            .get("status_code")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if status_code != 200 {
            let err = envelope
                .metadata
                .get("err")
                .and_then(Value::as_str)
                .filter(|e| !e.is_empty())
                .unwrap_or("operation did not succeed");
            return Err(LeaseError::Runtime(format!(
                "LXD operation {} failed: {err}",
                operation.0
            )));
        }
        Ok(())
    }

    async fn get_instance_descriptor(&self, instance_name: &str) -> Result<InstanceDescriptor> {
        let envelope = self
            .request(Method::GET, &Self::instance_path(instance_name), None)
            .await?;
        serde_json::from_value(envelope.metadata).map_err(|err| {
            LeaseError::Runtime(format!("Invalid descriptor for '{instance_name}': {err}"))
        })
    }

    async fn update_instance_descriptor(
        &self,
        instance_name: &str,
        descriptor: &InstanceDescriptor,
    ) -> Result<()> {
        let body = serde_json::to_value(descriptor)
            .map_err(|err| LeaseError::Validation(format!("Unserializable descriptor: {err}")))?;
        let envelope = self
            .request(Method::PUT, &Self::instance_path(instance_name), Some(body))
            .await?;
        if !envelope.operation.is_empty() {
            self.await_completion(&OperationHandle(envelope.operation))
                .await?;
        }
        Ok(())
    }

    async fn start_instance(&self, instance_name: &str) -> Result<OperationHandle> {
        let path = format!("{}/state", Self::instance_path(instance_name));
        self.request_operation(
            Method::PUT,
            &path,
            json!({ "action": "start", "timeout": -1 }),
        )
        .await
    }

    async fn get_instance_network_state(&self, instance_name: &str) -> Result<NetworkState> {
        let path = format!("{}/state", Self::instance_path(instance_name));
        let envelope = self.request(Method::GET, &path, None).await?;
        let state: InstanceState = serde_json::from_value(envelope.metadata).map_err(|err| {
            LeaseError::Runtime(format!("Invalid state for '{instance_name}': {err}"))
        })?;
        Ok(state
            .network
            .unwrap_or_default()
            .into_iter()
            .map(|(name, iface)| (name, iface.addresses))
            .collect())
    }

    async fn force_delete(&self, instance_name: &str) -> Result<()> {
        let instance_path = Self::instance_path(instance_name);
        let state_path = format!("{instance_path}/state");

        let (status, envelope) = self
            .send(
                Method::PUT,
                &state_path,
                Some(json!({ "action": "stop", "force": true, "timeout": -1 })),
            )
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        // Stopping an already stopped instance fails; the delete below is
        // what decides the outcome.
        if status.is_success() && !envelope.operation.is_empty() {
            let _ = self
                .await_completion(&OperationHandle(envelope.operation))
                .await;
        }

        let (status, envelope) = self.send(Method::DELETE, &instance_path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !status.is_success() || envelope.kind == "error" {
            return Err(LeaseError::Runtime(format!(
                "LXD DELETE {instance_path}: {}",
                if envelope.error.is_empty() {
                    status.to_string()
                } else {
                    envelope.error
                }
            )));
        }
        if !envelope.operation.is_empty() {
            self.await_completion(&OperationHandle(envelope.operation))
                .await?;
        }
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        let envelope = self.request(Method::GET, INSTANCES_PATH, None).await?;
        let urls: Vec<String> = serde_json::from_value(envelope.metadata)
            .map_err(|err| LeaseError::Runtime(format!("Invalid instance list: {err}")))?;
        Ok(urls
            .into_iter()
            .filter_map(|url| {
                url.rsplit('/')
                    .next()
                    .map(|name| name.split('?').next().unwrap_or(name).to_string())
            })
            .filter(|name| !name.is_empty())
            .collect())
    }
}

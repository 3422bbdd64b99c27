//! Proxmox VE REST client
//!
//! Thin typed wrapper over `https://<host>:<port>/api2/json`. Authenticates
//! with an API token and unwraps the `{"data": ...}` envelope. No business
//! logic lives here.
//!
//! # TLS
//!
//! Certificate verification is disabled: Proxmox hosts ship self-signed
//! certificates and homelab installs rarely replace them. The client logs a
//! warning the first time one is constructed.

use crate::api::HypervisorApi;
use crate::error::{ProxmoxError, Result};
use crate::types::{
    Appliance, CloneParams, ContainerConfig, ContainerStatus, ContainerSummary,
    CreateContainerParams, DeleteOptions, NetworkInterface, NodeInfo, StorageContent, TaskStatus,
};
use crate::upid::Upid;
use async_trait::async_trait;
use burrow_foundation::{BurrowConfig, ProxmoxCredentials};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Once;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

static TLS_WARNING: Once = Once::new();

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Proxmox VE API client
#[derive(Clone)]
pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    auth_header: String,
    node: String,
}

impl std::fmt::Debug for ProxmoxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxClient")
            .field("base_url", &self.base_url)
            .field("node", &self.node)
            .finish()
    }
}

impl ProxmoxClient {
    /// Build a client from complete credentials
    pub fn new(credentials: &ProxmoxCredentials) -> Result<Self> {
        Self::with_timeout(credentials, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Build a client with a custom per-request timeout
    pub fn with_timeout(credentials: &ProxmoxCredentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| {
                ProxmoxError::Configuration(format!("Failed to create HTTP client: {}", e))
            })?;

        TLS_WARNING.call_once(|| {
            warn!(
                host = %credentials.host,
                "TLS certificate verification is disabled for the Proxmox API"
            );
        });

        Ok(Self {
            client,
            base_url: format!(
                "https://{}:{}/api2/json",
                credentials.host.trim_end_matches('/'),
                credentials.port
            ),
            auth_header: format!(
                "PVEAPIToken={}={}",
                credentials.token_id, credentials.token_secret
            ),
            node: credentials.node.clone(),
        })
    }

    /// Build from loaded config; fails fast naming every missing setting
    pub fn from_config(config: &BurrowConfig) -> Result<Self> {
        let credentials = config
            .proxmox
            .credentials()
            .map_err(|e| ProxmoxError::Configuration(e.to_string()))?;
        Self::new(&credentials)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", &self.auth_header)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<T> {
        debug!(method = %method, path = %path, "Proxmox request");

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ProxmoxError::from_http_status(
                method.as_str(),
                path,
                status.as_u16(),
                &body,
            ));
        }

        serde_json::from_str::<Envelope<T>>(&body)
            .map(|envelope| envelope.data)
            .map_err(|e| {
                ProxmoxError::InvalidResponse(format!("{} {}: {}", method, path, e))
            })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let builder = self.request(Method::GET, path);
        self.send(Method::GET, path, builder).await
    }

    async fn get_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let builder = self.request(Method::GET, path).query(query);
        self.send(Method::GET, path, builder).await
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let builder = self.request(Method::POST, path).form(form);
        self.send(Method::POST, path, builder).await
    }

    async fn put_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let builder = self.request(Method::PUT, path).form(form);
        self.send(Method::PUT, path, builder).await
    }

    async fn post_task(&self, path: &str, form: &[(&str, String)]) -> Result<Upid> {
        let raw: String = self.post_form(path, form).await?;
        Upid::parse(&raw)
    }

    fn lxc_path(node: &str, vmid: u32) -> String {
        format!("/nodes/{}/lxc/{}", node, vmid)
    }
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    fn default_node(&self) -> &str {
        &self.node
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.get("/nodes").await
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<ContainerSummary>> {
        self.get(&format!("/nodes/{}/lxc", node)).await
    }

    async fn get_container_status(&self, node: &str, vmid: u32) -> Result<ContainerStatus> {
        self.get(&format!("{}/status/current", Self::lxc_path(node, vmid)))
            .await
    }

    async fn create_container(&self, node: &str, params: &CreateContainerParams) -> Result<Upid> {
        debug!(node = %node, vmid = params.vmid, hostname = %params.hostname, "Creating container");
        self.post_task(&format!("/nodes/{}/lxc", node), &params.to_form())
            .await
    }

    async fn clone_container(&self, node: &str, vmid: u32, params: &CloneParams) -> Result<Upid> {
        debug!(node = %node, vmid, newid = params.newid, "Cloning container");
        self.post_task(
            &format!("{}/clone", Self::lxc_path(node, vmid)),
            &params.to_form(),
        )
        .await
    }

    async fn delete_container(
        &self,
        node: &str,
        vmid: u32,
        options: DeleteOptions,
    ) -> Result<Upid> {
        let path = Self::lxc_path(node, vmid);
        let builder = self
            .request(Method::DELETE, &path)
            .query(&options.to_query());
        let raw: String = self.send(Method::DELETE, &path, builder).await?;
        Upid::parse(&raw)
    }

    async fn start_container(&self, node: &str, vmid: u32) -> Result<Upid> {
        self.post_task(&format!("{}/status/start", Self::lxc_path(node, vmid)), &[])
            .await
    }

    async fn stop_container(&self, node: &str, vmid: u32) -> Result<Upid> {
        self.post_task(&format!("{}/status/stop", Self::lxc_path(node, vmid)), &[])
            .await
    }

    async fn shutdown_container(
        &self,
        node: &str,
        vmid: u32,
        timeout_secs: u32,
        force_stop: bool,
    ) -> Result<Upid> {
        let form = [
            ("timeout", timeout_secs.to_string()),
            ("forceStop", if force_stop { "1" } else { "0" }.to_string()),
        ];
        self.post_task(
            &format!("{}/status/shutdown", Self::lxc_path(node, vmid)),
            &form,
        )
        .await
    }

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<()> {
        let _: serde_json::Value = self
            .post_form(&format!("{}/template", Self::lxc_path(node, vmid)), &[])
            .await?;
        Ok(())
    }

    async fn get_container_config(&self, node: &str, vmid: u32) -> Result<ContainerConfig> {
        self.get(&format!("{}/config", Self::lxc_path(node, vmid)))
            .await
    }

    async fn update_container_config(
        &self,
        node: &str,
        vmid: u32,
        params: &[(&str, String)],
    ) -> Result<()> {
        let _: serde_json::Value = self
            .put_form(&format!("{}/config", Self::lxc_path(node, vmid)), params)
            .await?;
        Ok(())
    }

    async fn resize_container(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size: &str,
    ) -> Result<Option<Upid>> {
        let form = [("disk", disk.to_string()), ("size", size.to_string())];
        let raw: Option<String> = self
            .put_form(&format!("{}/resize", Self::lxc_path(node, vmid)), &form)
            .await?;
        raw.filter(|r| !r.trim().is_empty())
            .map(|r| Upid::parse(&r))
            .transpose()
    }

    async fn get_interfaces(&self, node: &str, vmid: u32) -> Vec<NetworkInterface> {
        let path = format!("{}/interfaces", Self::lxc_path(node, vmid));
        match self.get::<Option<Vec<NetworkInterface>>>(&path).await {
            Ok(interfaces) => interfaces.unwrap_or_default(),
            Err(e) => {
                debug!(vmid, "Interface query unavailable: {}", e);
                Vec::new()
            }
        }
    }

    async fn get_task_status(&self, upid: &Upid) -> Result<TaskStatus> {
        self.get(&format!(
            "/nodes/{}/tasks/{}/status",
            upid.node(),
            upid.encoded()
        ))
        .await
    }

    async fn list_storage_templates(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContent>> {
        self.get_query(
            &format!("/nodes/{}/storage/{}/content", node, storage),
            &[("content", "vztmpl")],
        )
        .await
    }

    async fn list_appliances(&self, node: &str) -> Result<Vec<Appliance>> {
        self.get(&format!("/nodes/{}/aplinfo", node)).await
    }

    async fn download_appliance(&self, node: &str, storage: &str, template: &str) -> Result<Upid> {
        let form = [
            ("storage", storage.to_string()),
            ("template", template.to_string()),
        ];
        self.post_task(&format!("/nodes/{}/aplinfo", node), &form)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ProxmoxCredentials {
        ProxmoxCredentials {
            host: "pve.lan".into(),
            port: 8006,
            token_id: "root@pam!burrow".into(),
            token_secret: "0000-1111".into(),
            node: "pve".into(),
        }
    }

    #[test]
    fn test_base_url_and_auth_header() {
        let client = ProxmoxClient::new(&credentials()).unwrap();
        assert_eq!(client.base_url(), "https://pve.lan:8006/api2/json");
        assert_eq!(client.auth_header, "PVEAPIToken=root@pam!burrow=0000-1111");
        assert_eq!(client.default_node(), "pve");
    }

    #[test]
    fn test_debug_hides_token() {
        let client = ProxmoxClient::new(&credentials()).unwrap();
        assert!(!format!("{:?}", client).contains("0000-1111"));
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = BurrowConfig::default();
        let err = ProxmoxClient::from_config(&config).unwrap_err();
        assert!(matches!(err, ProxmoxError::Configuration(_)));
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn test_envelope_unwrap() {
        let envelope: Envelope<Vec<NodeInfo>> =
            serde_json::from_str(r#"{"data":[{"node":"pve","status":"online"}]}"#).unwrap();
        assert_eq!(envelope.data[0].node, "pve");

        let envelope: Envelope<Option<String>> = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(envelope.data.is_none());
    }
}

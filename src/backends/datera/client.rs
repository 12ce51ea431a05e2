//! Datera REST Adapter
//!
//! Every host volume maps to one app instance named after the volume id,
//! holding a single storage instance with a single volume.

use crate::backends::http::{ClientError, ClientResult, HttpRequest, HttpTransport, Method};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const STORAGE_INSTANCE: &str = "storage-1";
pub const VOLUME: &str = "volume-1";

// =============================================================================
// Resources
// =============================================================================

/// iSCSI access point of a storage instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub iqn: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInstance {
    #[serde(default)]
    pub access: Access,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
    #[serde(default)]
    pub admin_state: String,
    #[serde(default)]
    pub storage_instances: BTreeMap<String, StorageInstance>,
}

impl AppInstance {
    pub fn is_online(&self) -> bool {
        self.admin_state == "online"
    }

    /// Access point of the default storage instance
    pub fn access(&self) -> Option<&Access> {
        self.storage_instances.get(STORAGE_INSTANCE).map(|s| &s.access)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateraSnapshot {
    pub uuid: String,
}

/// Capacity report of the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub uuid: Option<String>,
    #[serde(default)]
    pub total_capacity: u64,
    #[serde(default)]
    pub available_capacity: u64,
}

/// Path of the volume inside an app instance
pub fn volume_path(app_instance: &str) -> String {
    format!(
        "/app_instances/{}/storage_instances/{}/volumes/{}",
        app_instance, STORAGE_INSTANCE, VOLUME
    )
}

// =============================================================================
// Client Port
// =============================================================================

#[async_trait]
pub trait DateraApi: Send + Sync {
    async fn login(&self) -> ClientResult<()>;

    async fn create_app_instance(&self, id: &str, size_gb: u64, replicas: u32) -> ClientResult<()>;
    /// Create `id` as a copy of the volume or snapshot at `clone_src`
    async fn clone_app_instance(&self, id: &str, clone_src: &str) -> ClientResult<()>;
    async fn get_app_instance(&self, id: &str) -> ClientResult<AppInstance>;
    async fn set_admin_state(&self, id: &str, online: bool, force: bool) -> ClientResult<AppInstance>;
    async fn delete_app_instance(&self, id: &str) -> ClientResult<()>;
    async fn resize_volume(&self, id: &str, size_gb: u64) -> ClientResult<()>;

    async fn create_snapshot(&self, id: &str, uuid: &str) -> ClientResult<()>;
    /// Snapshots of the app instance's volume keyed by timestamp
    async fn list_snapshots(&self, id: &str) -> ClientResult<BTreeMap<String, DateraSnapshot>>;
    async fn delete_snapshot(&self, id: &str, timestamp: &str) -> ClientResult<()>;

    async fn get_system(&self) -> ClientResult<SystemInfo>;
}

pub type DateraClientRef = Arc<dyn DateraApi>;

// =============================================================================
// REST Client
// =============================================================================

pub struct DateraRestClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl DateraRestClient {
    /// Create a new client for `base_url` (`http[s]://ip:port/v<version>`)
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        }
    }

    async fn send_once(&self, method: Method, resource: &str, body: Option<&Value>) -> ClientResult<Value> {
        let mut request = HttpRequest::new(method, format!("{}/{}", self.base_url, resource))
            .header("Content-Type", "application/json; charset=utf-8");
        if let Some(token) = self.token.lock().clone() {
            request = request.header("Auth-Token", token);
        }
        if let Some(body) = body {
            debug!("Datera {} {} payload: {}", method, resource, body);
            request = request.json(body.clone());
        }
        self.transport.send(request).await?.into_json()
    }

    /// Issue a request, logging in again once if the token was rejected
    async fn request(&self, method: Method, resource: &str, body: Option<Value>) -> ClientResult<Value> {
        match self.send_once(method, resource, body.as_ref()).await {
            Err(e) if e.is_not_authorized() => {
                debug!("Datera token rejected, logging in again");
                self.login().await?;
                self.send_once(method, resource, body.as_ref()).await
            }
            other => other,
        }
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        method: Method,
        resource: &str,
        body: Option<Value>,
    ) -> ClientResult<T> {
        let value = self.request(method, resource, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn snapshots_resource(id: &str) -> String {
        format!(
            "app_instances/{}/storage_instances/{}/volumes/{}/snapshots",
            id, STORAGE_INSTANCE, VOLUME
        )
    }
}

#[async_trait]
impl DateraApi for DateraRestClient {
    async fn login(&self) -> ClientResult<()> {
        // A stale token must not be sent along with the login
        *self.token.lock() = None;

        let body = json!({ "name": self.username, "password": self.password });
        let result = self.send_once(Method::Put, "login", Some(&body)).await?;
        let key = result
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Unexpected("login response without key".into()))?;
        *self.token.lock() = Some(key.to_string());
        Ok(())
    }

    async fn create_app_instance(&self, id: &str, size_gb: u64, replicas: u32) -> ClientResult<()> {
        let body = json!({
            "create_mode": "openstack",
            "uuid": id,
            "name": id,
            "storage_instances": [{
                "name": STORAGE_INSTANCE,
                "volumes": {
                    VOLUME: {
                        "name": VOLUME,
                        "size": size_gb,
                        "replica_count": replicas,
                        "snapshot_policies": {},
                    }
                }
            }]
        });
        self.request(Method::Post, "app_instances", Some(body)).await?;
        Ok(())
    }

    async fn clone_app_instance(&self, id: &str, clone_src: &str) -> ClientResult<()> {
        let body = json!({
            "create_mode": "openstack",
            "uuid": id,
            "name": id,
            "clone_src": clone_src,
            "access_control_mode": "allow_all",
        });
        self.request(Method::Post, "app_instances", Some(body)).await?;
        Ok(())
    }

    async fn get_app_instance(&self, id: &str) -> ClientResult<AppInstance> {
        self.request_as(Method::Get, &format!("app_instances/{}", id), None)
            .await
    }

    async fn set_admin_state(&self, id: &str, online: bool, force: bool) -> ClientResult<AppInstance> {
        let mut body = json!({ "admin_state": if online { "online" } else { "offline" } });
        if force {
            body["force"] = Value::Bool(true);
        }
        self.request_as(Method::Put, &format!("app_instances/{}", id), Some(body))
            .await
    }

    async fn delete_app_instance(&self, id: &str) -> ClientResult<()> {
        self.request(Method::Delete, &format!("app_instances/{}", id), None)
            .await?;
        Ok(())
    }

    async fn resize_volume(&self, id: &str, size_gb: u64) -> ClientResult<()> {
        let resource = format!(
            "app_instances/{}/storage_instances/{}/volumes/{}",
            id, STORAGE_INSTANCE, VOLUME
        );
        self.request(Method::Put, &resource, Some(json!({ "size": size_gb })))
            .await?;
        Ok(())
    }

    async fn create_snapshot(&self, id: &str, uuid: &str) -> ClientResult<()> {
        self.request(
            Method::Post,
            &Self::snapshots_resource(id),
            Some(json!({ "uuid": uuid })),
        )
        .await?;
        Ok(())
    }

    async fn list_snapshots(&self, id: &str) -> ClientResult<BTreeMap<String, DateraSnapshot>> {
        let value = self
            .request(Method::Get, &Self::snapshots_resource(id), None)
            .await?;
        if value.is_null() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_snapshot(&self, id: &str, timestamp: &str) -> ClientResult<()> {
        let resource = format!("{}/{}", Self::snapshots_resource(id), timestamp);
        self.request(Method::Delete, &resource, None).await?;
        Ok(())
    }

    async fn get_system(&self) -> ClientResult<SystemInfo> {
        self.request_as(Method::Get, "system", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::http::testing::ScriptedTransport;
    use assert_matches::assert_matches;

    const BASE: &str = "http://10.0.0.5:7717/v2";

    fn client(transport: Arc<ScriptedTransport>) -> DateraRestClient {
        DateraRestClient::new(transport, BASE, "admin", "secret")
    }

    fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
        request
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[tokio::test]
    async fn test_login_sets_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, json!({"key": "token-1"}))
            .respond(200, json!({"uuid": "c1", "total_capacity": 10, "available_capacity": 5}));

        let client = client(transport.clone());
        client.login().await.unwrap();
        let system = client.get_system().await.unwrap();
        assert_eq!(system.total_capacity, 10);

        let requests = transport.requests();
        assert_eq!(requests[0].method, Method::Put);
        assert_eq!(requests[0].url, "http://10.0.0.5:7717/v2/login");
        assert_eq!(
            requests[0].body,
            Some(json!({"name": "admin", "password": "secret"}))
        );
        assert_eq!(header(&requests[0], "Auth-Token"), None);
        assert_eq!(requests[1].url, "http://10.0.0.5:7717/v2/system");
        assert_eq!(header(&requests[1], "Auth-Token"), Some("token-1"));
    }

    #[tokio::test]
    async fn test_relogin_once_on_unauthorized() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(401, json!({"message": "expired"}))
            .respond(200, json!({"key": "token-2"}))
            .respond(200, json!({"admin_state": "offline"}));

        let instance = client(transport.clone()).get_app_instance("vol-1").await.unwrap();
        assert!(!instance.is_online());

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].url, "http://10.0.0.5:7717/v2/login");
        assert_eq!(header(&requests[2], "Auth-Token"), Some("token-2"));
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(403, Value::Null);

        assert_matches!(client(transport.clone()).login().await, Err(ClientError::NotAuthorized));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_create_app_instance_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(200, json!({}));

        client(transport.clone())
            .create_app_instance("vol-1", 5, 3)
            .await
            .unwrap();

        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(body["uuid"], "vol-1");
        assert_eq!(body["storage_instances"][0]["name"], "storage-1");
        let volume = &body["storage_instances"][0]["volumes"]["volume-1"];
        assert_eq!(volume["size"], 5);
        assert_eq!(volume["replica_count"], 3);
    }

    #[tokio::test]
    async fn test_not_found_and_snapshots() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(404, json!({"message": "no such app instance"}))
            .respond(200, json!({"1446076293.118600738": {"uuid": "snap-1"}}));

        let client = client(transport.clone());
        assert_matches!(
            client.delete_app_instance("vol-1").await,
            Err(ClientError::NotFound { message }) if message == "no such app instance"
        );

        let snapshots = client.list_snapshots("vol-1").await.unwrap();
        assert_eq!(snapshots["1446076293.118600738"].uuid, "snap-1");
        assert_eq!(
            transport.requests()[1].url,
            "http://10.0.0.5:7717/v2/app_instances/vol-1/storage_instances/storage-1/volumes/volume-1/snapshots"
        );
    }

    #[test]
    fn test_app_instance_access() {
        let instance: AppInstance = serde_json::from_value(json!({
            "admin_state": "online",
            "storage_instances": {
                "storage-1": {"access": {"ips": ["172.28.41.63"], "iqn": "iqn.2013-05.com.daterainc:tc:01:sn:fc372bc0490b2dbe"}}
            }
        }))
        .unwrap();

        assert!(instance.is_online());
        assert_eq!(instance.access().unwrap().ips[0], "172.28.41.63");
        assert_eq!(
            volume_path("vol-1"),
            "/app_instances/vol-1/storage_instances/storage-1/volumes/volume-1"
        );
    }
}

//! LeftHand REST Adapter
//!
//! Implements [`LeftHandApi`] against the `/lhos` management API. Requests go
//! through an [`HttpTransport`]; schedule operations are delegated to the
//! CLIQ shell.

use super::client::{
    BackendSnapshot, BackendVolume, ChapCredentials, Cluster, LeftHandApi, LeftHandClientRef,
    LeftHandConnector, LeftHandEndpoint, RemoteSnapshotSchedule, Server,
};
use super::cliq::{CliqShell, CommandRunnerRef};
use crate::backends::http::{
    ClientError, ClientResult, HttpRequest, HttpTransport, Method,
};
use crate::domain::ports::BackendOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// REST Client
// =============================================================================

/// REST client holding one session
pub struct LeftHandRestClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    token: Mutex<Option<String>>,
    credentials: Mutex<Option<(String, String)>>,
    cliq: Option<CliqShell>,
}

impl LeftHandRestClient {
    /// Create a new REST client for `base_url` (ending in `/lhos`)
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
            credentials: Mutex::new(None),
            cliq: None,
        }
    }

    /// Attach the CLIQ shell used for remote snapshot schedules
    pub fn with_cliq(mut self, cliq: CliqShell) -> Self {
        self.cliq = Some(cliq);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn cliq(&self) -> ClientResult<&CliqShell> {
        self.cliq
            .as_ref()
            .ok_or_else(|| ClientError::Unexpected("CLIQ shell is not configured".into()))
    }

    async fn authenticate(&self, username: &str, password: &str) -> ClientResult<()> {
        let request = HttpRequest::new(Method::Post, self.url("/credentials"))
            .json(json!({ "user": username, "password": password }));
        let body = self.transport.send(request).await?.into_json()?;

        let token = body
            .get("authToken")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Unexpected("login response without authToken".into()))?;
        *self.token.lock() = Some(token.to_string());
        Ok(())
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<&Value>) -> ClientResult<Value> {
        let mut request = HttpRequest::new(method, self.url(path));
        if let Some(token) = self.token.lock().clone() {
            request = request.header("Authorization", token);
        }
        if let Some(body) = body {
            request = request.json(body.clone());
        }
        self.transport.send(request).await?.into_json()
    }

    /// Issue a request, re-authenticating once if the session expired
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> ClientResult<Value> {
        match self.send_once(method, path, body.as_ref()).await {
            Err(e) if e.is_not_authorized() => {
                let credentials = self.credentials.lock().clone();
                let Some((username, password)) = credentials else {
                    return Err(e);
                };
                debug!("LeftHand session expired, logging in again");
                self.authenticate(&username, &password).await?;
                self.send_once(method, path, body.as_ref()).await
            }
            other => other,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let value = self.request(Method::Get, path, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Look up a resource collection by name, expecting exactly one member
    async fn find_by_name<T: DeserializeOwned>(&self, collection: &str, name: &str) -> ClientResult<T> {
        let path = format!("/{}?name={}", collection, urlencoding::encode(name));
        let members: Vec<T> = members(self.request(Method::Get, &path, None).await?)?;
        members.into_iter().next().ok_or_else(|| ClientError::NotFound {
            message: format!("{} {} not found", collection, name),
        })
    }

    async fn action<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: u64,
        action: &str,
        parameters: Value,
    ) -> ClientResult<T> {
        let path = format!("/{}/{}", collection, id);
        let body = json!({ "action": action, "parameters": parameters });
        let value = self.request(Method::Post, &path, Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Decode the `members` array of a collection response
fn members<T: DeserializeOwned>(value: Value) -> ClientResult<Vec<T>> {
    match value.get("members") {
        Some(members) if !members.is_null() => Ok(serde_json::from_value(members.clone())?),
        _ => Ok(Vec::new()),
    }
}

/// Merge backend options into a JSON object
fn with_options(mut base: Map<String, Value>, options: &BackendOptions) -> ClientResult<Value> {
    for (key, value) in options {
        base.insert(key.clone(), serde_json::to_value(value)?);
    }
    Ok(Value::Object(base))
}

/// Trailing numeric id of a resource uri
fn id_from_uri(uri: &str) -> Option<u64> {
    uri.rsplit('/').next().and_then(|id| id.parse().ok())
}

#[async_trait]
impl LeftHandApi for LeftHandRestClient {
    async fn login(&self, username: &str, password: &str) -> ClientResult<()> {
        *self.credentials.lock() = Some((username.to_string(), password.to_string()));
        self.authenticate(username, password).await
    }

    async fn logout(&self) -> ClientResult<()> {
        let token = self.token.lock().take();
        *self.credentials.lock() = None;
        let Some(token) = token else {
            return Ok(());
        };
        let request = HttpRequest::new(
            Method::Delete,
            self.url(&format!("/credentials/{}", urlencoding::encode(&token))),
        )
        .header("Authorization", token);
        self.transport.send(request).await?.into_json().map(|_| ())
    }

    async fn get_api_version(&self) -> ClientResult<String> {
        let value = self.request(Method::Get, "/api", None).await?;
        value
            .pointer("/api/version")
            .or_else(|| value.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::Unexpected("API version missing from response".into()))
    }

    async fn get_cluster_by_name(&self, name: &str) -> ClientResult<Cluster> {
        self.find_by_name("clusters", name).await
    }

    async fn get_cluster(&self, id: u64) -> ClientResult<Cluster> {
        self.get(&format!("/clusters/{}", id)).await
    }

    async fn get_ip_from_cluster(&self, cluster_name: &str) -> ClientResult<String> {
        let cluster = self.get_cluster_by_name(cluster_name).await?;
        cluster
            .vip()
            .map(str::to_string)
            .ok_or_else(|| ClientError::NotFound {
                message: format!("cluster {} has no virtual IP", cluster_name),
            })
    }

    async fn create_volume(
        &self,
        name: &str,
        cluster_id: u64,
        size_bytes: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendVolume> {
        let mut base = Map::new();
        base.insert("name".into(), json!(name));
        base.insert("clusterId".into(), json!(cluster_id));
        base.insert("size".into(), json!(size_bytes));
        let body = with_options(base, options)?;

        let value = self.request(Method::Post, "/volumes", Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_volume(&self, id: u64, fields: &str) -> ClientResult<BackendVolume> {
        if fields.is_empty() {
            self.get(&format!("/volumes/{}", id)).await
        } else {
            self.get(&format!("/volumes/{}?{}", id, fields)).await
        }
    }

    async fn get_volume_by_name(&self, name: &str) -> ClientResult<BackendVolume> {
        self.find_by_name("volumes", name).await
    }

    async fn get_volumes(&self, cluster_name: &str) -> ClientResult<Vec<BackendVolume>> {
        let path = format!(
            "/volumes?fields=members[id],members[clusterName],members[size]&cluster={}",
            urlencoding::encode(cluster_name)
        );
        let volumes: Vec<BackendVolume> = members(self.request(Method::Get, &path, None).await?)?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.cluster_name.as_deref().map_or(true, |c| c == cluster_name))
            .collect())
    }

    async fn modify_volume(&self, id: u64, options: &BackendOptions) -> ClientResult<()> {
        let body = with_options(Map::new(), options)?;
        self.request(Method::Put, &format!("/volumes/{}", id), Some(body))
            .await
            .map(|_| ())
    }

    async fn delete_volume(&self, id: u64) -> ClientResult<()> {
        self.request(Method::Delete, &format!("/volumes/{}", id), None)
            .await
            .map(|_| ())
    }

    async fn clone_volume(&self, name: &str, source_id: u64) -> ClientResult<BackendVolume> {
        self.action("volumes", source_id, "cloneVolume", json!({ "name": name }))
            .await
    }

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: u64,
        options: &BackendOptions,
    ) -> ClientResult<BackendSnapshot> {
        let mut base = Map::new();
        base.insert("name".into(), json!(name));
        let parameters = with_options(base, options)?;
        self.action("volumes", volume_id, "createSnapshot", parameters)
            .await
    }

    async fn get_snapshot_by_name(&self, name: &str) -> ClientResult<BackendSnapshot> {
        self.find_by_name("snapshots", name).await
    }

    async fn get_snapshot_parent_volume(&self, snapshot_name: &str) -> ClientResult<BackendVolume> {
        let snapshot = self.get_snapshot_by_name(snapshot_name).await?;
        let volume_id = snapshot
            .volume
            .as_ref()
            .and_then(|v| id_from_uri(&v.uri))
            .ok_or_else(|| ClientError::NotFound {
                message: format!("parent volume of snapshot {} not found", snapshot_name),
            })?;
        self.get(&format!("/volumes/{}", volume_id)).await
    }

    async fn modify_snapshot(&self, id: u64, options: &BackendOptions) -> ClientResult<()> {
        let body = with_options(Map::new(), options)?;
        self.request(Method::Put, &format!("/snapshots/{}", id), Some(body))
            .await
            .map(|_| ())
    }

    async fn delete_snapshot(&self, id: u64) -> ClientResult<()> {
        self.request(Method::Delete, &format!("/snapshots/{}", id), None)
            .await
            .map(|_| ())
    }

    async fn clone_snapshot(&self, name: &str, snapshot_id: u64) -> ClientResult<BackendVolume> {
        self.action("snapshots", snapshot_id, "createSnapshotClone", json!({ "name": name }))
            .await
    }

    async fn get_server_by_name(&self, name: &str) -> ClientResult<Server> {
        self.find_by_name("servers", name).await
    }

    async fn create_server(
        &self,
        name: &str,
        iqn: &str,
        chap: Option<&ChapCredentials>,
    ) -> ClientResult<Server> {
        let mut body = json!({
            "name": name,
            "iscsiIQN": iqn,
            "iscsiEnabled": true,
            "chapAuthenticationRequired": chap.is_some(),
        });
        if let Some(chap) = chap {
            body["chapName"] = json!(chap.name);
            body["chapTargetSecret"] = json!(chap.secret);
        }
        let value = self.request(Method::Post, "/servers", Some(body)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn delete_server(&self, id: u64) -> ClientResult<()> {
        self.request(Method::Delete, &format!("/servers/{}", id), None)
            .await
            .map(|_| ())
    }

    async fn find_server_volumes(&self, server_name: &str) -> ClientResult<Vec<BackendVolume>> {
        let path = format!("/volumes?serverName={}", urlencoding::encode(server_name));
        members(self.request(Method::Get, &path, None).await?)
    }

    async fn add_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()> {
        self.action::<Value>(
            "volumes",
            volume_id,
            "addServerAccess",
            json!({ "serverID": server_id, "exclusiveAccess": true }),
        )
        .await
        .map(|_| ())
    }

    async fn remove_server_access(&self, volume_id: u64, server_id: u64) -> ClientResult<()> {
        self.action::<Value>(
            "volumes",
            volume_id,
            "removeServerAccess",
            json!({ "serverIDs": [server_id] }),
        )
        .await
        .map(|_| ())
    }

    async fn does_remote_snapshot_schedule_exist(&self, name: &str) -> ClientResult<bool> {
        self.cliq()?.schedule_exists(name).await
    }

    async fn create_remote_snapshot_schedule(
        &self,
        schedule: &RemoteSnapshotSchedule,
    ) -> ClientResult<()> {
        self.cliq()?.create_schedule(schedule).await
    }

    async fn start_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.cliq()?.start_schedule(name).await
    }

    async fn stop_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.cliq()?.stop_schedule(name).await
    }

    async fn delete_remote_snapshot_schedule(&self, name: &str) -> ClientResult<()> {
        self.cliq()?.delete_schedule(name).await
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens REST clients (with CLIQ shells) over a shared transport
pub struct RestConnector {
    transport: Arc<dyn HttpTransport>,
    runner: CommandRunnerRef,
    ssh_bin: String,
}

impl RestConnector {
    /// Create a new REST connector
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        runner: CommandRunnerRef,
        ssh_bin: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            runner,
            ssh_bin: ssh_bin.into(),
        }
    }
}

impl LeftHandConnector for RestConnector {
    fn connect(&self, endpoint: &LeftHandEndpoint) -> ClientResult<LeftHandClientRef> {
        if endpoint.ssh.private_key.is_none() {
            warn!(
                "No SSH private key configured for {}, CLIQ relies on the ssh agent",
                endpoint.ssh.host
            );
        }
        let cliq = CliqShell::new(self.runner.clone(), self.ssh_bin.clone(), endpoint.ssh.clone());
        let client = LeftHandRestClient::new(self.transport.clone(), endpoint.api_url.clone())
            .with_cliq(cliq);
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::http::testing::ScriptedTransport;
    use crate::domain::ports::OptionValue;
    use assert_matches::assert_matches;

    const BASE: &str = "https://10.10.0.141:8081/lhos";

    fn client(transport: Arc<ScriptedTransport>) -> LeftHandRestClient {
        LeftHandRestClient::new(transport, BASE)
    }

    #[tokio::test]
    async fn test_login_sets_authorization_header() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(201, json!({ "authToken": "tok-1" }))
            .respond(200, json!({ "members": [{ "id": 1, "name": "fakevolume" }] }));

        let client = client(transport.clone());
        client.login("foo1", "bar2").await.unwrap();
        let volume = client.get_volume_by_name("fakevolume").await.unwrap();
        assert_eq!(volume.id, 1);

        let requests = transport.requests();
        assert_eq!(requests[0].method, Method::Post);
        assert_eq!(requests[0].url, format!("{}/credentials", BASE));
        assert_eq!(requests[0].body, Some(json!({ "user": "foo1", "password": "bar2" })));
        assert_eq!(requests[1].url, format!("{}/volumes?name=fakevolume", BASE));
        assert!(requests[1]
            .headers
            .contains(&("Authorization".to_string(), "tok-1".to_string())));
    }

    #[tokio::test]
    async fn test_relogin_once_on_expired_session() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(201, json!({ "authToken": "tok-1" }))
            .respond(401, json!({ "message": "expired" }))
            .respond(201, json!({ "authToken": "tok-2" }))
            .respond(200, Value::Null);

        let client = client(transport.clone());
        client.login("foo1", "bar2").await.unwrap();
        client.delete_volume(7).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[3].method, Method::Delete);
        assert_eq!(requests[3].url, format!("{}/volumes/7", BASE));
        assert!(requests[3]
            .headers
            .contains(&("Authorization".to_string(), "tok-2".to_string())));
    }

    #[tokio::test]
    async fn test_second_auth_failure_surfaces() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(201, json!({ "authToken": "tok-1" }))
            .respond(401, Value::Null)
            .respond(201, json!({ "authToken": "tok-2" }))
            .respond(401, Value::Null);

        let client = client(transport.clone());
        client.login("foo1", "bar2").await.unwrap();
        assert_matches!(client.get_cluster(1).await, Err(ClientError::NotAuthorized));
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_lookup_by_name_not_found() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(200, json!({ "total": 0, "members": [] }));

        let err = client(transport).get_server_by_name("fakehost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_volume_body() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(200, json!({ "id": 1, "iscsiIqn": "iqn.x" }));

        let mut options = BackendOptions::new();
        options.insert("isThinProvisioned".into(), OptionValue::Bool(true));
        options.insert("clusterName".into(), "CloudCluster1".into());

        let volume = client(transport.clone())
            .create_volume("fakevolume", 1, crate::domain::GIB, &options)
            .await
            .unwrap();
        assert_eq!(volume.iscsi_iqn.as_deref(), Some("iqn.x"));

        let body = transport.requests()[0].body.clone().unwrap();
        assert_eq!(
            body,
            json!({
                "name": "fakevolume",
                "clusterId": 1,
                "size": crate::domain::GIB,
                "isThinProvisioned": true,
                "clusterName": "CloudCluster1",
            })
        );
    }

    #[tokio::test]
    async fn test_snapshot_parent_volume() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .respond(200, json!({ "members": [{ "id": 3, "volume": { "uri": "/lhos/volumes/11" } }] }))
            .respond(200, json!({ "id": 11, "name": "volume-111" }));

        let parent = client(transport.clone())
            .get_snapshot_parent_volume("fakesnapshot")
            .await
            .unwrap();
        assert_eq!(parent.name, "volume-111");
        assert_eq!(transport.requests()[1].url, format!("{}/volumes/11", BASE));
    }

    #[tokio::test]
    async fn test_schedules_require_cliq() {
        let transport = Arc::new(ScriptedTransport::new());
        assert_matches!(
            client(transport).stop_remote_snapshot_schedule("v_SCHED_Pri").await,
            Err(ClientError::Unexpected(_))
        );
    }
}

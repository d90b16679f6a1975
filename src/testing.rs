//! Testing utilities: an in-process source plugin.
//!
//! [`LegacyPlugin`] is the plugin side of the source protocol, and
//! [`serve_plugin`] turns an implementation into a plugin binary: it checks
//! the magic cookie, prints the handshake line, and answers frames until the
//! bridge sends `shutdown`. [`spawn_plugin`] serves the same implementation
//! inside a test, for use with [`PluginSession::attach`].
//!
//! [`MockPlugin`] is a small in-memory provider (`mock_instance` resources
//! and a `mock_image` data source) used by the crate's own tests and by the
//! `terraform-provider-mock` binary.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_bridge::testing::{spawn_plugin, MockPlugin};
//! use hemmer_provider_bridge::{BridgeOptions, PluginSession};
//!
//! #[tokio::test]
//! async fn test_against_mock() {
//!     let server = spawn_plugin(MockPlugin::new()).await.unwrap();
//!     let session = PluginSession::attach("mock", server.address(), &BridgeOptions::new())
//!         .await
//!         .unwrap();
//!     assert!(session.schema().resources.contains_key("mock_instance"));
//!     server.shutdown().await;
//! }
//! ```
//!
//! [`PluginSession::attach`]: crate::plugin::PluginSession::attach

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Attributes;
use crate::protocol::{
    read_frame, write_frame, Capabilities, ConfigureParams, CreateParams, DataSourceResult,
    GetSchemaResult, Handshake, InstanceParams, InstanceResult, Method, RemoteError, Request,
    Response, UpdateParams,
};
use crate::schema::{PropertyShape, ProviderSchema, ResourceSchema, ShapeFlags, ShapeKind};
use crate::server::wait_for_shutdown_signal;
use crate::types::{CheckFailure, DiffResult, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};

/// The plugin side of the source protocol.
#[async_trait::async_trait]
pub trait LegacyPlugin: Send + Sync + 'static {
    /// The provider schema reported during the handshake.
    fn schema(&self) -> ProviderSchema;

    /// Optional protocol features.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Configure the provider.
    async fn configure(&self, config: Attributes) -> Result<(), RemoteError>;

    /// Create a resource, returning its id and state.
    async fn create(
        &self,
        type_name: &str,
        attributes: Attributes,
    ) -> Result<InstanceResult, RemoteError>;

    /// Refresh a resource. `None` means it no longer exists.
    async fn read(
        &self,
        type_name: &str,
        id: &str,
        attributes: Attributes,
    ) -> Result<Option<InstanceResult>, RemoteError>;

    /// Update a resource in place.
    async fn update(
        &self,
        type_name: &str,
        id: &str,
        old: Attributes,
        new: Attributes,
    ) -> Result<InstanceResult, RemoteError>;

    /// Delete a resource.
    async fn delete(&self, type_name: &str, id: &str, attributes: Attributes)
        -> Result<(), RemoteError>;

    /// Read a data source.
    async fn read_data_source(
        &self,
        type_name: &str,
        attributes: Attributes,
    ) -> Result<Attributes, RemoteError> {
        let _ = attributes;
        Err(RemoteError::new(format!(
            "unknown data source type '{}'",
            type_name
        )))
    }

    /// Abandon in-flight work.
    async fn stop(&self) {}
}

/// Serve `plugin` as a plugin binary.
///
/// Refuses to run without the magic cookie in the environment. Prints the
/// handshake line on stdout, then serves until the bridge sends `shutdown`
/// or the process receives SIGTERM/SIGINT.
pub async fn serve_plugin<P: LegacyPlugin>(plugin: P) -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err("this binary is a plugin and is not meant to be executed directly".into());
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", Handshake::line(addr))?;
    stdout.flush()?;
    info!(address = %addr, "Plugin listening");

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        on_signal.cancel();
    });

    serve_plugin_on_listener(Arc::new(plugin), listener, shutdown).await;
    info!("Plugin shutdown complete");
    Ok(())
}

/// Serve `plugin` on an already-bound listener until `shutdown` is cancelled.
///
/// A `shutdown` request cancels the token too. Requests on one connection
/// are handled concurrently so that `stop` can reach a busy plugin.
pub async fn serve_plugin_on_listener<P: LegacyPlugin>(
    plugin: Arc<P>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Bridge connected");
                    connections.spawn(serve_connection(
                        Arc::clone(&plugin),
                        stream,
                        shutdown.clone(),
                    ));
                },
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection<P: LegacyPlugin>(
    plugin: Arc<P>,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let (responses, mut outbox) = mpsc::channel::<Response>(16);

    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                response = outbox.recv() => match response {
                    Some(response) => {
                        if let Err(e) = write_frame(&mut write, &response).await {
                            debug!(error = %e, "Failed to write response");
                            break;
                        }
                    },
                    None => break,
                },
                _ = writer_shutdown.cancelled() => break,
            }
        }
    });

    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame::<_, Request>(&mut reader) => match frame {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Unreadable request");
                    break;
                },
            },
        };

        let plugin = Arc::clone(&plugin);
        let responses = responses.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let id = request.id;
            let method = request.method;
            let response = match dispatch(plugin.as_ref(), request).await {
                Ok(result) => Response::ok(id, result),
                Err(error) => Response::err(id, error),
            };
            let _ = responses.send(response).await;
            if method == Method::Shutdown {
                shutdown.cancel();
            }
        });
    }

    drop(responses);
    let _ = writer.await;
}

async fn dispatch<P: LegacyPlugin>(
    plugin: &P,
    request: Request,
) -> Result<serde_json::Value, RemoteError> {
    match request.method {
        Method::GetSchema => to_result(GetSchemaResult {
            schema: plugin.schema(),
            capabilities: plugin.capabilities(),
        }),
        Method::Configure => {
            let params: ConfigureParams = from_params(request.params)?;
            plugin.configure(params.config).await?;
            Ok(serde_json::Value::Null)
        },
        Method::Create => {
            let params: CreateParams = from_params(request.params)?;
            to_result(plugin.create(&params.type_name, params.attributes).await?)
        },
        Method::Read => {
            let params: InstanceParams = from_params(request.params)?;
            match plugin
                .read(&params.type_name, &params.id, params.attributes)
                .await?
            {
                Some(instance) => to_result(instance),
                None => Ok(serde_json::Value::Null),
            }
        },
        Method::Update => {
            let params: UpdateParams = from_params(request.params)?;
            to_result(
                plugin
                    .update(&params.type_name, &params.id, params.old, params.new)
                    .await?,
            )
        },
        Method::Delete => {
            let params: InstanceParams = from_params(request.params)?;
            plugin
                .delete(&params.type_name, &params.id, params.attributes)
                .await?;
            Ok(serde_json::Value::Null)
        },
        Method::ReadDataSource => {
            let params: CreateParams = from_params(request.params)?;
            let attributes = plugin
                .read_data_source(&params.type_name, params.attributes)
                .await?;
            to_result(DataSourceResult { attributes })
        },
        Method::Stop => {
            plugin.stop().await;
            Ok(serde_json::Value::Null)
        },
        Method::Shutdown => Ok(serde_json::Value::Null),
    }
}

fn from_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, RemoteError> {
    serde_json::from_value(params).map_err(|e| RemoteError::new(format!("invalid params: {}", e)))
}

fn to_result<T: Serialize>(value: T) -> Result<serde_json::Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::new(e.to_string()))
}

/// A plugin served inside the current process.
#[derive(Debug)]
pub struct PluginServer {
    address: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PluginServer {
    /// Where the plugin listens.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stop serving and drop every open connection.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Serve `plugin` on an ephemeral local port in the background.
pub async fn spawn_plugin<P: LegacyPlugin>(plugin: P) -> std::io::Result<PluginServer> {
    spawn_plugin_shared(Arc::new(plugin)).await
}

/// Like [`spawn_plugin`], keeping a handle on the plugin.
pub async fn spawn_plugin_shared<P: LegacyPlugin>(plugin: Arc<P>) -> std::io::Result<PluginServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(serve_plugin_on_listener(plugin, listener, shutdown.clone()));
    Ok(PluginServer {
        address,
        shutdown,
        task,
    })
}

// =========================================================================
// Mock provider
// =========================================================================

/// Environment variable adding latency to every mock resource operation.
pub const MOCK_LATENCY_ENV: &str = "MOCK_PLUGIN_LATENCY_MS";

/// The schema of the mock provider.
pub fn mock_schema() -> ProviderSchema {
    ProviderSchema::new()
        .with_provider_config(
            ResourceSchema::v0()
                .with_property(
                    "region",
                    PropertyShape::required_string().with_description("Region to manage"),
                )
                .with_property("access_key", PropertyShape::optional_string().sensitive()),
        )
        .with_resource(
            "mock_instance",
            ResourceSchema::v0()
                .with_description("A virtual machine")
                .with_property("ami", PropertyShape::required_string().with_force_new())
                .with_property(
                    "instance_type",
                    PropertyShape::new(ShapeKind::String, ShapeFlags::optional_computed()),
                )
                .with_property(
                    "tags",
                    PropertyShape::new(ShapeKind::set(ShapeKind::String), ShapeFlags::optional()),
                )
                .with_property(
                    "security_groups",
                    PropertyShape::new(ShapeKind::list(ShapeKind::String), ShapeFlags::optional()),
                )
                .with_property("public_ip", PropertyShape::computed_string())
                .with_property("password", PropertyShape::optional_string().sensitive())
                .with_dependents("ami", ["public_ip"]),
        )
        .with_data_source(
            "mock_image",
            ResourceSchema::v0()
                .with_property("name", PropertyShape::required_string())
                .with_property("id", PropertyShape::computed_string())
                .with_property(
                    "architecture",
                    PropertyShape::new(ShapeKind::String, ShapeFlags::optional_computed()),
                ),
        )
}

#[derive(Debug, Default)]
struct MockStore {
    config: Option<Attributes>,
    instances: std::collections::BTreeMap<String, Attributes>,
    created: u64,
}

impl MockStore {
    fn require_configured(&self) -> Result<(), RemoteError> {
        match self.config {
            Some(_) => Ok(()),
            None => Err(RemoteError::new("provider not configured")),
        }
    }
}

/// An in-memory provider speaking the source protocol.
#[derive(Debug)]
pub struct MockPlugin {
    store: Mutex<MockStore>,
    configure_calls: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    latency: Duration,
    halt: Mutex<CancellationToken>,
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlugin {
    /// A mock with no latency.
    pub fn new() -> Self {
        Self {
            store: Mutex::new(MockStore::default()),
            configure_calls: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
            latency: Duration::ZERO,
            halt: Mutex::new(CancellationToken::new()),
        }
    }

    /// A mock configured from [`MOCK_LATENCY_ENV`].
    pub fn from_env() -> Self {
        let latency = std::env::var(MOCK_LATENCY_ENV)
            .ok()
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        Self::new().with_latency(latency)
    }

    /// Delay every resource operation by `latency`. `stop` cuts the delay short.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Counts `configure` calls.
    pub fn configure_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.configure_calls)
    }

    /// Counts `stop` calls.
    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stops)
    }

    async fn pause(&self) -> Result<(), RemoteError> {
        if self.latency.is_zero() {
            return Ok(());
        }
        let halt = self.halt.lock().await.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.latency) => Ok(()),
            _ = halt.cancelled() => Err(RemoteError::new("operation stopped")),
        }
    }
}

fn require_instance_type(type_name: &str) -> Result<(), RemoteError> {
    if type_name == "mock_instance" {
        Ok(())
    } else {
        Err(RemoteError::new(format!(
            "unknown resource type '{}'",
            type_name
        )))
    }
}

fn required<'a>(attributes: &'a Attributes, name: &str) -> Result<&'a str, RemoteError> {
    attributes
        .get(name)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| RemoteError::new(format!("{} is required", name)))
}

#[async_trait::async_trait]
impl LegacyPlugin for MockPlugin {
    fn schema(&self) -> ProviderSchema {
        mock_schema()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { cancel: true }
    }

    async fn configure(&self, config: Attributes) -> Result<(), RemoteError> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        let region = required(&config, "region")?;
        info!(region, access_key = ?config.get("access_key"), "Configuring mock provider");
        self.store.lock().await.config = Some(config);
        Ok(())
    }

    async fn create(
        &self,
        type_name: &str,
        mut attributes: Attributes,
    ) -> Result<InstanceResult, RemoteError> {
        require_instance_type(type_name)?;
        self.pause().await?;
        let mut store = self.store.lock().await;
        store.require_configured()?;
        required(&attributes, "ami")?;

        store.created += 1;
        let n = store.created;
        let id = format!("i-{}", n);
        attributes.insert("public_ip".into(), format!("10.0.0.{}", n));
        attributes
            .entry("instance_type".into())
            .or_insert_with(|| "t2.micro".into());
        store.instances.insert(id.clone(), attributes.clone());
        Ok(InstanceResult { id, attributes })
    }

    async fn read(
        &self,
        type_name: &str,
        id: &str,
        _attributes: Attributes,
    ) -> Result<Option<InstanceResult>, RemoteError> {
        require_instance_type(type_name)?;
        self.pause().await?;
        let store = self.store.lock().await;
        store.require_configured()?;
        Ok(store.instances.get(id).map(|attributes| InstanceResult {
            id: id.to_string(),
            attributes: attributes.clone(),
        }))
    }

    async fn update(
        &self,
        type_name: &str,
        id: &str,
        _old: Attributes,
        mut new: Attributes,
    ) -> Result<InstanceResult, RemoteError> {
        require_instance_type(type_name)?;
        self.pause().await?;
        let mut store = self.store.lock().await;
        store.require_configured()?;
        let current = store
            .instances
            .get(id)
            .ok_or_else(|| RemoteError::not_found(format!("instance {} not found", id)))?;
        if current.get("ami") != new.get("ami") {
            return Err(RemoteError::new("ami cannot be changed in place"));
        }
        if let Some(ip) = current.get("public_ip") {
            new.insert("public_ip".into(), ip.clone());
        }
        new.entry("instance_type".into())
            .or_insert_with(|| "t2.micro".into());
        store.instances.insert(id.to_string(), new.clone());
        Ok(InstanceResult {
            id: id.to_string(),
            attributes: new,
        })
    }

    async fn delete(
        &self,
        type_name: &str,
        id: &str,
        _attributes: Attributes,
    ) -> Result<(), RemoteError> {
        require_instance_type(type_name)?;
        self.pause().await?;
        let mut store = self.store.lock().await;
        store.require_configured()?;
        store.instances.remove(id);
        Ok(())
    }

    async fn read_data_source(
        &self,
        type_name: &str,
        mut attributes: Attributes,
    ) -> Result<Attributes, RemoteError> {
        if type_name != "mock_image" {
            return Err(RemoteError::new(format!(
                "unknown data source type '{}'",
                type_name
            )));
        }
        self.store.lock().await.require_configured()?;
        let id = format!("ami-{}", required(&attributes, "name")?);
        attributes.insert("id".into(), id);
        attributes
            .entry("architecture".into())
            .or_insert_with(|| "x86_64".into());
        Ok(attributes)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let mut halt = self.halt.lock().await;
        halt.cancel();
        *halt = CancellationToken::new();
    }
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that a diff has no changes.
///
/// # Panics
///
/// Panics if the diff has any changes.
pub fn assert_diff_no_changes(diff: &DiffResult) {
    assert!(
        diff.changes.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        diff.changes.len(),
        diff.changes
    );
}

/// Assert that a diff changes `path`.
///
/// # Panics
///
/// Panics if `path` is not among the changes.
pub fn assert_diff_changes(diff: &DiffResult, path: &str) {
    assert!(
        diff.changes.iter().any(|c| c == path),
        "Expected diff to change '{}', but it was not changed. Changes: {:?}",
        path,
        diff.changes
    );
}

/// Assert that a diff replaces the resource because of `path`.
///
/// # Panics
///
/// Panics if `path` is not among the replacement paths.
pub fn assert_diff_replaces(diff: &DiffResult, path: &str) {
    assert!(
        diff.replaces.iter().any(|r| r == path),
        "Expected '{}' to require replacement. Replaces: {:?}",
        path,
        diff.replaces
    );
}

/// Assert that a diff updates in place.
///
/// # Panics
///
/// Panics if the diff requires replacement.
pub fn assert_diff_updates_in_place(diff: &DiffResult) {
    assert!(
        !diff.requires_replace(),
        "Expected diff to update in place, but it replaces {:?}",
        diff.replaces
    );
}

/// Assert that a check produced no failures.
///
/// # Panics
///
/// Panics if there are any failures.
pub fn assert_no_failures(failures: &[CheckFailure]) {
    assert!(
        failures.is_empty(),
        "Expected no failures, but got {} failure(s): {:?}",
        failures.len(),
        failures
    );
}

/// Assert that a check produced a failure for `property`.
///
/// # Panics
///
/// Panics if no failure names `property`.
pub fn assert_failure_for(failures: &[CheckFailure], property: &str) {
    assert!(
        failures.iter().any(|f| f.property == property),
        "Expected a failure for '{}'. Failures: {:?}",
        property,
        failures
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{CallContext, PluginSession};
    use crate::bridge::BridgeOptions;

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_mock_requires_configuration() {
        let mock = MockPlugin::new();
        let err = mock
            .create("mock_instance", attrs(&[("ami", "ami-1")]))
            .await
            .unwrap_err();
        assert_eq!(err.message, "provider not configured");

        let err = mock.configure(Attributes::new()).await.unwrap_err();
        assert_eq!(err.message, "region is required");
        assert_eq!(mock.configure_counter().load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_crud() {
        let mock = MockPlugin::new();
        mock.configure(attrs(&[("region", "us-east-1")]))
            .await
            .unwrap();

        let created = mock
            .create("mock_instance", attrs(&[("ami", "ami-1")]))
            .await
            .unwrap();
        assert_eq!(created.id, "i-1");
        assert_eq!(created.attributes["public_ip"], "10.0.0.1");
        assert_eq!(created.attributes["instance_type"], "t2.micro");

        let updated = mock
            .update(
                "mock_instance",
                "i-1",
                created.attributes.clone(),
                attrs(&[("ami", "ami-1"), ("instance_type", "t3.large")]),
            )
            .await
            .unwrap();
        assert_eq!(updated.attributes["instance_type"], "t3.large");
        assert_eq!(updated.attributes["public_ip"], "10.0.0.1");

        let read = mock
            .read("mock_instance", "i-1", Attributes::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.attributes, updated.attributes);

        mock.delete("mock_instance", "i-1", Attributes::new())
            .await
            .unwrap();
        assert!(mock
            .read("mock_instance", "i-1", Attributes::new())
            .await
            .unwrap()
            .is_none());

        let err = mock
            .update("mock_instance", "i-1", Attributes::new(), attrs(&[("ami", "ami-1")]))
            .await
            .unwrap_err();
        assert!(err.not_found);
    }

    #[tokio::test]
    async fn test_mock_data_source() {
        let mock = MockPlugin::new();
        mock.configure(attrs(&[("region", "eu-west-1")]))
            .await
            .unwrap();
        let out = mock
            .read_data_source("mock_image", attrs(&[("name", "ubuntu")]))
            .await
            .unwrap();
        assert_eq!(out["id"], "ami-ubuntu");
        assert_eq!(out["architecture"], "x86_64");

        assert!(mock
            .read_data_source("mock_other", Attributes::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stop_interrupts_latency() {
        let mock = Arc::new(MockPlugin::new().with_latency(Duration::from_secs(10)));
        mock.configure(attrs(&[("region", "us-east-1")]))
            .await
            .unwrap();

        let busy = Arc::clone(&mock);
        let create = tokio::spawn(async move {
            busy.create("mock_instance", attrs(&[("ami", "ami-1")]))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        mock.stop().await;

        let err = create.await.unwrap().unwrap_err();
        assert_eq!(err.message, "operation stopped");
        assert_eq!(mock.stop_counter().load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_served_plugin_answers_requests() {
        let mock = Arc::new(MockPlugin::new());
        let server = spawn_plugin_shared(Arc::clone(&mock)).await.unwrap();
        let session = PluginSession::attach("mock", server.address(), &BridgeOptions::new())
            .await
            .unwrap();
        let ctx = CallContext::new();

        session
            .call_typed::<_, serde_json::Value>(
                &ctx,
                Method::Configure,
                &ConfigureParams {
                    config: attrs(&[("region", "us-east-1")]),
                },
            )
            .await
            .unwrap();
        assert_eq!(mock.configure_counter().load(Ordering::SeqCst), 1);

        let read = session
            .request(
                &ctx,
                Method::Read,
                serde_json::to_value(InstanceParams {
                    type_name: "mock_instance".into(),
                    id: "i-404".into(),
                    attributes: Attributes::new(),
                })
                .unwrap(),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(read.is_null());

        session.terminate().await;
        server.shutdown().await;
    }

    #[test]
    fn test_assert_helpers() {
        let diff = DiffResult {
            changes: vec!["ami".into(), "publicIp".into()],
            replaces: vec!["ami".into()],
            stables: vec![],
            replacement_order: Default::default(),
        };
        assert_diff_changes(&diff, "ami");
        assert_diff_replaces(&diff, "ami");
        assert_diff_no_changes(&DiffResult::default());
        assert_diff_updates_in_place(&DiffResult::default());
        assert_no_failures(&[]);
        assert_failure_for(&[CheckFailure::new("ami", "required")], "ami");
    }

    #[test]
    #[should_panic(expected = "Expected no failures")]
    fn test_assert_no_failures_fails() {
        assert_no_failures(&[CheckFailure::new("ami", "required")]);
    }
}

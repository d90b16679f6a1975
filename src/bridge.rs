//! The provider bridge: the typed resource RPC surface over a source plugin.
//!
//! A [`ProviderBridge`] owns at most one live [`PluginSession`] together with
//! the [`SchemaRegistry`] built from the schema that session negotiated.
//! Every operation translates structured values with the entity's
//! [`StateCodec`](crate::codec::StateCodec) and forwards to the plugin.
//!
//! # Configure gate
//!
//! Resource and function calls need a configured provider. The gate is a
//! `watch` channel:
//!
//! - `Unconfigured`: calls fail with [`BridgeError::NotConfigured`].
//! - `Configuring`: calls wait for the outcome.
//! - `Configured`: calls proceed.
//!
//! Configure launches the plugin on first use, and relaunches it when the
//! previous session terminated. Repeating Configure with the same
//! configuration is a no-op; a different configuration is rejected.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{mark_unknown_computed, preview_create, upgrade};
use crate::diff::DiffEngine;
use crate::error::BridgeError;
use crate::logging::PluginLogGate;
use crate::mapping::ProviderInfo;
use crate::plugin::{CallContext, PluginSession, SessionState};
use crate::protocol::{
    ConfigureParams, CreateParams, DataSourceResult, InstanceParams, InstanceResult, Method,
    UpdateParams,
};
use crate::registry::{Binding, EntityDocs, EntityKind, SchemaRegistry};
use crate::schema::ProviderSchema;
use crate::types::{
    CheckFailure, CheckResult, DiffResult, InvokeResult, ReplacementOrder, ResourceState, Urn,
};
use crate::validation::validate;
use crate::value::{PropertyMap, PropertyValue};

/// Options for launching and talking to the plugin.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Binary name prefix; the plugin for module `m` is `<prefix>-m`.
    /// Default: `terraform-provider`.
    pub plugin_prefix: String,
    /// Directories searched for the plugin binary, in order. `PATH` is used
    /// when empty.
    pub search_path: Vec<PathBuf>,
    /// Connect to a plugin already listening here instead of launching one.
    pub attach_address: Option<SocketAddr>,
    /// How long a plugin may take to print its handshake and report its
    /// schema. Default: 10 seconds.
    pub handshake_timeout: Duration,
    /// Upper bound on any single plugin call. Default: 5 minutes.
    pub call_timeout: Option<Duration>,
    /// How long a plugin gets to exit after `shutdown` before it is killed.
    /// Default: 5 seconds.
    pub shutdown_grace: Duration,
    /// Replacement order for resources that declare none.
    pub default_replacement_order: ReplacementOrder,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            plugin_prefix: "terraform-provider".to_string(),
            search_path: Vec::new(),
            attach_address: None,
            handshake_timeout: Duration::from_secs(10),
            call_timeout: Some(Duration::from_secs(300)),
            shutdown_grace: Duration::from_secs(5),
            default_replacement_order: ReplacementOrder::CreateBeforeDelete,
        }
    }
}

impl BridgeOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the binary name prefix.
    pub fn with_plugin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.plugin_prefix = prefix.into();
        self
    }

    /// Append a directory to the search path.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_path.push(dir.into());
        self
    }

    /// Attach to a running plugin instead of launching one.
    pub fn with_attach_address(mut self, address: SocketAddr) -> Self {
        self.attach_address = Some(address);
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the default replacement order.
    pub fn with_default_replacement_order(mut self, order: ReplacementOrder) -> Self {
        self.default_replacement_order = order;
        self
    }
}

/// State of the configure gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No configuration has been applied.
    Unconfigured,
    /// A Configure call is in progress.
    Configuring,
    /// The provider is configured.
    Configured,
}

struct Live {
    session: PluginSession,
    registry: SchemaRegistry,
}

/// Resets the gate if a Configure call is dropped midway.
struct GateReset<'a> {
    gate: &'a watch::Sender<GateState>,
    armed: bool,
}

impl Drop for GateReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.send_replace(GateState::Unconfigured);
        }
    }
}

/// Serves one source plugin as a typed resource provider.
pub struct ProviderBridge {
    module: String,
    info: ProviderInfo,
    options: BridgeOptions,
    docs: Vec<(EntityKind, String, EntityDocs)>,
    gate: watch::Sender<GateState>,
    live: RwLock<Option<Arc<Live>>>,
    applied: Mutex<Option<PropertyValue>>,
    logs: PluginLogGate,
    engine: DiffEngine,
}

impl ProviderBridge {
    /// Create a bridge for plugin `module`. Nothing is launched until
    /// [`ProviderBridge::configure`].
    pub fn new(module: impl Into<String>, info: ProviderInfo, options: BridgeOptions) -> Self {
        let (gate, _) = watch::channel(GateState::Unconfigured);
        Self {
            module: module.into(),
            info,
            engine: DiffEngine::new(options.default_replacement_order),
            options,
            docs: Vec::new(),
            gate,
            live: RwLock::new(None),
            applied: Mutex::new(None),
            logs: PluginLogGate::new(),
        }
    }

    /// Overlay documentation on an entity once its schema is known.
    pub fn with_docs(
        mut self,
        kind: EntityKind,
        identifier: impl Into<String>,
        docs: EntityDocs,
    ) -> Self {
        self.docs.push((kind, identifier.into(), docs));
        self
    }

    /// The module name.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The options in effect.
    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// The configure gate.
    pub fn gate_state(&self) -> GateState {
        *self.gate.borrow()
    }

    /// The live session's lifecycle state, if a session exists.
    pub async fn session_state(&self) -> Option<SessionState> {
        self.current().await.map(|live| live.session.state())
    }

    /// The plugin's process id, if this bridge launched one.
    pub async fn plugin_pid(&self) -> Option<u32> {
        self.current().await.and_then(|live| live.session.pid())
    }

    /// The schema the live session negotiated.
    pub async fn source_schema(&self) -> Option<ProviderSchema> {
        self.current()
            .await
            .map(|live| live.session.schema().clone())
    }

    /// Target tokens of every bound resource and function.
    pub async fn tokens(&self) -> (Vec<String>, Vec<String>) {
        match self.current().await {
            Some(live) => (
                live.registry.resource_tokens().map(String::from).collect(),
                live.registry.function_tokens().map(String::from).collect(),
            ),
            None => (Vec::new(), Vec::new()),
        }
    }

    async fn current(&self) -> Option<Arc<Live>> {
        self.live.read().await.clone()
    }

    async fn settled_gate(&self, ctx: &CallContext, op: &str) -> Result<GateState, BridgeError> {
        let mut gate = self.gate.subscribe();
        ctx.run(op, async {
            gate.wait_for(|state| *state != GateState::Configuring)
                .await
                .map(|state| *state)
                .map_err(|_| BridgeError::NotConfigured(format!("{} requires a configured provider", op)))
        })
        .await
    }

    /// The live session, once the gate has settled on `Configured`.
    async fn configured(&self, ctx: &CallContext, op: &str) -> Result<Arc<Live>, BridgeError> {
        let not_configured =
            || BridgeError::NotConfigured(format!("{} requires a configured provider", op));
        if self.settled_gate(ctx, op).await? != GateState::Configured {
            return Err(not_configured());
        }
        self.current().await.ok_or_else(not_configured)
    }

    /// The live registry, for operations that never reach the plugin.
    async fn registry(&self, ctx: &CallContext, op: &str) -> Result<Arc<Live>, BridgeError> {
        self.settled_gate(ctx, op).await?;
        self.current().await.ok_or_else(|| {
            BridgeError::NotConfigured(format!(
                "{} requires the provider schema; configure the provider first",
                op
            ))
        })
    }

    /// Configure the provider, launching the plugin if needed.
    pub async fn configure(
        &self,
        ctx: &CallContext,
        config: PropertyValue,
    ) -> Result<(), BridgeError> {
        let mut applied = self.applied.lock().await;

        let gate = self.gate_state();
        if gate == GateState::Configured {
            let configured = self
                .current()
                .await
                .is_some_and(|live| live.session.state() == SessionState::Configured);
            if configured {
                return match applied.as_ref() {
                    Some(previous) if previous.semantically_eq(&config) => {
                        debug!(plugin = %self.module, "Provider already configured");
                        Ok(())
                    },
                    _ => Err(BridgeError::Configuration(
                        "provider is already configured with a different configuration".into(),
                    )),
                };
            }
        }

        self.gate.send_replace(GateState::Configuring);
        let mut reset = GateReset {
            gate: &self.gate,
            armed: true,
        };
        let result = self.apply_config(ctx, &config).await;
        reset.armed = false;

        match result {
            Ok(()) => {
                *applied = Some(config);
                self.gate.send_replace(GateState::Configured);
                info!(plugin = %self.module, "Provider configured");
                Ok(())
            },
            Err(e) => {
                *applied = None;
                self.gate.send_replace(GateState::Unconfigured);
                warn!(plugin = %self.module, error = %e, "Configure failed");
                Err(e)
            },
        }
    }

    async fn apply_config(&self, ctx: &CallContext, config: &PropertyValue) -> Result<(), BridgeError> {
        let live = self.ensure_session(ctx).await?;
        let binding = live.registry.config();

        let config = apply_defaults(binding, config, None);
        let failures: Vec<String> = error_failures(binding, &config)
            .into_iter()
            .map(|f| match f.property.is_empty() {
                true => f.reason,
                false => format!("{}: {}", f.property, f.reason),
            })
            .collect();
        if !failures.is_empty() {
            return Err(BridgeError::Configuration(failures.join("; ")));
        }
        let encoded = binding
            .codec()
            .encode(&config)
            .map_err(|e| BridgeError::Configuration(e.to_string()))?;

        let _muted = self.logs.mute();
        let params = ConfigureParams {
            config: encoded.attributes,
        };
        match live
            .session
            .call_typed::<_, serde_json::Value>(ctx, Method::Configure, &params)
            .await
        {
            Ok(_) => {},
            Err(BridgeError::Plugin(message)) => return Err(BridgeError::Configuration(message)),
            Err(e) => return Err(e),
        }
        live.session.mark_configured()
    }

    async fn ensure_session(&self, ctx: &CallContext) -> Result<Arc<Live>, BridgeError> {
        if let Some(live) = self.current().await {
            if live.session.state() != SessionState::Terminated {
                return Ok(live);
            }
            debug!(plugin = %self.module, "Previous session terminated, relaunching");
            live.session.terminate().await;
        }

        let session = ctx
            .run("launch", async {
                match self.options.attach_address {
                    Some(address) => PluginSession::attach(&self.module, address, &self.options).await,
                    None => {
                        PluginSession::launch(&self.module, &self.options, self.logs.clone()).await
                    },
                }
            })
            .await?;

        let mut registry = SchemaRegistry::new(self.info.clone(), session.schema().clone());
        for (kind, identifier, docs) in &self.docs {
            if let Err(e) = registry.apply_docs(*kind, identifier, docs) {
                warn!(identifier = %identifier, error = %e, "Skipping documentation");
            }
        }

        let live = Arc::new(Live { session, registry });
        *self.live.write().await = Some(Arc::clone(&live));
        Ok(live)
    }

    /// Apply defaults and validate resource inputs. Failures are collected,
    /// never raised.
    pub async fn check(
        &self,
        ctx: &CallContext,
        urn: &str,
        olds: &PropertyValue,
        news: &PropertyValue,
    ) -> Result<CheckResult, BridgeError> {
        let urn = Urn::parse(urn)?;
        let live = self.registry(ctx, "check").await?;
        let binding = live.registry.resource(&urn.resource_type)?;

        let inputs = apply_defaults(binding, news, Some(olds));
        let mut failures = error_failures(binding, &inputs);
        if !failures.is_empty() {
            return Ok(CheckResult { inputs, failures });
        }
        match binding.codec().normalize(&inputs) {
            Ok(inputs) => Ok(CheckResult { inputs, failures }),
            Err(e) => {
                failures.push(translation_failure(e));
                Ok(CheckResult { inputs, failures })
            },
        }
    }

    /// Compare a resource's old state with new inputs.
    pub async fn diff(
        &self,
        ctx: &CallContext,
        urn: &str,
        old_state: &PropertyValue,
        news: &PropertyValue,
        schema_version: u64,
    ) -> Result<DiffResult, BridgeError> {
        let urn = Urn::parse(urn)?;
        let live = self.registry(ctx, "diff").await?;
        let binding = live.registry.resource(&urn.resource_type)?;
        let codec = binding.codec();

        let olds = upgrade(
            old_state.clone(),
            schema_version,
            binding.target.version,
            &binding.upgrades,
        )?;
        let olds = codec.normalize(&olds)?;
        let news = codec.normalize(news)?;
        Ok(self.engine.compute(&olds, &news, &binding.target))
    }

    /// Create a resource. A preview returns the inputs with every computed
    /// property unknown and never reaches the plugin.
    pub async fn create(
        &self,
        ctx: &CallContext,
        urn: &str,
        news: &PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError> {
        let urn = Urn::parse(urn)?;
        if preview {
            let live = self.registry(ctx, "create").await?;
            let binding = live.registry.resource(&urn.resource_type)?;
            let inputs = binding.codec().normalize(news)?;
            return Ok(ResourceState::new(
                "",
                binding.token.clone(),
                preview_create(&binding.target, &inputs),
                binding.target.version,
            ));
        }

        let live = self.configured(ctx, "create").await?;
        let binding = live.registry.resource(&urn.resource_type)?;
        let codec = binding.codec();
        let encoded = codec.encode(news)?;
        let params = CreateParams {
            type_name: binding.source_type.clone(),
            attributes: encoded.attributes,
        };
        let created: InstanceResult = live
            .session
            .call_typed(ctx, Method::Create, &params)
            .await?;
        let properties = codec.decode(&created.attributes, &encoded.secrets)?;
        debug!(resource = %binding.token, id = %created.id, "Created resource");
        Ok(ResourceState::new(
            created.id,
            binding.token.clone(),
            properties,
            binding.target.version,
        ))
    }

    /// Refresh a resource. `None` means it no longer exists. On failure the
    /// error carries `state` unchanged.
    pub async fn read(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: &ResourceState,
    ) -> Result<Option<ResourceState>, BridgeError> {
        self.read_inner(ctx, urn, state)
            .await
            .map_err(|e| e.with_state(state.clone()))
    }

    async fn read_inner(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: &ResourceState,
    ) -> Result<Option<ResourceState>, BridgeError> {
        let urn = Urn::parse(urn)?;
        let live = self.configured(ctx, "read").await?;
        let binding = live.registry.resource(&urn.resource_type)?;
        let codec = binding.codec();

        let properties = upgraded(binding, state)?;
        let encoded = codec.encode(&properties)?;
        let params = InstanceParams {
            type_name: binding.source_type.clone(),
            id: state.id.clone(),
            attributes: encoded.attributes,
        };
        let reply = live
            .session
            .request(ctx, Method::Read, serde_json::to_value(&params)?)
            .await?;
        let result = match reply {
            Err(remote) if remote.not_found => return Ok(None),
            Err(remote) => return Err(BridgeError::Plugin(remote.message)),
            Ok(serde_json::Value::Null) => return Ok(None),
            Ok(result) => result,
        };
        let read: InstanceResult = serde_json::from_value(result)?;
        let properties = codec.decode(&read.attributes, &encoded.secrets)?;
        Ok(Some(ResourceState::new(
            read.id,
            binding.token.clone(),
            properties,
            binding.target.version,
        )))
    }

    /// Update a resource in place. A preview merges the inputs into the old
    /// state and marks dependent computed properties unknown. On failure the
    /// error carries `old` unchanged.
    pub async fn update(
        &self,
        ctx: &CallContext,
        urn: &str,
        old: &ResourceState,
        news: &PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError> {
        self.update_inner(ctx, urn, old, news, preview)
            .await
            .map_err(|e| e.with_state(old.clone()))
    }

    async fn update_inner(
        &self,
        ctx: &CallContext,
        urn: &str,
        old: &ResourceState,
        news: &PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError> {
        let urn = Urn::parse(urn)?;
        if preview {
            let live = self.registry(ctx, "update").await?;
            let binding = live.registry.resource(&urn.resource_type)?;
            let codec = binding.codec();
            let olds = codec.normalize(&upgraded(binding, old)?)?;
            let inputs = codec.normalize(news)?;
            let merged = carry_computed(binding, &olds, &inputs);
            return Ok(ResourceState::new(
                old.id.clone(),
                binding.token.clone(),
                mark_unknown_computed(&binding.target, &inputs, merged),
                binding.target.version,
            ));
        }

        let live = self.configured(ctx, "update").await?;
        let binding = live.registry.resource(&urn.resource_type)?;
        let codec = binding.codec();
        let olds = codec.encode(&upgraded(binding, old)?)?;
        let mut news = codec.encode(news)?;
        let params = UpdateParams {
            type_name: binding.source_type.clone(),
            id: old.id.clone(),
            old: olds.attributes,
            new: news.attributes,
        };
        let updated: InstanceResult = live
            .session
            .call_typed(ctx, Method::Update, &params)
            .await?;
        news.secrets.extend(olds.secrets);
        let properties = codec.decode(&updated.attributes, &news.secrets)?;
        Ok(ResourceState::new(
            updated.id,
            binding.token.clone(),
            properties,
            binding.target.version,
        ))
    }

    /// Delete a resource. Deleting one that is already gone succeeds.
    pub async fn delete(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: &ResourceState,
    ) -> Result<(), BridgeError> {
        let urn = Urn::parse(urn)?;
        let live = self.configured(ctx, "delete").await?;
        let binding = live.registry.resource(&urn.resource_type)?;
        let encoded = binding.codec().encode(&upgraded(binding, state)?)?;
        let params = InstanceParams {
            type_name: binding.source_type.clone(),
            id: state.id.clone(),
            attributes: encoded.attributes,
        };
        match live
            .session
            .request(ctx, Method::Delete, serde_json::to_value(&params)?)
            .await?
        {
            Ok(_) => Ok(()),
            Err(remote) if remote.not_found => {
                debug!(resource = %binding.token, id = %state.id, "Resource already deleted");
                Ok(())
            },
            Err(remote) => Err(BridgeError::Plugin(remote.message)),
        }
    }

    /// Invoke a function backed by a data source. Argument failures are
    /// returned without calling the plugin.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        token: &str,
        args: &PropertyValue,
    ) -> Result<InvokeResult, BridgeError> {
        let live = self.configured(ctx, "invoke").await?;
        let binding = live.registry.function(token)?;

        let args = apply_defaults(binding, args, None);
        let failures = error_failures(binding, &args);
        if !failures.is_empty() {
            return Ok(InvokeResult {
                outputs: PropertyValue::Null,
                failures,
            });
        }

        let codec = binding.codec();
        let encoded = codec.encode(&args)?;
        let params = CreateParams {
            type_name: binding.source_type.clone(),
            attributes: encoded.attributes,
        };
        let result: DataSourceResult = live
            .session
            .call_typed(ctx, Method::ReadDataSource, &params)
            .await?;
        Ok(InvokeResult {
            outputs: codec.decode(&result.attributes, &encoded.secrets)?,
            failures: Vec::new(),
        })
    }

    /// Terminate the plugin and reset the gate.
    pub async fn shutdown(&self) {
        let mut applied = self.applied.lock().await;
        if let Some(live) = self.live.write().await.take() {
            live.session.terminate().await;
        }
        *applied = None;
        self.gate.send_replace(GateState::Unconfigured);
        info!(plugin = %self.module, "Bridge shut down");
    }
}

/// Fill absent properties from mapping defaults, then schema defaults.
/// A property with a default keeps its old input value when it has one.
fn apply_defaults(
    binding: &Binding,
    inputs: &PropertyValue,
    olds: Option<&PropertyValue>,
) -> PropertyValue {
    let PropertyValue::Map(map) = inputs else {
        return inputs.clone();
    };
    let mut map = map.clone();
    let absent = |map: &PropertyMap, name: &str| map.get(name).map_or(true, PropertyValue::is_null);
    let previous = |name: &str| {
        olds.and_then(|olds| olds.get(name))
            .filter(|value| !value.is_null())
            .cloned()
    };

    for (name, default) in binding.defaults() {
        if absent(&map, name) {
            if let Some(value) = previous(name).or_else(|| default.resolve()) {
                map.insert(name.to_string(), value);
            }
        }
    }
    for (name, shape) in &binding.target.properties {
        let Some(default) = &shape.default else {
            continue;
        };
        if absent(&map, name) {
            let value = previous(name).unwrap_or_else(|| default.clone());
            map.insert(name.clone(), value);
        }
    }
    PropertyValue::Map(map)
}

fn error_failures(binding: &Binding, value: &PropertyValue) -> Vec<CheckFailure> {
    validate(&binding.target, value)
        .into_iter()
        .filter(|d| d.is_error())
        .map(CheckFailure::from)
        .collect()
}

fn translation_failure(err: BridgeError) -> CheckFailure {
    match err {
        BridgeError::Translation { path, message } => CheckFailure::new(path, message),
        other => CheckFailure::new("", other.to_string()),
    }
}

fn upgraded(binding: &Binding, state: &ResourceState) -> Result<PropertyValue, BridgeError> {
    upgrade(
        state.properties.clone(),
        state.schema_version,
        binding.target.version,
        &binding.upgrades,
    )
}

/// The new inputs plus the computed properties of the old state they do not set.
fn carry_computed(binding: &Binding, olds: &PropertyValue, inputs: &PropertyValue) -> PropertyValue {
    let mut state = inputs.as_map().cloned().unwrap_or_default();
    if let Some(olds) = olds.as_map() {
        for (name, shape) in &binding.target.properties {
            if !shape.flags.computed || state.get(name).is_some_and(|v| !v.is_null()) {
                continue;
            }
            if let Some(value) = olds.get(name) {
                state.insert(name.clone(), value.clone());
            }
        }
    }
    PropertyValue::Map(state)
}

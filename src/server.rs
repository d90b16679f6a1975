//! gRPC server for the bridge.
//!
//! This module provides the [`ProviderService`] trait, the typed resource
//! surface the RPC handlers drive, and the `serve` functions that expose it as
//! the `hemmer.bridge.v1.ResourceProvider` service with the handshake
//! protocol. [`ProviderBridge`] is the production implementation.
//!
//! # Signal Handling
//!
//! The server handles OS signals (SIGTERM, SIGINT) for graceful shutdown.
//! When a signal is received, the server:
//! 1. Stops accepting new connections
//! 2. Waits for in-flight requests to complete (with configurable timeout)
//! 3. Calls the provider's `stop()` method, which terminates the plugin
//! 4. Exits cleanly

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tonic::transport::Server;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::ProviderBridge;
use crate::error::{BridgeError, ErrorKind};
use crate::generated;
use crate::plugin::CallContext;
use crate::protocol::Handshake;
use crate::schema::{Diagnostic, DiagnosticSeverity, ProviderSchema};
use crate::types::{CheckFailure, CheckResult, DiffResult, InvokeResult, ResourceState};
use crate::value::PropertyValue;

/// The schema a provider serves.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSummary {
    /// The schema the plugin reported.
    pub schema: ProviderSchema,
    /// Target tokens of every resource.
    pub resources: Vec<String>,
    /// Target tokens of every function.
    pub functions: Vec<String>,
}

/// The typed resource surface served over gRPC.
///
/// Every call receives a [`CallContext`] built from the RPC: its deadline
/// comes from the `grpc-timeout` header, and it is cancelled when the client
/// goes away.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// The negotiated schema and the tokens bound from it.
    async fn get_schema(&self) -> Result<SchemaSummary, BridgeError>;

    /// Configure the provider.
    async fn configure(&self, ctx: &CallContext, config: PropertyValue) -> Result<(), BridgeError>;

    /// Apply defaults to and validate resource inputs.
    async fn check(
        &self,
        ctx: &CallContext,
        urn: &str,
        olds: PropertyValue,
        news: PropertyValue,
    ) -> Result<CheckResult, BridgeError>;

    /// Compare old state with new inputs.
    async fn diff(
        &self,
        ctx: &CallContext,
        urn: &str,
        olds: PropertyValue,
        news: PropertyValue,
        schema_version: u64,
    ) -> Result<DiffResult, BridgeError>;

    /// Create a resource.
    async fn create(
        &self,
        ctx: &CallContext,
        urn: &str,
        news: PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError>;

    /// Refresh a resource; `None` when it no longer exists.
    async fn read(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: ResourceState,
    ) -> Result<Option<ResourceState>, BridgeError>;

    /// Update a resource in place.
    async fn update(
        &self,
        ctx: &CallContext,
        urn: &str,
        old: ResourceState,
        news: PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError>;

    /// Delete a resource.
    async fn delete(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: ResourceState,
    ) -> Result<(), BridgeError>;

    /// Invoke a function.
    async fn invoke(
        &self,
        ctx: &CallContext,
        token: &str,
        args: PropertyValue,
    ) -> Result<InvokeResult, BridgeError>;

    /// Release everything the provider holds. Called once the server stops.
    async fn stop(&self) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProviderService for ProviderBridge {
    async fn get_schema(&self) -> Result<SchemaSummary, BridgeError> {
        let schema = self.source_schema().await.ok_or_else(|| {
            BridgeError::NotConfigured("the plugin schema is known once the provider is configured".into())
        })?;
        let (resources, functions) = self.tokens().await;
        Ok(SchemaSummary {
            schema,
            resources,
            functions,
        })
    }

    async fn configure(&self, ctx: &CallContext, config: PropertyValue) -> Result<(), BridgeError> {
        ProviderBridge::configure(self, ctx, config).await
    }

    async fn check(
        &self,
        ctx: &CallContext,
        urn: &str,
        olds: PropertyValue,
        news: PropertyValue,
    ) -> Result<CheckResult, BridgeError> {
        ProviderBridge::check(self, ctx, urn, &olds, &news).await
    }

    async fn diff(
        &self,
        ctx: &CallContext,
        urn: &str,
        olds: PropertyValue,
        news: PropertyValue,
        schema_version: u64,
    ) -> Result<DiffResult, BridgeError> {
        ProviderBridge::diff(self, ctx, urn, &olds, &news, schema_version).await
    }

    async fn create(
        &self,
        ctx: &CallContext,
        urn: &str,
        news: PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError> {
        ProviderBridge::create(self, ctx, urn, &news, preview).await
    }

    async fn read(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: ResourceState,
    ) -> Result<Option<ResourceState>, BridgeError> {
        ProviderBridge::read(self, ctx, urn, &state).await
    }

    async fn update(
        &self,
        ctx: &CallContext,
        urn: &str,
        old: ResourceState,
        news: PropertyValue,
        preview: bool,
    ) -> Result<ResourceState, BridgeError> {
        ProviderBridge::update(self, ctx, urn, &old, &news, preview).await
    }

    async fn delete(
        &self,
        ctx: &CallContext,
        urn: &str,
        state: ResourceState,
    ) -> Result<(), BridgeError> {
        ProviderBridge::delete(self, ctx, urn, &state).await
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        token: &str,
        args: PropertyValue,
    ) -> Result<InvokeResult, BridgeError> {
        ProviderBridge::invoke(self, ctx, token, &args).await
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        self.shutdown().await;
        Ok(())
    }
}

/// Wrapper that implements the generated gRPC trait.
pub struct ProviderGrpcService<P: ProviderService> {
    provider: Arc<P>,
}

impl<P: ProviderService> ProviderGrpcService<P> {
    /// Wrap a provider.
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    fn diagnostics_to_proto(&self, diagnostics: Vec<Diagnostic>) -> Vec<generated::Diagnostic> {
        diagnostics
            .into_iter()
            .map(|d| generated::Diagnostic {
                severity: match d.severity {
                    DiagnosticSeverity::Error => generated::diagnostic::Severity::Error as i32,
                    DiagnosticSeverity::Warning => generated::diagnostic::Severity::Warning as i32,
                },
                summary: d.summary,
                detail: d.detail.unwrap_or_default(),
                attribute: d.attribute.unwrap_or_default(),
            })
            .collect()
    }

    fn error_to_diagnostics(&self, err: &BridgeError) -> Vec<generated::Diagnostic> {
        let diagnostic = match err.last_known_state() {
            Some(_) => Diagnostic::error(err.to_string())
                .with_detail("the resource state is unchanged"),
            None => Diagnostic::error(err.to_string()),
        };
        let diagnostic = match err {
            BridgeError::Translation { path, .. } if !path.is_empty() => {
                diagnostic.with_attribute(path.clone())
            },
            _ => diagnostic,
        };
        self.diagnostics_to_proto(vec![diagnostic])
    }

    /// Answer a failed call. Cancellation and deadline expiry are RPC
    /// errors; everything else is reported as diagnostics.
    fn failure<T>(
        &self,
        err: BridgeError,
        build: impl FnOnce(Vec<generated::Diagnostic>) -> T,
    ) -> Result<tonic::Response<T>, tonic::Status> {
        match err.kind() {
            ErrorKind::Cancelled | ErrorKind::Timeout => Err(err.into()),
            _ => Ok(tonic::Response::new(build(self.error_to_diagnostics(&err)))),
        }
    }
}

fn failures_to_proto(failures: Vec<CheckFailure>) -> Vec<generated::CheckFailure> {
    failures
        .into_iter()
        .map(|f| generated::CheckFailure {
            property: f.property,
            reason: f.reason,
        })
        .collect()
}

/// Decode a JSON-encoded property value. Empty bytes are null.
fn decode_value(bytes: &[u8], field: &str) -> Result<PropertyValue, BridgeError> {
    if bytes.is_empty() {
        return Ok(PropertyValue::Null);
    }
    serde_json::from_slice(bytes)
        .map_err(|e| BridgeError::InvalidRequest(format!("invalid {}: {}", field, e)))
}

fn encode_value(value: &PropertyValue) -> Result<Vec<u8>, BridgeError> {
    Ok(serde_json::to_vec(value)?)
}

/// Parse a `grpc-timeout` header value such as `250m` or `30S`.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 {
        return None;
    }
    let (amount, unit) = value.split_at(value.len() - 1);
    let amount: u64 = amount.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        "M" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

fn call_context<T>(request: &tonic::Request<T>) -> CallContext {
    let timeout = request
        .metadata()
        .get("grpc-timeout")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout);
    match timeout {
        Some(timeout) => CallContext::new().with_timeout(timeout),
        None => CallContext::new(),
    }
}

fn state_from(
    urn: &str,
    id: String,
    properties: &[u8],
    schema_version: u64,
) -> Result<ResourceState, BridgeError> {
    let resource_type = crate::types::Urn::parse(urn)?.resource_type;
    Ok(ResourceState::new(
        id,
        resource_type,
        decode_value(properties, "properties")?,
        schema_version,
    ))
}

/// Properties to echo back on a failed Read or Update.
fn last_known(err: &BridgeError) -> (String, Vec<u8>, u64) {
    match err.last_known_state() {
        Some(state) => (
            state.id.clone(),
            encode_value(&state.properties).unwrap_or_default(),
            state.schema_version,
        ),
        None => (String::new(), Vec::new(), 0),
    }
}

#[tonic::async_trait]
impl<P: ProviderService> generated::resource_provider_server::ResourceProvider
    for ProviderGrpcService<P>
{
    #[instrument(skip(self, _request), name = "grpc.get_schema")]
    async fn get_schema(
        &self,
        _request: tonic::Request<generated::GetSchemaRequest>,
    ) -> Result<tonic::Response<generated::GetSchemaResponse>, tonic::Status> {
        debug!("GetSchema called");
        let result = async {
            let summary = self.provider.get_schema().await?;
            Ok::<_, BridgeError>(generated::GetSchemaResponse {
                schema: serde_json::to_vec(&summary.schema)?,
                resources: summary.resources,
                functions: summary.functions,
                diagnostics: vec![],
            })
        }
        .await;

        match result {
            Ok(response) => {
                debug!(
                    resources = response.resources.len(),
                    functions = response.functions.len(),
                    "GetSchema completed successfully"
                );
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                warn!(error = %e, "GetSchema failed");
                self.failure(e, |diagnostics| generated::GetSchemaResponse {
                    diagnostics,
                    ..Default::default()
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.configure")]
    async fn configure(
        &self,
        request: tonic::Request<generated::ConfigureRequest>,
    ) -> Result<tonic::Response<generated::ConfigureResponse>, tonic::Status> {
        debug!("Configure called");
        let ctx = call_context(&request);
        let req = request.into_inner();

        let result = async {
            let config = decode_value(&req.config, "config")?;
            self.provider.configure(&ctx, config).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Configure completed successfully");
                Ok(tonic::Response::new(generated::ConfigureResponse {
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(error = %e, "Configure failed");
                self.failure(e, |diagnostics| generated::ConfigureResponse { diagnostics })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.check")]
    async fn check(
        &self,
        request: tonic::Request<generated::CheckRequest>,
    ) -> Result<tonic::Response<generated::CheckResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, "Check called");

        let result = async {
            let olds = decode_value(&req.olds, "olds")?;
            let news = decode_value(&req.news, "news")?;
            let checked = self.provider.check(&ctx, &req.urn, olds, news).await?;
            Ok::<_, BridgeError>(generated::CheckResponse {
                inputs: encode_value(&checked.inputs)?,
                failures: failures_to_proto(checked.failures),
                diagnostics: vec![],
            })
        }
        .await;

        match result {
            Ok(response) => {
                if response.failures.is_empty() {
                    debug!(urn = %req.urn, "Check completed successfully");
                } else {
                    warn!(urn = %req.urn, failures = response.failures.len(), "Check found failures");
                }
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Check failed");
                self.failure(e, |diagnostics| generated::CheckResponse {
                    diagnostics,
                    ..Default::default()
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.diff")]
    async fn diff(
        &self,
        request: tonic::Request<generated::DiffRequest>,
    ) -> Result<tonic::Response<generated::DiffResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, id = %req.id, "Diff called");

        let result = async {
            let olds = decode_value(&req.olds, "olds")?;
            let news = decode_value(&req.news, "news")?;
            self.provider
                .diff(&ctx, &req.urn, olds, news, req.schema_version)
                .await
        }
        .await;

        match result {
            Ok(diff) => {
                debug!(
                    urn = %req.urn,
                    changes = diff.changes.len(),
                    replaces = diff.replaces.len(),
                    "Diff completed successfully"
                );
                Ok(tonic::Response::new(generated::DiffResponse {
                    delete_before_replace: diff.delete_before_replace(),
                    changes: diff.changes,
                    replaces: diff.replaces,
                    stables: diff.stables,
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Diff failed");
                self.failure(e, |diagnostics| generated::DiffResponse {
                    diagnostics,
                    ..Default::default()
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.create")]
    async fn create(
        &self,
        request: tonic::Request<generated::CreateRequest>,
    ) -> Result<tonic::Response<generated::CreateResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, preview = req.preview, "Create called");

        let result = async {
            let news = decode_value(&req.properties, "properties")?;
            let state = self.provider.create(&ctx, &req.urn, news, req.preview).await?;
            Ok::<_, BridgeError>(generated::CreateResponse {
                properties: encode_value(&state.properties)?,
                id: state.id,
                schema_version: state.schema_version,
                diagnostics: vec![],
            })
        }
        .await;

        match result {
            Ok(response) => {
                debug!(urn = %req.urn, id = %response.id, "Create completed successfully");
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Create failed");
                self.failure(e, |diagnostics| generated::CreateResponse {
                    diagnostics,
                    ..Default::default()
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.read")]
    async fn read(
        &self,
        request: tonic::Request<generated::ReadRequest>,
    ) -> Result<tonic::Response<generated::ReadResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, id = %req.id, "Read called");

        let result = async {
            let state = state_from(&req.urn, req.id.clone(), &req.properties, req.schema_version)?;
            match self.provider.read(&ctx, &req.urn, state).await? {
                Some(state) => Ok::<_, BridgeError>(generated::ReadResponse {
                    properties: encode_value(&state.properties)?,
                    id: state.id,
                    schema_version: state.schema_version,
                    diagnostics: vec![],
                }),
                None => Ok(generated::ReadResponse::default()),
            }
        }
        .await;

        match result {
            Ok(response) => {
                if response.id.is_empty() {
                    info!(urn = %req.urn, id = %req.id, "Resource no longer exists");
                }
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Read failed");
                let (id, properties, schema_version) = last_known(&e);
                self.failure(e, |diagnostics| generated::ReadResponse {
                    id,
                    properties,
                    schema_version,
                    diagnostics,
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.update")]
    async fn update(
        &self,
        request: tonic::Request<generated::UpdateRequest>,
    ) -> Result<tonic::Response<generated::UpdateResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, id = %req.id, preview = req.preview, "Update called");

        let result = async {
            let old = state_from(&req.urn, req.id.clone(), &req.olds, req.schema_version)?;
            let news = decode_value(&req.news, "news")?;
            let state = self
                .provider
                .update(&ctx, &req.urn, old, news, req.preview)
                .await?;
            Ok::<_, BridgeError>(generated::UpdateResponse {
                properties: encode_value(&state.properties)?,
                schema_version: state.schema_version,
                diagnostics: vec![],
            })
        }
        .await;

        match result {
            Ok(response) => {
                debug!(urn = %req.urn, "Update completed successfully");
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Update failed");
                let (_, properties, schema_version) = last_known(&e);
                self.failure(e, |diagnostics| generated::UpdateResponse {
                    properties,
                    schema_version,
                    diagnostics,
                })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.delete")]
    async fn delete(
        &self,
        request: tonic::Request<generated::DeleteRequest>,
    ) -> Result<tonic::Response<generated::DeleteResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(urn = %req.urn, id = %req.id, "Delete called");

        let result = async {
            let state = state_from(&req.urn, req.id.clone(), &req.properties, req.schema_version)?;
            self.provider.delete(&ctx, &req.urn, state).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(urn = %req.urn, "Delete completed successfully");
                Ok(tonic::Response::new(generated::DeleteResponse {
                    diagnostics: vec![],
                }))
            },
            Err(e) => {
                error!(urn = %req.urn, error = %e, "Delete failed");
                self.failure(e, |diagnostics| generated::DeleteResponse { diagnostics })
            },
        }
    }

    #[instrument(skip(self, request), name = "grpc.invoke")]
    async fn invoke(
        &self,
        request: tonic::Request<generated::InvokeRequest>,
    ) -> Result<tonic::Response<generated::InvokeResponse>, tonic::Status> {
        let ctx = call_context(&request);
        let req = request.into_inner();
        debug!(token = %req.token, "Invoke called");

        let result = async {
            let args = decode_value(&req.args, "args")?;
            let result = self.provider.invoke(&ctx, &req.token, args).await?;
            Ok::<_, BridgeError>(generated::InvokeResponse {
                outputs: encode_value(&result.outputs)?,
                failures: failures_to_proto(result.failures),
                diagnostics: vec![],
            })
        }
        .await;

        match result {
            Ok(response) => {
                debug!(token = %req.token, "Invoke completed successfully");
                Ok(tonic::Response::new(response))
            },
            Err(e) => {
                error!(token = %req.token, error = %e, "Invoke failed");
                self.failure(e, |diagnostics| generated::InvokeResponse {
                    diagnostics,
                    ..Default::default()
                })
            },
        }
    }
}

/// Options for configuring the provider server.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Timeout for graceful shutdown. After receiving a shutdown signal,
    /// the server will wait this long for in-flight requests to complete.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServeOptions {
    /// Create new serve options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
///
/// On Unix, this waits for SIGTERM or SIGINT.
/// On Windows, this waits for CTRL+C.
pub(crate) async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to install signal handlers");
                    return std::future::pending::<()>().await;
                },
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            return std::future::pending::<()>().await;
        }
        info!("Received CTRL+C, initiating graceful shutdown");
    }

    #[cfg(not(any(unix, windows)))]
    {
        // Fallback: just wait forever (no signal handling)
        std::future::pending::<()>().await;
    }
}

/// Serve a provider as a gRPC server.
///
/// This function:
/// 1. Finds an available port
/// 2. Starts the gRPC server
/// 3. Outputs the handshake string to stdout
/// 4. Handles shutdown signals (SIGTERM/SIGINT) gracefully
///
/// The handshake format is: `BRIDGE_PLUGIN|<version>|<address>`
///
/// For custom configuration, use [`serve_with_options`].
pub async fn serve<P: ProviderService>(provider: P) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_options(provider, ServeOptions::default()).await
}

/// Serve a provider with custom options.
///
/// See [`serve`] for details. This function allows configuring
/// shutdown behavior via [`ServeOptions`].
pub async fn serve_with_options<P: ProviderService>(
    provider: P,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    // Find an available port by binding to port 0
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    serve_on_listener(provider, listener, options).await
}

/// Serve a provider on a specific address.
///
/// Unlike [`serve`], this function binds to the specified address rather than
/// finding an available port.
pub async fn serve_on<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    serve_on_with_options(provider, addr, ServeOptions::default()).await
}

/// Serve a provider on a specific address with custom options.
pub async fn serve_on_with_options<P: ProviderService>(
    provider: P,
    addr: SocketAddr,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    serve_on_listener(provider, listener, options).await
}

async fn serve_on_listener<P: ProviderService>(
    provider: P,
    listener: TcpListener,
    options: ServeOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = listener.local_addr()?;
    println!("{}", Handshake::line(addr));

    info!(address = %addr, "Bridge server starting");
    serve_with_shutdown(Arc::new(provider), listener, options, wait_for_shutdown_signal()).await
}

/// Serve on an already-bound listener until `signal` resolves, then drain
/// in-flight requests for at most the shutdown timeout and stop the provider.
pub async fn serve_with_shutdown<P, F>(
    provider: Arc<P>,
    listener: TcpListener,
    options: ServeOptions,
    signal: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: ProviderService,
    F: std::future::Future<Output = ()> + Send,
{
    let grpc_service = ProviderGrpcService::new(Arc::clone(&provider));
    let server = generated::resource_provider_server::ResourceProviderServer::new(grpc_service);

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server_future = Server::builder().add_service(server).serve_with_incoming_shutdown(
        tokio_stream::wrappers::TcpListenerStream::new(listener),
        async move {
            signal.await;
            let _ = signalled_tx.send(());
        },
    );
    tokio::pin!(server_future);

    let result = tokio::select! {
        biased;
        result = &mut server_future => Some(result),
        _ = signalled_rx => {
            // The drain is bounded; a hung request must not hold the plugin.
            tokio::time::timeout(options.shutdown_timeout, &mut server_future).await.ok()
        }
    };

    match result {
        Some(Ok(())) => {
            info!("Server shutdown complete");
        },
        Some(Err(e)) => {
            error!(error = %e, "Server error during shutdown");
            return Err(e.into());
        },
        None => {
            warn!(
                timeout = ?options.shutdown_timeout,
                "Shutdown timeout exceeded, forcing shutdown"
            );
        },
    }

    debug!("Calling provider stop()");
    if let Err(e) = provider.stop().await {
        warn!(error = %e, "Provider stop() returned error");
    }

    info!("Bridge shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::generated::resource_provider_server::ResourceProvider;
    use crate::mapping::ProviderInfo;
    use crate::testing::{spawn_plugin, MockPlugin, PluginServer};

    const URN: &str = "urn:pulumi:dev::web::mock:index/instance:Instance::server";

    async fn service() -> (ProviderGrpcService<ProviderBridge>, PluginServer) {
        let plugin = spawn_plugin(MockPlugin::new()).await.unwrap();
        let options = BridgeOptions::new().with_attach_address(plugin.address());
        let bridge = ProviderBridge::new("mock", ProviderInfo::new("mock"), options);
        (ProviderGrpcService::new(Arc::new(bridge)), plugin)
    }

    fn json(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn value(bytes: &[u8]) -> PropertyValue {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn configure(service: &ProviderGrpcService<ProviderBridge>) {
        let response = service
            .configure(tonic::Request::new(generated::ConfigureRequest {
                config: json(serde_json::json!({"region": "us-east-1"})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.diagnostics.is_empty(), "{:?}", response.diagnostics);
    }

    #[test]
    fn test_serve_options_default() {
        let options = ServeOptions::default();
        assert_eq!(options.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_serve_options_builder() {
        let options = ServeOptions::new().with_shutdown_timeout(Duration::from_secs(60));
        assert_eq!(options.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("30S"), Some(Duration::from_secs(30)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("abcS"), None);
    }

    #[test]
    fn test_call_context_reads_grpc_timeout() {
        let mut request = tonic::Request::new(());
        request.set_timeout(Duration::from_millis(500));
        assert!(call_context(&request).deadline().is_some());
        assert!(call_context(&tonic::Request::new(())).deadline().is_none());
    }

    #[test]
    fn test_decode_value() {
        assert_eq!(decode_value(&[], "news").unwrap(), PropertyValue::Null);
        let err = decode_value(b"{not json", "news").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(err.message().contains("news"));
    }

    #[test]
    fn test_encode_value_rejects_non_finite_numbers() {
        let value = PropertyValue::map(vec![("ratio", PropertyValue::Number(f64::NAN))]);
        let err = encode_value(&value).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(encode_value(&PropertyValue::Number(3.0)).unwrap(), b"3.0");
    }

    #[tokio::test]
    async fn test_get_schema_requires_configure() {
        let (service, plugin) = service().await;

        let response = service
            .get_schema(tonic::Request::new(generated::GetSchemaRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert!(response.schema.is_empty());

        configure(&service).await;
        let response = service
            .get_schema(tonic::Request::new(generated::GetSchemaRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(response.diagnostics.is_empty());
        assert!(response
            .resources
            .contains(&"mock:index/instance:Instance".to_string()));
        assert!(response
            .functions
            .contains(&"mock:index/getImage:getImage".to_string()));
        let schema: ProviderSchema = serde_json::from_slice(&response.schema).unwrap();
        assert!(schema.resources.contains_key("mock_instance"));

        service.provider.stop().await.unwrap();
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_configure_failure_is_a_diagnostic() {
        let (service, plugin) = service().await;

        let response = service
            .configure(tonic::Request::new(generated::ConfigureRequest {
                config: json(serde_json::json!({})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(
            response.diagnostics[0].severity,
            generated::diagnostic::Severity::Error as i32
        );
        assert!(response.diagnostics[0].summary.contains("region"));

        service.provider.stop().await.unwrap();
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_resource_round_trip_over_rpc() {
        let (service, plugin) = service().await;
        configure(&service).await;

        let inputs = json(serde_json::json!({"ami": "ami-1"}));
        let checked = service
            .check(tonic::Request::new(generated::CheckRequest {
                urn: URN.into(),
                olds: vec![],
                news: inputs.clone(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(checked.failures.is_empty());

        let created = service
            .create(tonic::Request::new(generated::CreateRequest {
                urn: URN.into(),
                properties: checked.inputs.clone(),
                preview: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(created.diagnostics.is_empty(), "{:?}", created.diagnostics);
        assert_eq!(created.id, "i-1");
        assert_eq!(
            value(&created.properties).get("publicIp"),
            Some(&PropertyValue::from("10.0.0.1"))
        );

        let diff = service
            .diff(tonic::Request::new(generated::DiffRequest {
                urn: URN.into(),
                id: created.id.clone(),
                olds: created.properties.clone(),
                news: json(serde_json::json!({"ami": "ami-2"})),
                schema_version: created.schema_version,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(diff.replaces.contains(&"ami".to_string()));
        assert!(!diff.delete_before_replace);

        let read = service
            .read(tonic::Request::new(generated::ReadRequest {
                urn: URN.into(),
                id: created.id.clone(),
                properties: created.properties.clone(),
                schema_version: created.schema_version,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(read.id, "i-1");

        let deleted = service
            .delete(tonic::Request::new(generated::DeleteRequest {
                urn: URN.into(),
                id: created.id.clone(),
                properties: created.properties.clone(),
                schema_version: created.schema_version,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(deleted.diagnostics.is_empty());

        let gone = service
            .read(tonic::Request::new(generated::ReadRequest {
                urn: URN.into(),
                id: created.id,
                properties: created.properties,
                schema_version: created.schema_version,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(gone.id.is_empty());
        assert!(gone.diagnostics.is_empty());

        service.provider.stop().await.unwrap();
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_failure_returns_last_known_properties() {
        let (service, plugin) = service().await;
        configure(&service).await;
        plugin.shutdown().await;

        let properties = json(serde_json::json!({"ami": "ami-1", "publicIp": "10.0.0.1"}));
        let response = service
            .read(tonic::Request::new(generated::ReadRequest {
                urn: URN.into(),
                id: "i-1".into(),
                properties: properties.clone(),
                schema_version: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(response.id, "i-1");
        assert_eq!(value(&response.properties), value(&properties));

        let response = service
            .update(tonic::Request::new(generated::UpdateRequest {
                urn: URN.into(),
                id: "i-1".into(),
                olds: properties.clone(),
                news: json(serde_json::json!({"ami": "ami-1"})),
                schema_version: 0,
                preview: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.diagnostics.len(), 1);
        assert_eq!(value(&response.properties), value(&properties));

        service.provider.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_over_rpc() {
        let (service, plugin) = service().await;
        configure(&service).await;

        let response = service
            .invoke(tonic::Request::new(generated::InvokeRequest {
                token: "mock:index/getImage:getImage".into(),
                args: json(serde_json::json!({"name": "debian"})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.failures.is_empty());
        assert_eq!(
            value(&response.outputs).get("id"),
            Some(&PropertyValue::from("ami-debian"))
        );

        let response = service
            .invoke(tonic::Request::new(generated::InvokeRequest {
                token: "mock:index/getImage:getImage".into(),
                args: json(serde_json::json!({})),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.failures.len(), 1);
        assert_eq!(response.failures[0].property, "name");

        service.provider.stop().await.unwrap();
        plugin.shutdown().await;
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_stops_provider() {
        let (service, plugin) = service().await;
        let provider = Arc::clone(&service.provider);
        configure(&service).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        serve_with_shutdown(
            Arc::clone(&provider),
            listener,
            ServeOptions::new().with_shutdown_timeout(Duration::from_secs(1)),
            async {},
        )
        .await
        .unwrap();

        assert_eq!(provider.session_state().await, None);
        plugin.shutdown().await;
    }
}

//! Hemmer Provider Bridge
//!
//! This crate serves a legacy attribute-bag provider plugin as a typed
//! resource provider over gRPC. The plugin runs as a subprocess speaking a
//! line-oriented JSON protocol with flat string attributes; the bridge
//! exposes it as the `hemmer.bridge.v1.ResourceProvider` service with
//! structured property values, diffs, previews, and functions.
//!
//! # Overview
//!
//! The bridge provides:
//!
//! - **Plugin supervision**: launching, handshaking with, and terminating
//!   the plugin process ([`plugin`]); one actor task owns the connection
//! - **Schema registry**: binding plugin resource and data source types to
//!   target tokens and property names ([`registry`], [`mapping`])
//! - **State codec**: translating between structured and flat values,
//!   including unknown and secret values ([`codec`])
//! - **Diff engine**: changes, replacements, and replacement order ([`diff`])
//! - **Provider bridge**: the configure gate and resource operations
//!   ([`bridge`])
//! - **Server helpers**: the gRPC service and handshake ([`server`])
//! - **Logging**: integration with `tracing`, including scoped muting of
//!   plugin output ([`logging`])
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_bridge::{init_logging, serve, BridgeOptions, ProviderBridge, ProviderInfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let info = ProviderInfo::from_json_str(include_str!("mapping.json"))?;
//!     let options = BridgeOptions::new().with_search_dir("/opt/plugins");
//!     serve(ProviderBridge::new("aws", info, options)).await
//! }
//! ```
//!
//! # Handshake Protocol
//!
//! Plugins, and the bridge itself when served with [`serve`], print one
//! handshake line to stdout:
//!
//! ```text
//! BRIDGE_PLUGIN|1|127.0.0.1:50051
//! ```
//!
//! Format: `BRIDGE_PLUGIN|<protocol_version>|<address>`
//!
//! A plugin only starts when `BRIDGE_PLUGIN_MAGIC_COOKIE` is set to the
//! expected value, which the bridge does when launching it.
//!
//! # Resource Protocol
//!
//! - **GetSchema**: The plugin schema and bound tokens
//! - **Configure**: Launches the plugin and configures it
//! - **Check**: Applies defaults and validates inputs
//! - **Diff**: Compares old state with new inputs
//! - **Create/Read/Update/Delete**: Resource operations, with previews
//! - **Invoke**: Calls a function backed by a data source

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod codec;
pub mod diff;
pub mod error;
pub mod logging;
pub mod mapping;
pub mod plugin;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod testing;
pub mod types;
pub mod validation;
pub mod value;

#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated;

// Re-export main types at crate root
pub use bridge::{BridgeOptions, GateState, ProviderBridge};
pub use error::{BridgeError, ErrorKind};
pub use logging::{init_logging, init_logging_with_default, try_init_logging, PluginLogGate};
pub use mapping::{DataSourceInfo, DefaultInfo, PropertyInfo, ProviderInfo, ResourceInfo};
pub use plugin::{CallContext, PluginSession, SessionState};
pub use registry::SchemaRegistry;
pub use schema::ProviderSchema;
pub use server::{
    serve, serve_on, serve_on_with_options, serve_with_options, serve_with_shutdown,
    ProviderService, SchemaSummary, ServeOptions,
};
pub use types::{
    CheckFailure, CheckResult, DiffResult, InvokeResult, ReplacementOrder, ResourceState, Urn,
    HANDSHAKE_PREFIX, PROTOCOL_VERSION,
};
pub use validation::{is_valid, validate, validate_result};
pub use value::{PropertyMap, PropertyValue};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;

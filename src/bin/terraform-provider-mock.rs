//! A source plugin backed by [`MockPlugin`], for exercising the bridge
//! end to end.
//!
//! Set `MOCK_PLUGIN_LATENCY_MS` to delay every operation.

use hemmer_provider_bridge::testing::{serve_plugin, MockPlugin};
use hemmer_provider_bridge::try_init_logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    try_init_logging();
    serve_plugin(MockPlugin::from_env()).await
}

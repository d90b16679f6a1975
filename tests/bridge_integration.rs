//! End-to-end tests driving the `terraform-provider-mock` plugin binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hemmer_provider_bridge::testing::{assert_diff_replaces, assert_no_failures};
use hemmer_provider_bridge::{
    BridgeOptions, CallContext, ErrorKind, GateState, PropertyValue, ProviderBridge, ProviderInfo,
    SessionState,
};

const URN: &str = "urn:pulumi:dev::web::mock:index/instance:Instance::server";

fn plugin_dir() -> PathBuf {
    Path::new(env!("CARGO_BIN_EXE_terraform-provider-mock"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn bridge() -> ProviderBridge {
    let options = BridgeOptions::new()
        .with_search_dir(plugin_dir())
        .with_call_timeout(Duration::from_secs(10));
    ProviderBridge::new("mock", ProviderInfo::new("mock"), options)
}

fn config() -> PropertyValue {
    PropertyValue::map(vec![
        ("region", PropertyValue::from("us-east-1")),
        ("accessKey", PropertyValue::from("AKIA-TEST")),
    ])
}

fn inputs(ami: &str) -> PropertyValue {
    PropertyValue::map(vec![
        ("ami", PropertyValue::from(ami)),
        (
            "securityGroups",
            PropertyValue::list(vec![PropertyValue::from("sg-2"), PropertyValue::from("sg-1")]),
        ),
    ])
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("bridge-it-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn test_full_resource_lifecycle() {
    let bridge = bridge();
    let ctx = CallContext::new();
    bridge.configure(&ctx, config()).await.unwrap();
    assert!(bridge.plugin_pid().await.is_some());

    let checked = bridge
        .check(&ctx, URN, &PropertyValue::Null, &inputs("ami-1"))
        .await
        .unwrap();
    assert_no_failures(&checked.failures);

    let created = bridge.create(&ctx, URN, &checked.inputs, false).await.unwrap();
    assert_eq!(created.id, "i-1");
    assert_eq!(
        created.properties.get("securityGroups"),
        Some(&PropertyValue::list(vec![
            PropertyValue::from("sg-2"),
            PropertyValue::from("sg-1")
        ]))
    );
    assert_eq!(
        created.properties.get("instanceType"),
        Some(&PropertyValue::from("t2.micro"))
    );

    let diff = bridge
        .diff(&ctx, URN, &created.properties, &inputs("ami-2"), created.schema_version)
        .await
        .unwrap();
    assert_diff_replaces(&diff, "ami");

    let refreshed = bridge.read(&ctx, URN, &created).await.unwrap();
    assert_eq!(refreshed.as_ref(), Some(&created));

    bridge.delete(&ctx, URN, &created).await.unwrap();
    assert_eq!(bridge.read(&ctx, URN, &created).await.unwrap(), None);

    bridge.shutdown().await;
    assert_eq!(bridge.gate_state(), GateState::Unconfigured);
}

#[tokio::test]
async fn test_invoke_function() {
    let bridge = bridge();
    let ctx = CallContext::new();
    bridge.configure(&ctx, config()).await.unwrap();

    let args = PropertyValue::map(vec![("name", PropertyValue::from("ubuntu"))]);
    let result = bridge
        .invoke(&ctx, "mock:index/getImage:getImage", &args)
        .await
        .unwrap();
    assert_no_failures(&result.failures);
    assert_eq!(result.outputs.get("id"), Some(&PropertyValue::from("ami-ubuntu")));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_calls_during_configure_wait_for_it() {
    let bridge = Arc::new(bridge());

    let configuring = Arc::clone(&bridge);
    let configure =
        tokio::spawn(async move { configuring.configure(&CallContext::new(), config()).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let created = bridge
        .create(&CallContext::new(), URN, &inputs("ami-1"), false)
        .await
        .unwrap();
    configure.await.unwrap().unwrap();
    assert_eq!(created.id, "i-1");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_repeated_configure_keeps_the_session() {
    let bridge = bridge();
    let ctx = CallContext::new();

    bridge.configure(&ctx, config()).await.unwrap();
    let pid = bridge.plugin_pid().await;
    bridge.configure(&ctx, config()).await.unwrap();

    assert_eq!(bridge.plugin_pid().await, pid);
    assert_eq!(bridge.session_state().await, Some(SessionState::Configured));

    bridge.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_killed_plugin_keeps_caller_state() {
    let bridge = bridge();
    let ctx = CallContext::new();
    bridge.configure(&ctx, config()).await.unwrap();
    let created = bridge.create(&ctx, URN, &inputs("ami-1"), false).await.unwrap();

    let pid = bridge.plugin_pid().await.unwrap();
    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = bridge.read(&ctx, URN, &created).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubprocessCrash);
    assert_eq!(err.last_known_state(), Some(&created));
    assert_eq!(bridge.session_state().await, Some(SessionState::Terminated));

    // A fresh Configure relaunches the plugin.
    bridge.configure(&ctx, config()).await.unwrap();
    assert_ne!(bridge.plugin_pid().await, Some(pid));
    assert_eq!(bridge.gate_state(), GateState::Configured);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_missing_plugin_binary() {
    let dir = scratch_dir("missing");
    let options = BridgeOptions::new().with_search_dir(&dir);
    let bridge = ProviderBridge::new("absent", ProviderInfo::new("absent"), options);

    let err = bridge.configure(&CallContext::new(), config()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(bridge.gate_state(), GateState::Unconfigured);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_unsupported_protocol_version() {
    use std::os::unix::fs::PermissionsExt;

    let dir = scratch_dir("mismatch");
    let script = dir.join("terraform-provider-future");
    std::fs::write(&script, "#!/bin/sh\necho 'BRIDGE_PLUGIN|99|127.0.0.1:1'\nsleep 5\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let options = BridgeOptions::new().with_search_dir(&dir);
    let bridge = ProviderBridge::new("future", ProviderInfo::new("future"), options);
    let err = bridge.configure(&CallContext::new(), config()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
    assert_eq!(bridge.gate_state(), GateState::Unconfigured);

    std::fs::remove_dir_all(&dir).unwrap();
}

//! The source plugin wire protocol.
//!
//! A plugin announces itself with a single handshake line on stdout:
//!
//! ```text
//! BRIDGE_PLUGIN|1|127.0.0.1:50051
//! ```
//!
//! after which the bridge connects to the address and exchanges
//! newline-delimited JSON frames:
//!
//! ```text
//! -> {"id":1,"method":"read","params":{"type_name":"mock_instance","id":"i-1","attributes":{...}}}
//! <- {"id":1,"result":{"id":"i-1","attributes":{...}}}
//! <- {"id":1,"error":{"message":"boom","not_found":false}}
//! ```
//!
//! Attribute bags are flatmaps (see [`crate::codec`]).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::Attributes;
use crate::error::BridgeError;
use crate::schema::ProviderSchema;
use crate::types::{HANDSHAKE_PREFIX, PROTOCOL_VERSION};

/// A parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The protocol version the plugin speaks.
    pub protocol_version: u32,
    /// Where the plugin listens.
    pub address: SocketAddr,
}

impl Handshake {
    /// Parse a handshake line, rejecting versions other than ours.
    pub fn parse(line: &str) -> Result<Self, BridgeError> {
        let line = line.trim();
        let mut parts = line.split('|');
        let (Some(prefix), Some(version), Some(address), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BridgeError::Launch(format!("malformed handshake '{}'", line)));
        };
        if prefix != HANDSHAKE_PREFIX {
            return Err(BridgeError::Launch(format!(
                "unexpected handshake prefix '{}'",
                prefix
            )));
        }
        let protocol_version = version
            .parse::<u32>()
            .ok()
            .filter(|v| *v == PROTOCOL_VERSION)
            .ok_or_else(|| BridgeError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                reported: version.to_string(),
            })?;
        let address = address.parse().map_err(|_| {
            BridgeError::Launch(format!("invalid handshake address '{}'", address))
        })?;
        Ok(Self {
            protocol_version,
            address,
        })
    }

    /// Format the handshake line a plugin listening on `address` prints.
    pub fn line(address: SocketAddr) -> String {
        format!("{}|{}|{}", HANDSHAKE_PREFIX, PROTOCOL_VERSION, address)
    }
}

/// Plugin methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Fetch the provider schema and capabilities.
    GetSchema,
    /// Configure the provider.
    Configure,
    /// Create a resource.
    Create,
    /// Refresh a resource.
    Read,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// Read a data source.
    ReadDataSource,
    /// Ask the plugin to abandon in-flight work.
    Stop,
    /// Ask the plugin to exit.
    Shutdown,
}

impl Method {
    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetSchema => "get_schema",
            Self::Configure => "configure",
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ReadDataSource => "read_data_source",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlates the response.
    pub id: u64,
    /// The method.
    pub method: Method,
    /// Method parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A failure reported by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// What went wrong.
    pub message: String,
    /// The addressed resource does not exist.
    #[serde(default)]
    pub not_found: bool,
}

impl RemoteError {
    /// A plain failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            not_found: false,
        }
    }

    /// The addressed resource does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            not_found: true,
        }
    }
}

/// A response frame. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The id of the request this answers.
    pub id: u64,
    /// The method result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The failure, if the method failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl Response {
    /// A successful response.
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(id: u64, error: RemoteError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Optional protocol features a plugin supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Capabilities {
    /// The plugin honors `stop` while a call is in flight.
    pub cancel: bool,
}

/// Result of `get_schema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GetSchemaResult {
    /// The provider schema.
    pub schema: ProviderSchema,
    /// Supported features.
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// Parameters of `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigureParams {
    /// Flattened provider configuration.
    pub config: Attributes,
}

/// Parameters of `create` and `read_data_source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    /// The plugin type name.
    pub type_name: String,
    /// Flattened inputs.
    pub attributes: Attributes,
}

/// Parameters of `read` and `delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceParams {
    /// The plugin type name.
    pub type_name: String,
    /// The instance id.
    pub id: String,
    /// Flattened last-known state.
    pub attributes: Attributes,
}

/// Parameters of `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParams {
    /// The plugin type name.
    pub type_name: String,
    /// The instance id.
    pub id: String,
    /// Flattened prior state.
    pub old: Attributes,
    /// Flattened new inputs.
    pub new: Attributes,
}

/// Result of `create`, `read`, and `update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceResult {
    /// The instance id.
    pub id: String,
    /// Flattened state.
    pub attributes: Attributes,
}

/// Result of `read_data_source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceResult {
    /// Flattened outputs.
    pub attributes: Attributes,
}

/// Encode a frame as one JSON line.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, BridgeError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_frame(frame).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Read one frame. Returns `Ok(None)` at end of stream; blank lines are skipped.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::BufReader;

    #[test]
    fn test_handshake_parse() {
        let handshake = Handshake::parse("BRIDGE_PLUGIN|1|127.0.0.1:50051\n").unwrap();
        assert_eq!(handshake.protocol_version, 1);
        assert_eq!(handshake.address, "127.0.0.1:50051".parse().unwrap());
        assert_eq!(
            Handshake::line(handshake.address),
            "BRIDGE_PLUGIN|1|127.0.0.1:50051"
        );
    }

    #[test]
    fn test_handshake_version_mismatch() {
        let err = Handshake::parse("BRIDGE_PLUGIN|5|127.0.0.1:1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
        assert!(err.to_string().contains("plugin reported 5"));
    }

    #[test]
    fn test_handshake_garbage() {
        assert_eq!(
            Handshake::parse("hello world").unwrap_err().kind(),
            ErrorKind::Launch
        );
        assert_eq!(
            Handshake::parse("OTHER|1|127.0.0.1:1").unwrap_err().kind(),
            ErrorKind::Launch
        );
        assert_eq!(
            Handshake::parse("BRIDGE_PLUGIN|1|nowhere").unwrap_err().kind(),
            ErrorKind::Launch
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let request = Request {
            id: 7,
            method: Method::ReadDataSource,
            params: serde_json::json!({"type_name": "mock_image"}),
        };
        let line = encode_frame(&request).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"method\":\"read_data_source\""));
        assert_eq!(Method::ReadDataSource.as_str(), "read_data_source");
    }

    #[test]
    fn test_response_wire_shape() {
        let ok: Response = serde_json::from_str(r#"{"id":1,"result":null}"#).unwrap();
        assert_eq!(ok.id, 1);
        assert!(ok.error.is_none());

        let err: Response =
            serde_json::from_str(r#"{"id":2,"error":{"message":"gone","not_found":true}}"#).unwrap();
        assert_eq!(
            err.error,
            Some(RemoteError {
                message: "gone".into(),
                not_found: true
            })
        );
    }

    #[test]
    fn test_schema_result_defaults_capabilities() {
        let result: GetSchemaResult = serde_json::from_str(r#"{"schema":{}}"#).unwrap();
        assert!(!result.capabilities.cancel);
    }

    #[tokio::test]
    async fn test_read_frames_skips_blank_lines() {
        let input = b"\n{\"id\":1,\"result\":true}\n\n{\"id\":2,\"result\":false}\n";
        let mut reader = BufReader::new(&input[..]);

        let first: Response = read_frame(&mut reader).await.unwrap().unwrap();
        let second: Response = read_frame(&mut reader).await.unwrap().unwrap();
        let end: Option<Response> = read_frame(&mut reader).await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.result, Some(serde_json::Value::Bool(false)));
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, &Response::ok(3, serde_json::json!({"id": "i-1"})))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "{\"id\":3,\"result\":{\"id\":\"i-1\"}}\n");
    }
}

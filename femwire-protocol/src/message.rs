//! JSON message types for requests and responses.

use crate::chunk::Shape;
use crate::dtype::ValueType;
use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    // Session management
    Hello,
    Ping,
    Exit,

    // Commands and scalar queries
    Run,
    GetParameter,
    Get,

    // Workspace objects
    DataInfo,
    GetVecData,
    GetMatData,
    SetVecData,
    SetMatData,

    // Mesh queries
    Vget,
    Nodes,
    LoadElements,
    LoadElementTypes,

    // Files
    UploadFile,
    DownloadFile,
    ListFiles,
}

impl Operation {
    /// Whether the request frame is followed by an upload stream.
    pub fn carries_upload(&self) -> bool {
        matches!(
            self,
            Operation::SetVecData | Operation::SetMatData | Operation::UploadFile
        )
    }

    /// Whether a successful reply is a chunk stream.
    pub fn streams_reply(&self) -> bool {
        matches!(
            self,
            Operation::GetVecData
                | Operation::GetMatData
                | Operation::Vget
                | Operation::Nodes
                | Operation::LoadElements
                | Operation::LoadElementTypes
                | Operation::DownloadFile
        )
    }
}

/// Request message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Message type, always "request".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Unique request ID for correlation.
    pub id: String,

    /// Operation to perform.
    pub op: Operation,

    /// Operation-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<String>, op: Operation) -> Self {
        Self {
            msg_type: "request".to_string(),
            id: id.into(),
            op,
            params: Value::Object(Default::default()),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// Stable error code.
    pub code: ErrorCode,

    /// Human-readable error message.
    pub message: String,

    /// Additional error details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ResponseError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Response message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Message type, always "response".
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Request ID this response correlates to.
    pub id: String,

    /// Response status.
    pub status: ResponseStatus,

    /// Result payload (for successful responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error details (for error responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ResponseError) -> Self {
        Self {
            msg_type: "response".to_string(),
            id: id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }
}

// ============================================================================
// Operation-specific parameter types
// ============================================================================

/// Parameters for HELLO request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: u16,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Result for HELLO response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: u16,
    pub server_name: String,
    pub server_version: String,
    pub session_id: String,
}

/// Parameters for RUN request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    pub command: String,
}

/// Result for RUN response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub output: String,
}

/// Parameters for GET_PARAMETER request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParameterParams {
    pub name: String,
}

/// A scalar parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Number(f64),
    Text(String),
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Number(v) => Some(*v),
            ScalarValue::Text(_) => None,
        }
    }
}

/// Result for GET_PARAMETER and GET responses. `None` when undefined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarResult {
    #[serde(default)]
    pub value: Option<ScalarValue>,
}

/// Parameters for GET request (`*GET,,entity,entnum,item1,it1num`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetParams {
    pub entity: String,
    #[serde(default)]
    pub entnum: String,
    pub item1: String,
    #[serde(default)]
    pub it1num: String,
}

/// Parameters for requests addressing one workspace object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}

/// Parameters for streamed downloads of a workspace object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    pub name: String,
    pub chunk_size: usize,
}

/// Parameters for untargeted streamed downloads (mesh queries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub chunk_size: usize,
}

/// Parameters for VGET request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgetParams {
    pub entity: String,
    #[serde(default)]
    pub entnum: String,
    pub item1: String,
    #[serde(default)]
    pub it1num: String,
    pub chunk_size: usize,
}

/// Kind of workspace object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectKind {
    Vec,
    Dmat,
    Smat,
    Solver,
}

/// Result for DATA_INFO response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataInfo {
    pub name: String,
    pub objtype: ObjectKind,
    pub stype: ValueType,
    pub size1: u64,
    pub size2: u64,
    /// Storage layout of matrices: 0 upper, 1 lower, 2 diagonal, 3 full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mattype: Option<u8>,
}

/// Result for SET_VEC_DATA / SET_MAT_DATA responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDataResult {
    pub name: String,
    pub shape: Shape,
}

/// Parameters for UPLOAD_FILE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileParams {
    pub filename: String,
}

/// Result for UPLOAD_FILE response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileResult {
    pub filename: String,
    pub length: u64,
}

/// Parameters for DOWNLOAD_FILE request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileParams {
    pub filename: String,
    pub chunk_size: usize,
}

/// Result for LIST_FILES response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilesResult {
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = Request::new("1", Operation::GetVecData);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""op":"GET_VEC_DATA""#));
        assert!(json.contains(r#""type":"request""#));
    }

    #[test]
    fn test_response_error_serialization() {
        let err = ResponseError::new(ErrorCode::NotFound, "no such object")
            .with_detail("name", "ABC");
        let resp = Response::error("1", err);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""code":"NOT_FOUND""#));
        assert!(json.contains(r#""status":"error""#));
    }

    #[test]
    fn test_operation_stream_directions() {
        assert!(Operation::SetVecData.carries_upload());
        assert!(Operation::UploadFile.carries_upload());
        assert!(!Operation::Run.carries_upload());

        assert!(Operation::Nodes.streams_reply());
        assert!(Operation::DownloadFile.streams_reply());
        assert!(!Operation::DataInfo.streams_reply());
    }

    #[test]
    fn test_data_info_json() {
        let info = DataInfo {
            name: "K".to_string(),
            objtype: ObjectKind::Smat,
            stype: ValueType::Float64,
            size1: 60,
            size2: 60,
            mattype: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["objtype"], "SMAT");
        assert_eq!(json["stype"], "float64");
        assert!(json.get("mattype").is_none());
    }

    #[test]
    fn test_scalar_value_untagged() {
        let parsed: ScalarResult = serde_json::from_str(r#"{"value": 3.5}"#).unwrap();
        assert_eq!(parsed.value, Some(ScalarValue::Number(3.5)));

        let parsed: ScalarResult = serde_json::from_str(r#"{"value": "ABC"}"#).unwrap();
        assert_eq!(parsed.value.and_then(|v| v.as_f64()), None);

        let parsed: ScalarResult = serde_json::from_str(r#"{}"#).unwrap();
        assert!(parsed.value.is_none());
    }
}

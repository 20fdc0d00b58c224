use std::fmt;

use prost::Message;
use thiserror::Error;
use tonic::Code;

use crate::proto;

/// Result type alias for table operations.
pub type TableResult<T> = Result<T, TableError>;

/// One failed update inside a batched write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Position of the update in the batch.
    pub index: usize,
    pub code: Code,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}: {}", self.index, self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("session is not subscribed; cannot access {table}")]
    Unavailable { table: String },

    #[error("transport error on {table} ({key}): {status}")]
    Transport {
        table: String,
        key: String,
        #[source]
        status: tonic::Status,
    },

    #[error("batch write to {table} failed: {}", join_rows(.errors))]
    Batch { table: String, errors: Vec<RowError> },

    #[error("entry {key} already exists in {table}")]
    DuplicateKey { table: String, key: String },

    #[error("entry {key} not found in {table}")]
    NotFound { table: String, key: String },

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown field {field} in {table}")]
    UnknownField { table: String, field: String },

    #[error("unknown action {action} for {table}")]
    UnknownAction { table: String, action: String },

    #[error("key for {table} is missing fields: {}", .missing.join(", "))]
    IncompleteKey { table: String, missing: Vec<String> },

    #[error("invalid value for {table}.{field}: {reason}")]
    InvalidValue {
        table: String,
        field: String,
        reason: String,
    },
}

fn join_rows(errors: &[RowError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TableError {
    /// Classify a failed RPC. Per-row details win over the top-level
    /// status; a lone row error maps onto the matching row outcome.
    pub fn from_status(table: &str, key: &str, status: tonic::Status) -> Self {
        let mut rows = decode_row_errors(&status);
        if rows.len() == 1 {
            match rows[0].code {
                Code::AlreadyExists => return Self::duplicate(table, key),
                Code::NotFound => return Self::not_found(table, key),
                _ => {}
            }
        }
        if !rows.is_empty() {
            rows.sort_by_key(|r| r.index);
            return Self::Batch {
                table: table.to_string(),
                errors: rows,
            };
        }
        match status.code() {
            Code::AlreadyExists => Self::duplicate(table, key),
            Code::NotFound => Self::not_found(table, key),
            _ => Self::Transport {
                table: table.to_string(),
                key: key.to_string(),
                status,
            },
        }
    }

    fn duplicate(table: &str, key: &str) -> Self {
        Self::DuplicateKey {
            table: table.to_string(),
            key: key.to_string(),
        }
    }

    fn not_found(table: &str, key: &str) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key: key.to_string(),
        }
    }
}

/// Decode the per-row errors of a batched call.
///
/// The switch reports them as a binary `google.rpc.Status` whose details
/// are `bfrt_proto.Error` messages, one per update. Rows whose canonical
/// code is OK are skipped.
pub fn decode_row_errors(status: &tonic::Status) -> Vec<RowError> {
    let mut payload = status.details().to_vec();
    if payload.is_empty() {
        if let Some(Ok(bytes)) = status
            .metadata()
            .get_bin(proto::STATUS_DETAILS_KEY)
            .map(|v| v.to_bytes())
        {
            payload = bytes.to_vec();
        }
    }
    if payload.is_empty() {
        return Vec::new();
    }

    let Ok(rpc_status) = proto::RpcStatus::decode(payload.as_slice()) else {
        return Vec::new();
    };

    rpc_status
        .details
        .iter()
        .enumerate()
        .filter_map(|(index, any)| {
            let error = proto::Error::decode(any.value.as_slice()).ok()?;
            (error.canonical_code != 0).then(|| RowError {
                index,
                code: Code::from_i32(error.canonical_code),
                message: error.message,
            })
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream session is closed")]
    Closed,

    #[error("no subscribe acknowledgement for device {device_id} after {attempts} attempts")]
    SubscribeTimeout { device_id: u32, attempts: u32 },

    #[error("subscribe for device {device_id} rejected ({code:?}): {message}")]
    SubscribeRejected {
        device_id: u32,
        code: Code,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid switch address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to open channel: {0}")]
    Channel(#[from] tonic::transport::Error),

    #[error("stream channel call failed: {0}")]
    Stream(tonic::Status),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectError>,
    },

    #[error("no program loaded on device {device_id}")]
    NoProgram { device_id: u32 },

    #[error("program {program} is not loaded on device {device_id}")]
    ProgramNotLoaded { program: String, device_id: u32 },

    #[error("failed to bind program {program}: {status}")]
    Bind { program: String, status: tonic::Status },

    #[error("failed to fetch pipeline config: {0}")]
    PipelineConfig(tonic::Status),

    #[error("invalid table schema: {0}")]
    Schema(#[from] serde_json::Error),
}

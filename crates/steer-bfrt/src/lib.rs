//! steer-bfrt — management RPC transport for the switch control plane.
//!
//! Speaks the BF Runtime gRPC protocol to the switch management daemon:
//! a bidirectional stream for the subscribe handshake and notifications,
//! unary `Write` calls for table updates, and server-streaming `Read`.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager
//!   ├── connect()       fresh channel per attempt, bounded retry
//!   │     └── StreamSession
//!   │           ├── send task:    outbound queue → request stream
//!   │           ├── receive task: response stream → inbound queue
//!   │           └── subscribe()   bounded poll of the inbound queue
//!   └── bind_program()  pipeline binding + table schema fetch
//!         └── TableClient
//!               ├── apply(Insert | Modify | Delete, row)
//!               ├── delete(table, None)   clears the table
//!               └── read(table)           lazy TableReader
//! ```

pub mod connection;
pub mod error;
pub mod proto;
pub mod schema;
pub mod session;
pub mod table;

pub use connection::{ConnectOptions, Connection, ConnectionManager};
pub use error::{ConnectError, RowError, SessionError, TableError, TableResult, decode_row_errors};
pub use schema::BfRtInfo;
pub use session::{StreamSession, SubscribeOptions, SubscribeState};
pub use table::{DataTuple, FieldValue, KeyTuple, MatchValue, TableClient, TableReader, TableRow, UpdateKind};
pub use tonic::Code;

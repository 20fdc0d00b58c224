//! Table CRUD over the management RPC.
//!
//! Rows are described by name (`TableRow`) and encoded against the table
//! schema at call time. Every call is a single round trip; nothing is
//! retried once the session is up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tonic::codec::Streaming;
use tracing::debug;

use crate::error::{TableError, TableResult};
use crate::proto::{self, BfRuntimeClient, data_field, key_field, table_entry};
use crate::schema::{BfRtInfo, FieldInfo, FieldKind, MatchKind, TableInfo, byte_len};
use crate::session::{StreamSession, SubscribeState};

/// The kind of write applied to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    Insert,
    Modify,
    Delete,
}

impl UpdateKind {
    fn wire(self) -> proto::update::Type {
        match self {
            UpdateKind::Insert => proto::update::Type::Insert,
            UpdateKind::Modify => proto::update::Type::Modify,
            UpdateKind::Delete => proto::update::Type::Delete,
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Insert => write!(f, "insert"),
            UpdateKind::Modify => write!(f, "modify"),
            UpdateKind::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchValue {
    Exact(u64),
    ExactBytes(Vec<u8>),
    Lpm { value: u64, prefix_len: u32 },
    Ternary { value: u64, mask: u64 },
}

impl fmt::Display for MatchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchValue::Exact(v) => write!(f, "{v:#x}"),
            MatchValue::ExactBytes(b) => {
                write!(f, "0x")?;
                b.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
            }
            MatchValue::Lpm { value, prefix_len } => write!(f, "{value:#x}/{prefix_len}"),
            MatchValue::Ternary { value, mask } => write!(f, "{value:#x}&&&{mask:#x}"),
        }
    }
}

/// One match field of a row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTuple {
    pub name: String,
    pub value: MatchValue,
}

impl KeyTuple {
    pub fn exact(name: impl Into<String>, value: impl Into<u64>) -> Self {
        Self {
            name: name.into(),
            value: MatchValue::Exact(value.into()),
        }
    }

    pub fn lpm(name: impl Into<String>, value: impl Into<u64>, prefix_len: u32) -> Self {
        Self {
            name: name.into(),
            value: MatchValue::Lpm {
                value: value.into(),
                prefix_len,
            },
        }
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Bytes(Vec<u8>),
    Bool(bool),
    Str(String),
    IntArray(Vec<u32>),
    BoolArray(Vec<bool>),
}

/// One data field (action parameter or table-level field).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTuple {
    pub name: String,
    pub value: FieldValue,
}

impl DataTuple {
    pub fn int(name: impl Into<String>, value: impl Into<u64>) -> Self {
        Self::new(name, FieldValue::Int(value.into()))
    }

    pub fn bytes(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(name, FieldValue::Bytes(value.into()))
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, FieldValue::Bool(value))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, FieldValue::Str(value.into()))
    }

    pub fn int_array(name: impl Into<String>, value: Vec<u32>) -> Self {
        Self::new(name, FieldValue::IntArray(value))
    }

    pub fn bool_array(name: impl Into<String>, value: Vec<bool>) -> Self {
        Self::new(name, FieldValue::BoolArray(value))
    }

    fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One entry of one table: key, action and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub table: String,
    pub key: Vec<KeyTuple>,
    pub action: Option<String>,
    pub data: Vec<DataTuple>,
}

impl TableRow {
    pub fn new(table: impl Into<String>, key: Vec<KeyTuple>) -> Self {
        Self {
            table: table.into(),
            key,
            action: None,
            data: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>, data: Vec<DataTuple>) -> Self {
        self.action = Some(action.into());
        self.data = data;
        self
    }

    pub fn with_data(mut self, data: Vec<DataTuple>) -> Self {
        self.data = data;
        self
    }

    pub fn key_value(&self, name: &str) -> Option<&MatchValue> {
        self.key.iter().find(|k| k.name == name).map(|k| &k.value)
    }

    pub fn data_value(&self, name: &str) -> Option<&FieldValue> {
        self.data.iter().find(|d| d.name == name).map(|d| &d.value)
    }

    pub fn key_display(&self) -> String {
        display_key(&self.key)
    }
}

fn display_key(key: &[KeyTuple]) -> String {
    if key.is_empty() {
        return "*".to_string();
    }
    key.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

// ── Encoding ───────────────────────────────────────────────────

fn encode_uint(table: &str, field: &str, value: u64, width: u32) -> TableResult<Vec<u8>> {
    if width < 64 && value >> width != 0 {
        return Err(TableError::InvalidValue {
            table: table.to_string(),
            field: field.to_string(),
            reason: format!("{value} does not fit in {width} bits"),
        });
    }
    let len = byte_len(width);
    let be = value.to_be_bytes();
    if len >= be.len() {
        let mut out = vec![0u8; len - be.len()];
        out.extend_from_slice(&be);
        Ok(out)
    } else {
        Ok(be[be.len() - len..].to_vec())
    }
}

fn decode_uint(bytes: &[u8]) -> u64 {
    let tail = &bytes[bytes.len().saturating_sub(8)..];
    tail.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn encode_bytes(table: &str, field: &str, value: &[u8], width: u32) -> TableResult<Vec<u8>> {
    let len = byte_len(width);
    if value.len() > len {
        return Err(TableError::InvalidValue {
            table: table.to_string(),
            field: field.to_string(),
            reason: format!("{} bytes exceed field width {width}", value.len()),
        });
    }
    let mut out = vec![0u8; len - value.len()];
    out.extend_from_slice(value);
    Ok(out)
}

pub(crate) fn encode_key(table: &TableInfo, key: &[KeyTuple]) -> TableResult<proto::TableKey> {
    let mut fields = Vec::with_capacity(key.len());
    for tuple in key {
        let info = table.key_field(&tuple.name)?;
        let match_type = match (&tuple.value, info.match_kind) {
            (MatchValue::Exact(v), MatchKind::Exact | MatchKind::Other) => {
                key_field::MatchType::Exact(key_field::Exact {
                    value: encode_uint(&table.name, &info.name, *v, info.width)?,
                })
            }
            (MatchValue::ExactBytes(b), MatchKind::Exact | MatchKind::Other) => {
                key_field::MatchType::Exact(key_field::Exact {
                    value: encode_bytes(&table.name, &info.name, b, info.width)?,
                })
            }
            (MatchValue::Lpm { value, prefix_len }, MatchKind::Lpm) => {
                key_field::MatchType::Lpm(key_field::Lpm {
                    value: encode_uint(&table.name, &info.name, *value, info.width)?,
                    prefix_len: *prefix_len as i32,
                })
            }
            (MatchValue::Ternary { value, mask }, MatchKind::Ternary) => {
                key_field::MatchType::Ternary(key_field::Ternary {
                    value: encode_uint(&table.name, &info.name, *value, info.width)?,
                    mask: encode_uint(&table.name, &info.name, *mask, info.width)?,
                })
            }
            (value, kind) => {
                return Err(TableError::InvalidValue {
                    table: table.name.clone(),
                    field: info.name.clone(),
                    reason: format!("{value} cannot be used for a {kind:?} match"),
                });
            }
        };
        fields.push(proto::KeyField {
            field_id: info.id,
            match_type: Some(match_type),
        });
    }

    let missing: Vec<String> = table
        .keys
        .iter()
        .filter(|k| !fields.iter().any(|f| f.field_id == k.id))
        .map(|k| k.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(TableError::IncompleteKey {
            table: table.name.clone(),
            missing,
        });
    }

    Ok(proto::TableKey { fields })
}

fn encode_field(table: &TableInfo, info: &FieldInfo, value: &FieldValue) -> TableResult<data_field::Value> {
    let invalid = |reason: &str| TableError::InvalidValue {
        table: table.name.clone(),
        field: info.name.clone(),
        reason: reason.to_string(),
    };
    Ok(match (value, info.kind) {
        (FieldValue::Int(v), FieldKind::Uint | FieldKind::Bytes) => {
            data_field::Value::Stream(encode_uint(&table.name, &info.name, *v, info.width)?)
        }
        (FieldValue::Bytes(b), FieldKind::Uint | FieldKind::Bytes) => {
            data_field::Value::Stream(encode_bytes(&table.name, &info.name, b, info.width)?)
        }
        (FieldValue::Bool(b), FieldKind::Bool) => data_field::Value::BoolVal(*b),
        (FieldValue::Str(s), FieldKind::String) => data_field::Value::StrVal(s.clone()),
        (FieldValue::IntArray(v), _) if info.repeated => {
            data_field::Value::IntArrVal(data_field::IntArray { val: v.clone() })
        }
        (FieldValue::BoolArray(v), FieldKind::Bool) if info.repeated => {
            data_field::Value::BoolArrVal(data_field::BoolArray { val: v.clone() })
        }
        _ => return Err(invalid("value type does not match the field schema")),
    })
}

pub(crate) fn encode_data(
    table: &TableInfo,
    action: Option<&str>,
    data: &[DataTuple],
) -> TableResult<proto::TableData> {
    let action = action.map(|name| table.action(name)).transpose()?;
    let fields = data
        .iter()
        .map(|tuple| {
            let info = table.data_field(action, &tuple.name)?;
            Ok(proto::DataField {
                field_id: info.id,
                value: Some(encode_field(table, info, &tuple.value)?),
            })
        })
        .collect::<TableResult<Vec<_>>>()?;
    Ok(proto::TableData {
        action_id: action.map(|a| a.id).unwrap_or(0),
        fields,
    })
}

pub(crate) fn decode_entry(table: &TableInfo, entry: proto::TableEntry) -> TableRow {
    let mut key = Vec::new();
    if let Some(table_entry::Value::Key(table_key)) = entry.value {
        for field in table_key.fields {
            let Some(info) = table.keys.iter().find(|k| k.id == field.field_id) else {
                continue;
            };
            let value = match field.match_type {
                Some(key_field::MatchType::Exact(e)) if info.width <= 64 => {
                    MatchValue::Exact(decode_uint(&e.value))
                }
                Some(key_field::MatchType::Exact(e)) => MatchValue::ExactBytes(e.value),
                Some(key_field::MatchType::Lpm(l)) => MatchValue::Lpm {
                    value: decode_uint(&l.value),
                    prefix_len: l.prefix_len.max(0) as u32,
                },
                Some(key_field::MatchType::Ternary(t)) => MatchValue::Ternary {
                    value: decode_uint(&t.value),
                    mask: decode_uint(&t.mask),
                },
                None => continue,
            };
            key.push(KeyTuple {
                name: info.name.clone(),
                value,
            });
        }
    }

    let mut row = TableRow::new(table.name.clone(), key);
    if let Some(data) = entry.data {
        let action = table.action_by_id(data.action_id);
        row.action = action.map(|a| a.name.clone());
        for field in data.fields {
            let Some(info) = table.field_by_id(action, field.field_id) else {
                continue;
            };
            let value = match field.value {
                Some(data_field::Value::Stream(b)) if info.width <= 64 => FieldValue::Int(decode_uint(&b)),
                Some(data_field::Value::Stream(b)) => FieldValue::Bytes(b),
                Some(data_field::Value::BoolVal(b)) => FieldValue::Bool(b),
                Some(data_field::Value::StrVal(s)) => FieldValue::Str(s),
                Some(data_field::Value::IntArrVal(a)) => FieldValue::IntArray(a.val),
                Some(data_field::Value::BoolArrVal(a)) => FieldValue::BoolArray(a.val),
                None => continue,
            };
            row.data.push(DataTuple {
                name: info.name.clone(),
                value,
            });
        }
    }
    row
}

// ── Client ─────────────────────────────────────────────────────

/// Table access bound to one device and one loaded program.
#[derive(Clone)]
pub struct TableClient {
    client: BfRuntimeClient,
    session: Arc<StreamSession>,
    info: Arc<BfRtInfo>,
    program: String,
    device_id: u32,
}

impl TableClient {
    pub fn new(
        client: BfRuntimeClient,
        session: Arc<StreamSession>,
        info: BfRtInfo,
        program: impl Into<String>,
        device_id: u32,
    ) -> Self {
        Self {
            client,
            session,
            info: Arc::new(info),
            program: program.into(),
            device_id,
        }
    }

    pub fn info(&self) -> &BfRtInfo {
        &self.info
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    fn target(&self) -> proto::TargetDevice {
        proto::TargetDevice {
            device_id: self.device_id,
            pipe_id: proto::ALL_PIPES,
            direction: 0xFF,
            prsr_id: 0xFF,
        }
    }

    fn ensure_subscribed(&self, table: &str) -> TableResult<()> {
        if self.session.state() != SubscribeState::Acked || self.session.is_closed() {
            return Err(TableError::Unavailable {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    /// Apply one update. Insert fails `DuplicateKey` when the row exists,
    /// Modify and Delete fail `NotFound` when it does not.
    pub async fn apply(&self, kind: UpdateKind, row: &TableRow) -> TableResult<()> {
        self.ensure_subscribed(&row.table)?;
        let table = self.info.table(&row.table)?;
        let key = encode_key(table, &row.key)?;
        let data = match kind {
            UpdateKind::Delete => None,
            UpdateKind::Insert | UpdateKind::Modify => {
                Some(encode_data(table, row.action.as_deref(), &row.data)?)
            }
        };
        let entry = proto::TableEntry {
            table_id: table.id,
            value: Some(table_entry::Value::Key(key)),
            data,
            is_default_entry: false,
            table_read_flag: None,
        };
        debug!(table = %table.name, key = %row.key_display(), %kind, "table write");
        self.write(table, kind, entry, &row.key_display()).await
    }

    pub async fn insert(&self, row: &TableRow) -> TableResult<()> {
        self.apply(UpdateKind::Insert, row).await
    }

    pub async fn modify(&self, row: &TableRow) -> TableResult<()> {
        self.apply(UpdateKind::Modify, row).await
    }

    /// Delete the row with `key`, or every row of the table when `key` is
    /// `None`.
    pub async fn delete(&self, table: &str, key: Option<&[KeyTuple]>) -> TableResult<()> {
        match key {
            Some(key) => self.apply(UpdateKind::Delete, &TableRow::new(table, key.to_vec())).await,
            None => {
                self.ensure_subscribed(table)?;
                let info = self.info.table(table)?;
                let entry = proto::TableEntry {
                    table_id: info.id,
                    value: None,
                    data: None,
                    is_default_entry: false,
                    table_read_flag: None,
                };
                debug!(table = %info.name, "clearing table");
                self.write(info, UpdateKind::Delete, entry, "*").await
            }
        }
    }

    async fn write(
        &self,
        table: &TableInfo,
        kind: UpdateKind,
        entry: proto::TableEntry,
        key: &str,
    ) -> TableResult<()> {
        let request = proto::WriteRequest {
            target: Some(self.target()),
            client_id: self.session.client_id(),
            updates: vec![proto::Update {
                r#type: kind.wire() as i32,
                entity: Some(proto::Entity {
                    entity: Some(proto::entity::Entity::TableEntry(entry)),
                }),
            }],
            atomicity: proto::write_request::Atomicity::ContinueOnError as i32,
            p4_name: self.program.clone(),
        };
        let mut client = self.client.clone();
        client
            .write(request)
            .await
            .map(|_| ())
            .map_err(|status| TableError::from_status(&table.name, key, status))
    }

    /// Lazily read every row of `table`. No RPC is issued until the first
    /// call to [`TableReader::next`].
    pub fn read(&self, table: &str) -> TableResult<TableReader> {
        self.ensure_subscribed(table)?;
        let name = self.info.table(table)?.name.clone();
        Ok(TableReader {
            client: self.clone(),
            table: name,
            buffer: VecDeque::new(),
            stream: None,
            done: false,
        })
    }
}

/// Finite, restartable sequence of rows read back from the switch.
pub struct TableReader {
    client: TableClient,
    table: String,
    buffer: VecDeque<TableRow>,
    stream: Option<Streaming<proto::ReadResponse>>,
    done: bool,
}

impl TableReader {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn next(&mut self) -> TableResult<Option<TableRow>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            let info = self.client.info.table(&self.table)?;
            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => {
                    let request = proto::ReadRequest {
                        target: Some(self.client.target()),
                        client_id: self.client.session.client_id(),
                        entities: vec![proto::Entity {
                            entity: Some(proto::entity::Entity::TableEntry(proto::TableEntry {
                                table_id: info.id,
                                ..Default::default()
                            })),
                        }],
                        p4_name: self.client.program.clone(),
                    };
                    let mut client = self.client.client.clone();
                    let response = client
                        .read(request)
                        .await
                        .map_err(|status| TableError::from_status(&info.name, "*", status))?;
                    self.stream.insert(response.into_inner())
                }
            };
            match stream.message().await {
                Ok(Some(response)) => {
                    for entity in response.entities {
                        if let Some(proto::entity::Entity::TableEntry(entry)) = entity.entity {
                            self.buffer.push_back(decode_entry(info, entry));
                        }
                    }
                }
                Ok(None) => {
                    self.done = true;
                    self.stream = None;
                }
                Err(status) => {
                    self.done = true;
                    self.stream = None;
                    return Err(TableError::from_status(&info.name, "*", status));
                }
            }
        }
    }

    /// Start over; the next call to `next` issues a fresh read.
    pub fn restart(&mut self) {
        self.buffer.clear();
        self.stream = None;
        self.done = false;
    }

    pub async fn collect(mut self) -> TableResult<Vec<TableRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::FORWARD_SCHEMA;

    fn info() -> BfRtInfo {
        BfRtInfo::from_json(FORWARD_SCHEMA.as_bytes()).unwrap()
    }

    #[test]
    fn test_key_encoded_big_endian_at_width() {
        let info = info();
        let table = info.table("SwitchIngress.forward").unwrap();
        let key = encode_key(table, &[KeyTuple::exact("hdr.ipv4.dst_addr", 0x0a00_0009u32)]).unwrap();
        match &key.fields[0].match_type {
            Some(key_field::MatchType::Exact(e)) => assert_eq!(e.value, vec![10, 0, 0, 9]),
            other => panic!("unexpected match {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_key_rejected() {
        let info = info();
        let table = info.table("SwitchIngress.forward").unwrap();
        let err = encode_key(table, &[]).unwrap_err();
        match err {
            TableError::IncompleteKey { missing, .. } => assert_eq!(missing, vec!["hdr.ipv4.dst_addr"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_value_wider_than_field_rejected() {
        let info = info();
        let table = info.table("SwitchIngress.forward").unwrap();
        let err = encode_data(
            table,
            Some("SwitchIngress.set_egress_port"),
            &[DataTuple::int("port", 1024u32)],
        )
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidValue { .. }));
    }

    #[test]
    fn test_action_data_encoding() {
        let info = info();
        let table = info.table("SwitchIngress.forward").unwrap();
        let data = encode_data(
            table,
            Some("SwitchIngress.set_egress_port_with_mac"),
            &[
                DataTuple::int("port", 3u32),
                DataTuple::bytes("dst_mac", vec![0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            ],
        )
        .unwrap();
        assert_eq!(data.action_id, 11);
        assert_eq!(data.fields[0].value, Some(data_field::Value::Stream(vec![0, 3])));
        assert_eq!(data.fields[1].field_id, 2);
    }

    #[test]
    fn test_selector_lists_encoded_whole() {
        let info = info();
        let table = info.table("SwitchIngress.action_selector").unwrap();
        let data = encode_data(
            table,
            None,
            &[
                DataTuple::int("$MAX_GROUP_SIZE", 4u32),
                DataTuple::int_array("$ACTION_MEMBER_ID", vec![0, 1]),
                DataTuple::bool_array("$ACTION_MEMBER_STATUS", vec![true, true]),
            ],
        )
        .unwrap();
        assert_eq!(data.action_id, 0);
        assert_eq!(
            data.fields[1].value,
            Some(data_field::Value::IntArrVal(data_field::IntArray { val: vec![0, 1] }))
        );
    }

    #[test]
    fn test_decode_entry_names_fields() {
        let info = info();
        let table = info.table("SwitchIngress.forward").unwrap();
        let entry = proto::TableEntry {
            table_id: table.id,
            value: Some(table_entry::Value::Key(proto::TableKey {
                fields: vec![proto::KeyField {
                    field_id: 1,
                    match_type: Some(key_field::MatchType::Exact(key_field::Exact {
                        value: vec![10, 0, 0, 1],
                    })),
                }],
            })),
            data: Some(proto::TableData {
                action_id: 10,
                fields: vec![proto::DataField {
                    field_id: 1,
                    value: Some(data_field::Value::Stream(vec![0, 2])),
                }],
            }),
            ..Default::default()
        };
        let row = decode_entry(table, entry);
        assert_eq!(row.key_value("hdr.ipv4.dst_addr"), Some(&MatchValue::Exact(0x0a00_0001)));
        assert_eq!(row.action.as_deref(), Some("SwitchIngress.set_egress_port"));
        assert_eq!(row.data_value("port"), Some(&FieldValue::Int(2)));
    }

    #[tokio::test]
    async fn test_calls_unavailable_before_subscribe() {
        let channel = tonic::transport::Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let (session, _peer) = StreamSession::with_queues(0);
        let client = TableClient::new(
            BfRuntimeClient::new(channel),
            Arc::new(session),
            info(),
            "t2na_load_balancer",
            0,
        );
        let row = TableRow::new("SwitchIngress.forward", vec![KeyTuple::exact("hdr.ipv4.dst_addr", 1u32)]);
        assert!(matches!(
            client.insert(&row).await,
            Err(TableError::Unavailable { .. })
        ));
        assert!(matches!(
            client.delete("SwitchIngress.forward", None).await,
            Err(TableError::Unavailable { .. })
        ));
        assert!(client.read("SwitchIngress.forward").is_err());
    }

    #[test]
    fn test_key_display() {
        let row = TableRow::new(
            "SwitchIngress.forward",
            vec![KeyTuple::exact("hdr.ipv4.dst_addr", 0x0a00_0001u32)],
        );
        assert_eq!(row.key_display(), "hdr.ipv4.dst_addr=0xa000001");
        assert_eq!(TableRow::new("t", vec![]).key_display(), "*");
    }

    mod read_stream {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use futures_util::stream::BoxStream;
        use tonic::transport::{Endpoint, Server};
        use tonic::{Request, Response, Status};

        use super::*;
        use crate::proto::bf_runtime_server::{BfRuntime, BfRuntimeServer};
        use crate::session::SubscribeOptions;

        /// Serves `Read` for the forward table in two response batches and
        /// counts the calls.
        #[derive(Clone, Default)]
        struct ForwardReads {
            calls: Arc<AtomicUsize>,
        }

        fn forward_entry(dst: [u8; 4], port: u8) -> proto::Entity {
            proto::Entity {
                entity: Some(proto::entity::Entity::TableEntry(proto::TableEntry {
                    table_id: 100,
                    value: Some(table_entry::Value::Key(proto::TableKey {
                        fields: vec![proto::KeyField {
                            field_id: 1,
                            match_type: Some(key_field::MatchType::Exact(key_field::Exact {
                                value: dst.to_vec(),
                            })),
                        }],
                    })),
                    data: Some(proto::TableData {
                        action_id: 10,
                        fields: vec![proto::DataField {
                            field_id: 1,
                            value: Some(data_field::Value::Stream(vec![0, port])),
                        }],
                    }),
                    ..Default::default()
                })),
            }
        }

        #[tonic::async_trait]
        impl BfRuntime for ForwardReads {
            type ReadStream = BoxStream<'static, Result<proto::ReadResponse, Status>>;
            type StreamChannelStream = BoxStream<'static, Result<proto::StreamMessageResponse, Status>>;

            async fn write(
                &self,
                _request: Request<proto::WriteRequest>,
            ) -> Result<Response<proto::WriteResponse>, Status> {
                Err(Status::unimplemented("write"))
            }

            async fn read(
                &self,
                request: Request<proto::ReadRequest>,
            ) -> Result<Response<Self::ReadStream>, Status> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let req = request.into_inner();
                let table_id = match req.entities.first().and_then(|e| e.entity.as_ref()) {
                    Some(proto::entity::Entity::TableEntry(entry)) => entry.table_id,
                    None => 0,
                };
                if table_id != 100 {
                    return Err(Status::not_found(format!("table {table_id}")));
                }
                let batches = vec![
                    Ok(proto::ReadResponse {
                        entities: vec![forward_entry([10, 0, 0, 1], 2), forward_entry([10, 0, 0, 2], 3)],
                    }),
                    Ok(proto::ReadResponse {
                        entities: vec![forward_entry([10, 0, 0, 9], 4)],
                    }),
                ];
                Ok(Response::new(Box::pin(futures_util::stream::iter(batches))))
            }

            async fn set_forwarding_pipeline_config(
                &self,
                _request: Request<proto::SetForwardingPipelineConfigRequest>,
            ) -> Result<Response<proto::SetForwardingPipelineConfigResponse>, Status> {
                Err(Status::unimplemented("set_forwarding_pipeline_config"))
            }

            async fn get_forwarding_pipeline_config(
                &self,
                _request: Request<proto::GetForwardingPipelineConfigRequest>,
            ) -> Result<Response<proto::GetForwardingPipelineConfigResponse>, Status> {
                Err(Status::unimplemented("get_forwarding_pipeline_config"))
            }

            async fn stream_channel(
                &self,
                _request: Request<tonic::Streaming<proto::StreamMessageRequest>>,
            ) -> Result<Response<Self::StreamChannelStream>, Status> {
                Err(Status::unimplemented("stream_channel"))
            }
        }

        async fn subscribed_client(service: ForwardReads) -> TableClient {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let incoming = Box::pin(futures_util::stream::unfold(listener, |listener| async move {
                let conn = listener.accept().await.map(|(stream, _)| stream);
                Some((conn, listener))
            }));
            tokio::spawn(
                Server::builder()
                    .add_service(BfRuntimeServer::new(service))
                    .serve_with_incoming(incoming),
            );
            let channel = Endpoint::from_shared(format!("http://{addr}"))
                .unwrap()
                .connect()
                .await
                .unwrap();

            let (session, peer) = StreamSession::with_queues(0);
            peer.ack(0, 0);
            session.subscribe(0, &SubscribeOptions::default()).await.unwrap();
            TableClient::new(
                BfRuntimeClient::new(channel),
                Arc::new(session),
                info(),
                "t2na_load_balancer",
                0,
            )
        }

        fn dst(row: &TableRow) -> Option<&MatchValue> {
            row.key_value("hdr.ipv4.dst_addr")
        }

        #[tokio::test]
        async fn test_read_is_lazy_finite_and_restartable() {
            let service = ForwardReads::default();
            let calls = service.calls.clone();
            let client = subscribed_client(service).await;

            let mut reader = client.read("SwitchIngress.forward").unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 0);

            let first = reader.next().await.unwrap().unwrap();
            assert_eq!(dst(&first), Some(&MatchValue::Exact(0x0a00_0001)));
            assert_eq!(first.data_value("port"), Some(&FieldValue::Int(2)));
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            let mut rest = Vec::new();
            while let Some(row) = reader.next().await.unwrap() {
                rest.push(row);
            }
            assert_eq!(rest.len(), 2);
            assert_eq!(dst(&rest[1]), Some(&MatchValue::Exact(0x0a00_0009)));
            assert!(reader.next().await.unwrap().is_none());
            assert_eq!(calls.load(Ordering::SeqCst), 1);

            reader.restart();
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            let again = reader.next().await.unwrap().unwrap();
            assert_eq!(dst(&again), Some(&MatchValue::Exact(0x0a00_0001)));
            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert_eq!(reader.collect().await.unwrap().len(), 2);
        }

        #[tokio::test]
        async fn test_read_error_carries_table() {
            let client = subscribed_client(ForwardReads::default()).await;
            let mut reader = client.read("SwitchIngress.action_selector").unwrap();
            let err = reader.next().await.unwrap_err();
            assert!(err.to_string().contains("SwitchIngress.action_selector"));
        }
    }
}

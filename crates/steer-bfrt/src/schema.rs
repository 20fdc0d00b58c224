//! Table schema resolution.
//!
//! The pipeline config carries a JSON document (`bfrt.json`) describing
//! every table: its key fields with match type and bit width, the actions
//! it accepts with their parameters, and action-independent data fields.
//! Names are resolved by suffix so callers can say `SwitchIngress.forward`
//! instead of `pipe.SwitchIngress.forward`.

use serde::Deserialize;

use crate::error::{TableError, TableResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Ternary,
    Lpm,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bytes,
    Uint,
    Bool,
    String,
}

#[derive(Debug, Clone)]
pub struct KeyFieldInfo {
    pub id: u32,
    pub name: String,
    pub match_kind: MatchKind,
    pub width: u32,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub id: u32,
    pub name: String,
    pub kind: FieldKind,
    pub width: u32,
    pub repeated: bool,
}

#[derive(Debug, Clone)]
pub struct ActionInfo {
    pub id: u32,
    pub name: String,
    pub data: Vec<FieldInfo>,
}

#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u32,
    pub name: String,
    pub keys: Vec<KeyFieldInfo>,
    pub actions: Vec<ActionInfo>,
    pub data: Vec<FieldInfo>,
}

/// Resolved schema for every table the switch exposes.
#[derive(Debug, Clone, Default)]
pub struct BfRtInfo {
    tables: Vec<TableInfo>,
}

// ── Raw document ───────────────────────────────────────────────

#[derive(Deserialize)]
struct RawSchema {
    #[serde(default)]
    tables: Vec<RawTable>,
}

#[derive(Deserialize)]
struct RawTable {
    name: String,
    id: u32,
    #[serde(default)]
    key: Vec<RawKeyField>,
    #[serde(default)]
    action_specs: Vec<RawAction>,
    #[serde(default)]
    data: Vec<RawDataEntry>,
}

#[derive(Deserialize)]
struct RawKeyField {
    id: u32,
    name: String,
    #[serde(default)]
    match_type: String,
    #[serde(rename = "type")]
    ty: Option<RawType>,
}

#[derive(Deserialize)]
struct RawAction {
    id: u32,
    name: String,
    #[serde(default)]
    data: Vec<RawDataEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDataEntry {
    Singleton { singleton: RawField },
    Oneof { oneof: Vec<RawField> },
    Plain(RawField),
}

#[derive(Deserialize)]
struct RawField {
    id: u32,
    name: String,
    #[serde(default)]
    repeated: bool,
    #[serde(rename = "type")]
    ty: Option<RawType>,
}

#[derive(Deserialize)]
struct RawType {
    #[serde(rename = "type")]
    kind: String,
    width: Option<u32>,
}

impl RawType {
    fn resolve(ty: Option<&RawType>) -> (FieldKind, u32) {
        let Some(ty) = ty else {
            return (FieldKind::Bytes, 32);
        };
        match ty.kind.as_str() {
            "bool" => (FieldKind::Bool, 1),
            "string" => (FieldKind::String, 0),
            "uint64" => (FieldKind::Uint, ty.width.unwrap_or(64)),
            "uint32" | "uint16" | "uint8" => (FieldKind::Uint, ty.width.unwrap_or(32)),
            _ => (FieldKind::Bytes, ty.width.unwrap_or(32)),
        }
    }
}

impl RawField {
    fn into_info(self) -> FieldInfo {
        let (kind, width) = RawType::resolve(self.ty.as_ref());
        FieldInfo {
            id: self.id,
            name: self.name,
            kind,
            width,
            repeated: self.repeated,
        }
    }
}

fn flatten_data(entries: Vec<RawDataEntry>) -> Vec<FieldInfo> {
    let mut out = Vec::new();
    for entry in entries {
        match entry {
            RawDataEntry::Singleton { singleton } => out.push(singleton.into_info()),
            RawDataEntry::Oneof { oneof } => out.extend(oneof.into_iter().map(RawField::into_info)),
            RawDataEntry::Plain(field) => out.push(field.into_info()),
        }
    }
    out
}

// ── Lookup ─────────────────────────────────────────────────────

/// `pipe.SwitchIngress.forward` answers to `SwitchIngress.forward` and
/// `forward`, but not to `ingress.forward`.
pub(crate) fn name_matches(full: &str, query: &str) -> bool {
    full == query
        || (full.len() > query.len()
            && full.ends_with(query)
            && full.as_bytes()[full.len() - query.len() - 1] == b'.')
}

fn find_by_name<'a, T>(items: &'a [T], query: &str, name: impl Fn(&T) -> &str) -> Option<&'a T> {
    items
        .iter()
        .find(|item| name(item) == query)
        .or_else(|| items.iter().find(|item| name_matches(name(item), query)))
}

impl BfRtInfo {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawSchema = serde_json::from_slice(bytes)?;
        let tables = raw
            .tables
            .into_iter()
            .map(|t| TableInfo {
                id: t.id,
                name: t.name,
                keys: t
                    .key
                    .into_iter()
                    .map(|k| {
                        let (_, width) = RawType::resolve(k.ty.as_ref());
                        KeyFieldInfo {
                            id: k.id,
                            name: k.name,
                            match_kind: match k.match_type.as_str() {
                                "Exact" => MatchKind::Exact,
                                "Ternary" => MatchKind::Ternary,
                                "LPM" => MatchKind::Lpm,
                                _ => MatchKind::Other,
                            },
                            width,
                        }
                    })
                    .collect(),
                actions: t
                    .action_specs
                    .into_iter()
                    .map(|a| ActionInfo {
                        id: a.id,
                        name: a.name,
                        data: flatten_data(a.data),
                    })
                    .collect(),
                data: flatten_data(t.data),
            })
            .collect();
        Ok(Self { tables })
    }

    /// Append the tables of another schema (the non-P4 fixed tables such
    /// as `$PORT` live in a separate document).
    pub fn merge(mut self, other: BfRtInfo) -> Self {
        self.tables.extend(other.tables);
        self
    }

    pub fn tables(&self) -> &[TableInfo] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> TableResult<&TableInfo> {
        find_by_name(&self.tables, name, |t| &t.name)
            .ok_or_else(|| TableError::UnknownTable(name.to_string()))
    }
}

impl TableInfo {
    pub fn key_field(&self, name: &str) -> TableResult<&KeyFieldInfo> {
        find_by_name(&self.keys, name, |k| &k.name).ok_or_else(|| TableError::UnknownField {
            table: self.name.clone(),
            field: name.to_string(),
        })
    }

    pub fn action(&self, name: &str) -> TableResult<&ActionInfo> {
        find_by_name(&self.actions, name, |a| &a.name).ok_or_else(|| TableError::UnknownAction {
            table: self.name.clone(),
            action: name.to_string(),
        })
    }

    /// Data field lookup: action parameters first, then table-level fields.
    pub fn data_field<'a>(
        &'a self,
        action: Option<&'a ActionInfo>,
        name: &str,
    ) -> TableResult<&'a FieldInfo> {
        action
            .and_then(|a| find_by_name(&a.data, name, |f| &f.name))
            .or_else(|| find_by_name(&self.data, name, |f| &f.name))
            .ok_or_else(|| TableError::UnknownField {
                table: self.name.clone(),
                field: name.to_string(),
            })
    }

    pub(crate) fn action_by_id(&self, id: u32) -> Option<&ActionInfo> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub(crate) fn field_by_id<'a>(&'a self, action: Option<&'a ActionInfo>, id: u32) -> Option<&'a FieldInfo> {
        action
            .and_then(|a| a.data.iter().find(|f| f.id == id))
            .or_else(|| self.data.iter().find(|f| f.id == id))
    }
}

/// Bytes needed to carry `width` bits.
pub fn byte_len(width: u32) -> usize {
    width.div_ceil(8).max(1) as usize
}

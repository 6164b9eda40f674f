//! Table schemas.
//!
//! A [`Schema`] is an ordered list of [`Column`]s. Every column carries a
//! stable numeric [`Tag`] that survives renames and is never reused within a
//! table's lineage: a dropped column's tag is retired, and the retired set
//! feeds tag allocation so a later column of the same name gets a new tag.
//!
//! Primary-key columns are listed in key order by [`Schema::pk_tags`]; a
//! schema without key columns describes a keyless table.

pub mod reconcile;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;
use crate::hash::{ContentHasher, Hash};
use crate::value::{StorageKind, Value};

pub use reconcile::{reconcile, reconcile_lenient, ColumnAlignment, ColumnChange, SchemaAlignment};

/// Stable column identity.
pub type Tag = u64;

/// Tags are allocated below this bound; everything above is reserved.
pub const TAG_SPACE: Tag = 1 << 50;

/// Reserved tag holding the duplicate count of a keyless row.
pub const KEYLESS_CARDINALITY_TAG: Tag = u64::MAX;

// ---------------------------------------------------------------------------
// Columns & constraints
// ---------------------------------------------------------------------------

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub tag: Tag,
    pub name: String,
    pub kind: StorageKind,
    pub nullable: bool,
    pub primary_key: bool,
    /// Value written into existing rows when the column is added.
    #[serde(default)]
    pub default: Option<Value>,
}

/// Comparison operator of a check constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `CHECK (column <op> literal)`. NULL satisfies every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConstraint {
    pub name: String,
    pub tag: Tag,
    pub op: CheckOp,
    pub value: Value,
}

impl CheckConstraint {
    pub fn holds(&self, v: &Value) -> bool {
        if v.is_null() {
            return true;
        }
        let ord = v.cmp(&self.value);
        match self.op {
            CheckOp::Eq => ord.is_eq(),
            CheckOp::Ne => ord.is_ne(),
            CheckOp::Lt => ord.is_lt(),
            CheckOp::Le => ord.is_le(),
            CheckOp::Gt => ord.is_gt(),
            CheckOp::Ge => ord.is_ge(),
        }
    }

    pub fn expression(&self, column: &str) -> String {
        let op = match self.op {
            CheckOp::Eq => "=",
            CheckOp::Ne => "<>",
            CheckOp::Lt => "<",
            CheckOp::Le => "<=",
            CheckOp::Gt => ">",
            CheckOp::Ge => ">=",
        };
        format!("{column} {op} {}", self.value)
    }
}

/// A unique index over one or more columns. Rows with a NULL in any indexed
/// column never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    pub name: String,
    pub tags: Vec<Tag>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Ordered column list plus key order and constraints.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<Column>,
    pk_tags: Vec<Tag>,
    #[serde(default)]
    uniques: Vec<UniqueConstraint>,
    #[serde(default)]
    checks: Vec<CheckConstraint>,
    /// Tags of dropped columns; never handed out again.
    #[serde(default)]
    retired_tags: BTreeSet<Tag>,
}

impl Schema {
    /// Start building a schema for `table`.
    pub fn builder(table: &str) -> SchemaBuilder {
        SchemaBuilder {
            table: table.to_string(),
            schema: Schema::default(),
            error: None,
        }
    }

    /// Assemble a schema from already-tagged columns. Key order follows the
    /// column order of the key columns.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self, SchemaError> {
        let mut schema = Schema::default();
        for col in columns {
            schema.push_column(col)?;
        }
        Ok(schema)
    }

    /// Reassemble a schema from its parts with an explicit key order.
    pub(crate) fn from_parts(
        columns: Vec<Column>,
        pk_tags: Vec<Tag>,
        uniques: Vec<UniqueConstraint>,
        checks: Vec<CheckConstraint>,
        retired_tags: BTreeSet<Tag>,
    ) -> Result<Self, SchemaError> {
        let mut schema = Schema::from_columns(columns)?;
        let mut sorted_given = pk_tags.clone();
        sorted_given.sort_unstable();
        let mut sorted_found = schema.pk_tags.clone();
        sorted_found.sort_unstable();
        if sorted_given != sorted_found {
            return Err(SchemaError::InvalidPrimaryKey(
                "key order does not match key columns".into(),
            ));
        }
        schema.pk_tags = pk_tags;
        schema.uniques = uniques;
        schema.checks = checks;
        schema.retired_tags = retired_tags;
        Ok(schema)
    }

    fn push_column(&mut self, col: Column) -> Result<(), SchemaError> {
        if self.column_by_name(&col.name).is_some() {
            return Err(SchemaError::DuplicateColumn(col.name));
        }
        if self.column_by_tag(col.tag).is_some() {
            return Err(SchemaError::DuplicateColumn(format!("{} (tag {})", col.name, col.tag)));
        }
        if col.primary_key {
            if col.nullable {
                return Err(SchemaError::InvalidPrimaryKey(format!(
                    "key column '{}' must be NOT NULL",
                    col.name
                )));
            }
            self.pk_tags.push(col.tag);
        }
        self.columns.push(col);
        Ok(())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_by_tag(&self, tag: Tag) -> Option<&Column> {
        self.columns.iter().find(|c| c.tag == tag)
    }

    /// Case-insensitive lookup by name.
    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn tag_of(&self, name: &str) -> Result<Tag, SchemaError> {
        self.column_by_name(name)
            .map(|c| c.tag)
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))
    }

    pub fn pk_tags(&self) -> &[Tag] {
        &self.pk_tags
    }

    /// Position of `tag` within the key tuple.
    pub fn pk_position(&self, tag: Tag) -> Option<usize> {
        self.pk_tags.iter().position(|t| *t == tag)
    }

    pub fn pk_columns(&self) -> impl Iterator<Item = &Column> {
        self.pk_tags.iter().filter_map(move |t| self.column_by_tag(*t))
    }

    pub fn non_pk_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.primary_key)
    }

    pub fn is_keyless(&self) -> bool {
        self.pk_tags.is_empty()
    }

    pub fn uniques(&self) -> &[UniqueConstraint] {
        &self.uniques
    }

    pub fn checks(&self) -> &[CheckConstraint] {
        &self.checks
    }

    pub fn retired_tags(&self) -> &BTreeSet<Tag> {
        &self.retired_tags
    }

    /// Human-readable key column list, for messages.
    pub fn pk_signature(&self) -> String {
        self.pk_columns()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Whether two schemas key their rows identically.
    pub fn same_key_set(&self, other: &Schema) -> bool {
        self.pk_tags == other.pk_tags
    }

    // -----------------------------------------------------------------------
    // Alteration
    // -----------------------------------------------------------------------

    /// Add a non-key column with a freshly allocated tag.
    pub fn add_column(
        &mut self,
        table: &str,
        name: &str,
        kind: StorageKind,
        nullable: bool,
        default: Option<Value>,
    ) -> Result<Tag, SchemaError> {
        if self.column_by_name(name).is_some() {
            return Err(SchemaError::DuplicateColumn(name.to_string()));
        }
        let tag = self.allocate_tag(table, name, kind)?;
        self.columns.push(Column {
            tag,
            name: name.to_string(),
            kind,
            nullable,
            primary_key: false,
            default,
        });
        Ok(tag)
    }

    /// Drop a non-key column, retiring its tag.
    pub fn drop_column(&mut self, name: &str) -> Result<Column, SchemaError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))?;
        if self.columns[idx].primary_key {
            return Err(SchemaError::InvalidPrimaryKey(format!(
                "cannot drop key column '{name}'"
            )));
        }
        let col = self.columns.remove(idx);
        self.retired_tags.insert(col.tag);
        self.uniques.retain(|u| !u.tags.contains(&col.tag));
        self.checks.retain(|c| c.tag != col.tag);
        Ok(col)
    }

    /// Rename a column. The tag is unchanged.
    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<Tag, SchemaError> {
        if let Some(existing) = self.column_by_name(to) {
            if !existing.name.eq_ignore_ascii_case(from) {
                return Err(SchemaError::DuplicateColumn(to.to_string()));
            }
        }
        let col = self
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(from))
            .ok_or_else(|| SchemaError::ColumnNotFound(from.to_string()))?;
        col.name = to.to_string();
        Ok(col.tag)
    }

    /// Change the storage kind of a column. The tag is unchanged.
    pub fn modify_column_kind(&mut self, name: &str, kind: StorageKind) -> Result<Column, SchemaError> {
        let col = self
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| SchemaError::ColumnNotFound(name.to_string()))?;
        let before = col.clone();
        col.kind = kind;
        Ok(before)
    }

    /// Replace the key column set. Rows must be re-keyed by the caller.
    pub fn set_primary_key(&mut self, names: &[&str]) -> Result<(), SchemaError> {
        let mut tags = Vec::with_capacity(names.len());
        for name in names {
            tags.push(self.tag_of(name)?);
        }
        for col in &mut self.columns {
            col.primary_key = tags.contains(&col.tag);
            if col.primary_key {
                col.nullable = false;
            }
        }
        self.pk_tags = tags;
        Ok(())
    }

    pub fn add_unique(&mut self, name: &str, columns: &[&str]) -> Result<(), SchemaError> {
        let mut tags = Vec::with_capacity(columns.len());
        for c in columns {
            tags.push(self.tag_of(c)?);
        }
        self.uniques.push(UniqueConstraint {
            name: name.to_string(),
            tags,
        });
        Ok(())
    }

    pub fn add_check(&mut self, name: &str, column: &str, op: CheckOp, value: Value) -> Result<(), SchemaError> {
        let tag = self.tag_of(column)?;
        self.checks.push(CheckConstraint {
            name: name.to_string(),
            tag,
            op,
            value,
        });
        Ok(())
    }

    /// Derive a tag from the table name, column definition and every tag the
    /// lineage has used so far. Including retired tags makes a re-added
    /// column land on a different tag than the one it replaces.
    fn allocate_tag(&self, table: &str, name: &str, kind: StorageKind) -> Result<Tag, SchemaError> {
        let mut used: BTreeSet<Tag> = self.columns.iter().map(|c| c.tag).collect();
        used.extend(self.retired_tags.iter().copied());

        for attempt in 0u64..64 {
            let mut h = ContentHasher::with_domain("column-tag");
            h.write_str(&table.to_ascii_lowercase());
            h.write_str(&name.to_ascii_lowercase());
            h.write_str(&kind.to_string());
            for t in &used {
                h.write_u64(*t);
            }
            h.write_u64(attempt);
            let digest = h.finish();
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest.as_bytes()[..8]);
            let tag = u64::from_be_bytes(raw) % TAG_SPACE;
            if tag != 0 && !used.contains(&tag) {
                return Ok(tag);
            }
        }
        Err(SchemaError::TagExhausted)
    }

    pub fn content_hash(&self) -> Hash {
        // Serializing a schema cannot fail: every field is a plain value type.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut h = ContentHasher::with_domain("schema");
        h.write_bytes(&bytes);
        h.finish()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent schema construction with automatic tag allocation.
pub struct SchemaBuilder {
    table: String,
    schema: Schema,
    error: Option<SchemaError>,
}

impl SchemaBuilder {
    fn push(mut self, name: &str, kind: StorageKind, nullable: bool, primary_key: bool) -> Self {
        if self.error.is_some() {
            return self;
        }
        let tag = match self.schema.allocate_tag(&self.table, name, kind) {
            Ok(t) => t,
            Err(e) => {
                self.error = Some(e);
                return self;
            }
        };
        let col = Column {
            tag,
            name: name.to_string(),
            kind,
            nullable,
            primary_key,
            default: None,
        };
        if let Err(e) = self.schema.push_column(col) {
            self.error = Some(e);
        }
        self
    }

    /// A primary-key column, in key order.
    pub fn key(self, name: &str, kind: StorageKind) -> Self {
        self.push(name, kind, false, true)
    }

    /// A nullable non-key column.
    pub fn column(self, name: &str, kind: StorageKind) -> Self {
        self.push(name, kind, true, false)
    }

    /// A NOT NULL non-key column.
    pub fn required(self, name: &str, kind: StorageKind) -> Self {
        self.push(name, kind, false, false)
    }

    pub fn unique(mut self, name: &str, columns: &[&str]) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.schema.add_unique(name, columns) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn check(mut self, name: &str, column: &str, op: CheckOp, value: impl Into<Value>) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.schema.add_check(name, column, op, value.into()) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.schema),
        }
    }
}

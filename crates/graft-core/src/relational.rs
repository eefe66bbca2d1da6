//! Boot-time relational model: identifiers, tables, columns and sequences.
//!
//! These types are populated while the metamodel is being built and are
//! read-only afterwards. The runtime uses them to render loader statements
//! and to back sequence-based identifier generation.

use crate::error::{Error, Result};
use crate::identifiers::{quote_ident, unquote_ident};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// Identifier
// ============================================================================

/// A database object name, possibly quoted.
///
/// Unquoted identifiers compare case-insensitively; quoted ones compare
/// exactly.
#[derive(Debug, Clone, Eq)]
pub struct Identifier {
    text: String,
    quoted: bool,
}

impl Identifier {
    /// Build an identifier from explicit text and quoting.
    pub fn new(text: impl Into<String>, quoted: bool) -> Self {
        Self {
            text: text.into(),
            quoted,
        }
    }

    /// Parse an identifier, recognising backtick or double-quote delimiters.
    ///
    /// Returns `None` for blank input.
    pub fn to_identifier(text: &str) -> Option<Self> {
        if text.trim().is_empty() {
            return None;
        }
        let (text, quoted) = unquote_ident(text);
        Some(Self { text, quoted })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_quoted(&self) -> bool {
        self.quoted
    }

    /// The name used for comparisons and map keys.
    pub fn canonical_name(&self) -> String {
        if self.quoted {
            self.text.clone()
        } else {
            self.text.to_ascii_lowercase()
        }
    }

    /// Render for inclusion in SQL text.
    pub fn render(&self) -> String {
        if self.quoted {
            quote_ident(&self.text)
        } else {
            self.text.clone()
        }
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_name() == other.canonical_name()
    }
}

impl std::hash::Hash for Identifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_name().hash(state);
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ============================================================================
// QualifiedName
// ============================================================================

const NAME_PART: &str = r#"(`[^`]+`|"[^"]+"|[^.`"\s]+)"#;

fn qualified_name_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(&format!(
                r"^\s*{NAME_PART}(?:\.{NAME_PART})?(?:\.{NAME_PART})?\s*$"
            ))
            .ok()
        })
        .as_ref()
}

/// `catalog.schema.name` with the first two parts optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub catalog: Option<Identifier>,
    pub schema: Option<Identifier>,
    pub name: Identifier,
}

impl QualifiedName {
    pub fn new(catalog: Option<Identifier>, schema: Option<Identifier>, name: Identifier) -> Self {
        Self {
            catalog,
            schema,
            name,
        }
    }

    /// Parse `name`, `schema.name` or `catalog.schema.name`.
    pub fn parse(text: &str) -> Result<Self> {
        let regex = qualified_name_regex()
            .ok_or_else(|| Error::Custom("qualified name pattern failed to compile".into()))?;
        let caps = regex
            .captures(text)
            .ok_or_else(|| Error::mapping(None, format!("invalid qualified name '{text}'")))?;

        let parts: Vec<Identifier> = (1..=3)
            .filter_map(|i| caps.get(i))
            .filter_map(|m| Identifier::to_identifier(m.as_str()))
            .collect();

        let mut parts = parts.into_iter().rev();
        let name = parts
            .next()
            .ok_or_else(|| Error::mapping(None, format!("invalid qualified name '{text}'")))?;
        let schema = parts.next();
        let catalog = parts.next();
        Ok(Self {
            catalog,
            schema,
            name,
        })
    }

    /// Render as dotted SQL text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(catalog) = &self.catalog {
            out.push_str(&catalog.render());
            out.push('.');
        }
        if let Some(schema) = &self.schema {
            out.push_str(&schema.render());
            out.push('.');
        }
        out.push_str(&self.name.render());
        out
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ============================================================================
// Tables and columns
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: Identifier,
    pub sql_type: String,
    pub nullable: bool,
    /// 1-based position assigned when added to a table
    pub position: usize,
}

impl Column {
    pub fn new(name: Identifier, sql_type: impl Into<String>) -> Self {
        Self {
            name,
            sql_type: sql_type.into(),
            nullable: true,
            position: 0,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: QualifiedName,
    columns: Vec<Column>,
    primary_key: Vec<Identifier>,
}

impl Table {
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Declare the primary key columns. Existing columns become non-null.
    pub fn set_primary_key(&mut self, columns: Vec<Identifier>) {
        for column in &mut self.columns {
            if columns.contains(&column.name) {
                column.nullable = false;
            }
        }
        self.primary_key = columns;
    }

    /// Add a column, returning its position.
    ///
    /// Re-adding a column with the same canonical name keeps the existing
    /// definition and position.
    pub fn add_column(&mut self, mut column: Column) -> usize {
        if let Some(existing) = self.column(&column.name) {
            return existing.position;
        }
        if self.primary_key.contains(&column.name) {
            tracing::debug!(
                column = %column.name,
                table = %self.name,
                "Forcing primary key column to be non-null"
            );
            column.nullable = false;
        }
        column.position = self.columns.len() + 1;
        let position = column.position;
        self.columns.push(column);
        position
    }

    pub fn column(&self, name: &Identifier) -> Option<&Column> {
        self.columns.iter().find(|c| &c.name == name)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[Identifier] {
        &self.primary_key
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

// ============================================================================
// Sequence
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub name: QualifiedName,
    initial_value: i64,
    increment_size: i64,
}

impl Sequence {
    pub fn new(name: QualifiedName) -> Self {
        Self::with_values(name, 1, 1)
    }

    pub fn with_values(name: QualifiedName, initial_value: i64, increment_size: i64) -> Self {
        Self {
            name,
            initial_value,
            increment_size,
        }
    }

    pub fn initial_value(&self) -> i64 {
        self.initial_value
    }

    pub fn increment_size(&self) -> i64 {
        self.increment_size
    }

    /// Check that another reference to this sequence agrees on its values.
    pub fn validate(&self, initial_value: i64, increment_size: i64) -> Result<()> {
        if self.initial_value != initial_value {
            return Err(Error::mapping(
                None,
                format!(
                    "Multiple references to database sequence [{}] set conflicting values for 'initial value': found [{}] and [{}]",
                    self.name, self.initial_value, initial_value
                ),
            ));
        }
        if self.increment_size != increment_size {
            return Err(Error::mapping(
                None,
                format!(
                    "Multiple references to database sequence [{}] set conflicting values for 'increment size': found [{}] and [{}]",
                    self.name, self.increment_size, increment_size
                ),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// DatabaseModel
// ============================================================================

/// All tables and sequences known to a metamodel.
#[derive(Debug, Clone, Default)]
pub struct DatabaseModel {
    tables: BTreeMap<String, Table>,
    sequences: BTreeMap<String, Sequence>,
}

impl DatabaseModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &QualifiedName) -> String {
        let mut key = String::new();
        if let Some(c) = &name.catalog {
            key.push_str(&c.canonical_name());
        }
        key.push('.');
        if let Some(s) = &name.schema {
            key.push_str(&s.canonical_name());
        }
        key.push('.');
        key.push_str(&name.name.canonical_name());
        key
    }

    /// Return the table registered under `name`, creating it if absent.
    pub fn table_mut(&mut self, name: &QualifiedName) -> &mut Table {
        self.tables
            .entry(Self::key(name))
            .or_insert_with(|| Table::new(name.clone()))
    }

    pub fn table(&self, name: &QualifiedName) -> Option<&Table> {
        self.tables.get(&Self::key(name))
    }

    /// Register a sequence. A second registration must agree on its values.
    pub fn add_sequence(&mut self, sequence: Sequence) -> Result<()> {
        let key = Self::key(&sequence.name);
        if let Some(existing) = self.sequences.get(&key) {
            return existing.validate(sequence.initial_value, sequence.increment_size);
        }
        self.sequences.insert(key, sequence);
        Ok(())
    }

    pub fn sequence(&self, name: &QualifiedName) -> Option<&Sequence> {
        self.sequences.get(&Self::key(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(s: &str) -> Identifier {
        Identifier::to_identifier(s).unwrap()
    }

    #[test]
    fn test_identifier_case_rules() {
        assert_eq!(ident("Orders"), ident("ORDERS"));
        assert_ne!(ident("`Orders`"), ident("`ORDERS`"));
        assert_eq!(ident("`Orders`").render(), "\"Orders\"");
        assert!(Identifier::to_identifier("  ").is_none());
    }

    #[test]
    fn test_qualified_name_parse() {
        let one = QualifiedName::parse("orders").unwrap();
        assert!(one.catalog.is_none() && one.schema.is_none());
        assert_eq!(one.name.text(), "orders");

        let two = QualifiedName::parse("sales.orders").unwrap();
        assert_eq!(two.schema.as_ref().unwrap().text(), "sales");
        assert!(two.catalog.is_none());

        let three = QualifiedName::parse("main.\"Sales\".`Order.Lines`").unwrap();
        assert_eq!(three.catalog.as_ref().unwrap().text(), "main");
        assert!(three.schema.as_ref().unwrap().is_quoted());
        assert_eq!(three.name.text(), "Order.Lines");
        assert_eq!(three.render(), "main.\"Sales\".\"Order.Lines\"");
    }

    #[test]
    fn test_qualified_name_rejects_garbage() {
        assert!(QualifiedName::parse("a.b.c.d").is_err());
        assert!(QualifiedName::parse("").is_err());
        assert!(QualifiedName::parse("a..b").is_err());
    }

    #[test]
    fn test_add_column_is_idempotent_and_forces_pk_non_null() {
        let mut table = Table::new(QualifiedName::parse("orders").unwrap());
        table.set_primary_key(vec![ident("id")]);
        assert_eq!(table.add_column(Column::new(ident("id"), "BIGINT")), 1);
        assert_eq!(table.add_column(Column::new(ident("total"), "DECIMAL")), 2);
        assert_eq!(table.add_column(Column::new(ident("ID"), "TEXT")), 1);
        assert_eq!(table.columns().len(), 2);
        assert!(!table.column(&ident("id")).unwrap().nullable);
        assert!(table.column(&ident("total")).unwrap().nullable);
        assert!(table.has_primary_key());
    }

    #[test]
    fn test_sequence_conflicts_rejected() {
        let mut model = DatabaseModel::new();
        let name = QualifiedName::parse("order_seq").unwrap();
        model
            .add_sequence(Sequence::with_values(name.clone(), 1, 50))
            .unwrap();
        model
            .add_sequence(Sequence::with_values(name.clone(), 1, 50))
            .unwrap();
        let err = model
            .add_sequence(Sequence::with_values(name.clone(), 1, 1))
            .unwrap_err();
        assert!(err.to_string().contains("increment size"));
        assert_eq!(model.sequence(&name).unwrap().increment_size(), 50);
    }

    #[test]
    fn test_table_lookup_by_canonical_name() {
        let mut model = DatabaseModel::new();
        model.table_mut(&QualifiedName::parse("Sales.Orders").unwrap());
        assert!(
            model
                .table(&QualifiedName::parse("sales.orders").unwrap())
                .is_some()
        );
        assert_eq!(model.tables().count(), 1);
    }
}

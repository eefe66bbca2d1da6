//! Persistent attribute descriptors and attribute-type plugins.

use super::version::{
    IntegerVersion, LongVersion, ShortVersion, TimestampVersion, VersionSupport, integral,
};
use crate::error::{Error, Result, TypeError};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Attribute types
// ============================================================================

/// Value-domain plugin for a basic attribute.
///
/// Supplies equality, mutability and deep-copy semantics; version-capable
/// types also expose a [`VersionSupport`].
pub trait AttributeType: Send + Sync + fmt::Debug {
    /// Short type name used in diagnostics.
    fn name(&self) -> &'static str;

    fn is_equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    /// Whether values of this type can be mutated in place.
    fn is_mutable(&self) -> bool {
        false
    }

    fn deep_copy(&self, value: &Value) -> Value {
        value.clone()
    }

    /// Canonical form of a non-null `value`, or `None` when this type cannot
    /// represent it.
    fn conform(&self, value: &Value) -> Option<Value> {
        Some(value.clone())
    }

    /// Version policy, if this type may back a version attribute.
    fn version_support(&self) -> Option<&dyn VersionSupport> {
        None
    }

    fn to_loggable(&self, value: &Value) -> String {
        value.to_string()
    }
}

/// Shared handle to an attribute type.
pub type TypeRef = Arc<dyn AttributeType>;

/// Representation of `value` in a type's own variant, `None` when it has
/// none. Null is handled by callers and never reaches these.
type Conform = fn(&Value) -> Option<Value>;

fn short_value(value: &Value) -> Option<Value> {
    integral(value)
        .and_then(|v| i16::try_from(v).ok())
        .map(Value::SmallInt)
}

fn integer_value(value: &Value) -> Option<Value> {
    integral(value)
        .and_then(|v| i32::try_from(v).ok())
        .map(Value::Int)
}

fn long_value(value: &Value) -> Option<Value> {
    integral(value).map(Value::BigInt)
}

fn timestamp_value(value: &Value) -> Option<Value> {
    match value {
        Value::Timestamp(_) => Some(value.clone()),
        other => integral(other).map(Value::Timestamp),
    }
}

fn text_value(value: &Value) -> Option<Value> {
    matches!(value, Value::Text(_)).then(|| value.clone())
}

fn bool_value(value: &Value) -> Option<Value> {
    matches!(value, Value::Bool(_)).then(|| value.clone())
}

fn uuid_value(value: &Value) -> Option<Value> {
    matches!(value, Value::Uuid(_)).then(|| value.clone())
}

macro_rules! immutable_type {
    ($ty:ident, $name:literal, $conform:expr) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        impl AttributeType for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn is_equal(&self, a: &Value, b: &Value) -> bool {
                let conform: Conform = $conform;
                match (conform(a), conform(b)) {
                    (Some(a), Some(b)) => a == b,
                    _ => a == b,
                }
            }

            fn conform(&self, value: &Value) -> Option<Value> {
                let conform: Conform = $conform;
                conform(value)
            }
        }
    };
    ($ty:ident, $name:literal, $conform:expr, $version:expr) => {
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $ty;

        impl AttributeType for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn is_equal(&self, a: &Value, b: &Value) -> bool {
                let conform: Conform = $conform;
                match (conform(a), conform(b)) {
                    (Some(a), Some(b)) => a == b,
                    _ => a == b,
                }
            }

            fn conform(&self, value: &Value) -> Option<Value> {
                let conform: Conform = $conform;
                conform(value)
            }

            fn version_support(&self) -> Option<&dyn VersionSupport> {
                Some(&$version)
            }
        }
    };
}

immutable_type!(ShortType, "short", short_value, ShortVersion);
immutable_type!(IntegerType, "integer", integer_value, IntegerVersion);
immutable_type!(LongType, "long", long_value, LongVersion);
immutable_type!(TimestampType, "timestamp", timestamp_value, TimestampVersion);
immutable_type!(StringType, "string", text_value);
immutable_type!(BooleanType, "boolean", bool_value);
immutable_type!(UuidType, "uuid", uuid_value);

/// Floating point; NaN equals NaN for dirty-checking purposes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DoubleType;

impl AttributeType for DoubleType {
    fn name(&self) -> &'static str {
        "double"
    }

    fn is_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits() || x == y,
            _ => a == b,
        }
    }
}

/// Decimal stored as text; equality ignores trailing fractional zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecimalType;

impl DecimalType {
    fn normalize(s: &str) -> &str {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.')
        } else {
            s
        }
    }
}

impl AttributeType for DecimalType {
    fn name(&self) -> &'static str {
        "decimal"
    }

    fn is_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Decimal(x), Value::Decimal(y)) => Self::normalize(x) == Self::normalize(y),
            _ => a == b,
        }
    }
}

/// Mutable byte arrays.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryType;

impl AttributeType for BinaryType {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn is_mutable(&self) -> bool {
        true
    }

    fn to_loggable(&self, value: &Value) -> String {
        match value {
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            other => other.to_string(),
        }
    }
}

/// Mutable JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonType;

impl AttributeType for JsonType {
    fn name(&self) -> &'static str {
        "json"
    }

    fn is_mutable(&self) -> bool {
        true
    }
}

// ============================================================================
// Associations and cascade styles
// ============================================================================

/// Which side of an association owns the foreign key relative to the parent.
///
/// `FromParent` associations can be resolved before the parent row exists;
/// `ToParent` associations point back at the parent and must wait until it
/// has been inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignKeyDirection {
    FromParent,
    ToParent,
}

/// Actions a cascade style may enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    SaveUpdate,
    Persist,
    Merge,
    Delete,
    Lock,
    Refresh,
    Evict,
}

impl CascadeAction {
    const fn bit(self) -> u8 {
        match self {
            CascadeAction::SaveUpdate => 1,
            CascadeAction::Persist => 1 << 1,
            CascadeAction::Merge => 1 << 2,
            CascadeAction::Delete => 1 << 3,
            CascadeAction::Lock => 1 << 4,
            CascadeAction::Refresh => 1 << 5,
            CascadeAction::Evict => 1 << 6,
        }
    }
}

/// Set of cascade actions configured on an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CascadeStyle(u8);

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle(0);
    pub const ALL: CascadeStyle = CascadeStyle(0x7f);

    pub fn of(actions: &[CascadeAction]) -> Self {
        CascadeStyle(actions.iter().fold(0, |acc, a| acc | a.bit()))
    }

    /// Parse a comma separated style list such as `"persist, merge"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut bits = 0u8;
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            bits |= match part.to_ascii_lowercase().as_str() {
                "all" => Self::ALL.0,
                "none" => 0,
                "save-update" => CascadeAction::SaveUpdate.bit(),
                "persist" => CascadeAction::Persist.bit(),
                "merge" => CascadeAction::Merge.bit(),
                "delete" => CascadeAction::Delete.bit(),
                "lock" => CascadeAction::Lock.bit(),
                "refresh" => CascadeAction::Refresh.bit(),
                "evict" => CascadeAction::Evict.bit(),
                other => {
                    return Err(Error::mapping(
                        None,
                        format!("unsupported cascade style: {other}"),
                    ));
                }
            };
        }
        Ok(CascadeStyle(bits))
    }

    /// Whether this style cascades `action`.
    ///
    /// `persist` and `save-update` enable each other.
    pub fn includes(self, action: CascadeAction) -> bool {
        let bit = match action {
            CascadeAction::SaveUpdate | CascadeAction::Persist => {
                CascadeAction::SaveUpdate.bit() | CascadeAction::Persist.bit()
            }
            other => other.bit(),
        };
        self.0 & bit != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

// ============================================================================
// Attribute descriptor
// ============================================================================

#[derive(Debug, Clone)]
pub enum AttributeKind {
    Basic(TypeRef),
    ToOne {
        target: String,
        direction: ForeignKeyDirection,
    },
    ToMany {
        target: String,
        direction: ForeignKeyDirection,
    },
}

/// One persistent attribute of an entity.
#[derive(Debug, Clone)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: AttributeKind,
    /// Column name; `None` for to-many associations.
    pub column: Option<String>,
    /// Secondary table holding the column, `None` for the primary table.
    pub table: Option<String>,
    pub cascade: CascadeStyle,
    /// Participates in optimistic locking.
    pub versionable: bool,
    pub nullable: bool,
}

impl AttributeDescriptor {
    pub fn basic(name: impl Into<String>, ty: impl AttributeType + 'static) -> Self {
        let name = name.into();
        Self {
            column: Some(name.clone()),
            name,
            kind: AttributeKind::Basic(Arc::new(ty)),
            table: None,
            cascade: CascadeStyle::NONE,
            versionable: true,
            nullable: true,
        }
    }

    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: Some(format!("{name}_id")),
            name,
            kind: AttributeKind::ToOne {
                target: target.into(),
                direction: ForeignKeyDirection::FromParent,
            },
            table: None,
            cascade: CascadeStyle::NONE,
            versionable: true,
            nullable: true,
        }
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: AttributeKind::ToMany {
                target: target.into(),
                direction: ForeignKeyDirection::ToParent,
            },
            column: None,
            table: None,
            cascade: CascadeStyle::NONE,
            versionable: true,
            nullable: true,
        }
    }

    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    #[must_use]
    pub fn in_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: ForeignKeyDirection) -> Self {
        match &mut self.kind {
            AttributeKind::ToOne { direction: d, .. } | AttributeKind::ToMany { direction: d, .. } => {
                *d = direction;
            }
            AttributeKind::Basic(_) => {}
        }
        self
    }

    /// Exclude this attribute from optimistic-lock checks.
    #[must_use]
    pub fn excluded_from_locking(mut self) -> Self {
        self.versionable = false;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn is_association(&self) -> bool {
        !matches!(self.kind, AttributeKind::Basic(_))
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AttributeKind::ToMany { .. })
    }

    /// Target entity name of an association.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::ToOne { target, .. } | AttributeKind::ToMany { target, .. } => {
                Some(target)
            }
            AttributeKind::Basic(_) => None,
        }
    }

    pub fn foreign_key_direction(&self) -> Option<ForeignKeyDirection> {
        match &self.kind {
            AttributeKind::ToOne { direction, .. } | AttributeKind::ToMany { direction, .. } => {
                Some(*direction)
            }
            AttributeKind::Basic(_) => None,
        }
    }

    pub fn attribute_type(&self) -> Option<&TypeRef> {
        match &self.kind {
            AttributeKind::Basic(ty) => Some(ty),
            _ => None,
        }
    }

    /// Equality of two disassembled values of this attribute.
    pub fn is_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.kind {
            AttributeKind::Basic(ty) => ty.is_equal(a, b),
            _ => a == b,
        }
    }

    pub fn deep_copy(&self, value: &Value) -> Value {
        match &self.kind {
            AttributeKind::Basic(ty) => ty.deep_copy(value),
            _ => value.clone(),
        }
    }

    /// `value` converted to this attribute's type.
    ///
    /// Null passes through; associations are not checked here.
    pub fn conform(&self, value: Value) -> Result<Value> {
        let AttributeKind::Basic(ty) = &self.kind else {
            return Ok(value);
        };
        if value.is_null() {
            return Ok(value);
        }
        ty.conform(&value).ok_or_else(|| {
            Error::Type(TypeError {
                expected: ty.name(),
                actual: value.type_name().to_string(),
                attribute: Some(self.name.clone()),
            })
        })
    }
}

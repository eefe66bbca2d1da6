//! Entity descriptors: the static, per-type description of an entity.

use super::attribute::{AttributeDescriptor, AttributeKind, AttributeType, TypeRef};
use super::loader::{EntityLoader, LockMode};
use super::version::VersionSupport;
use crate::error::{Error, Result};
use crate::relational::{Identifier, QualifiedName};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

// ============================================================================
// Identifier and version descriptors
// ============================================================================

/// How identifiers are obtained for new instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdGeneration {
    /// The application assigns the identifier before saving.
    Assigned,
    /// Values come from the named database sequence.
    Sequence(String),
}

/// Identifier unsaved-value strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierUnsaved {
    /// A null identifier means unsaved.
    Null,
    /// Always unsaved.
    Any,
    /// Never unsaved.
    None,
    /// Cannot decide from the identifier alone.
    Undefined,
    /// This specific identifier value means unsaved.
    Value(Value),
}

impl IdentifierUnsaved {
    /// `Some(true)` when `id` marks an unsaved instance, `None` when undecided.
    pub fn is_unsaved(&self, id: Option<&Value>) -> Option<bool> {
        let id = id.filter(|v| !v.is_null());
        match self {
            IdentifierUnsaved::Null => Some(id.is_none()),
            IdentifierUnsaved::Any => Some(true),
            IdentifierUnsaved::None => Some(false),
            IdentifierUnsaved::Undefined => None,
            IdentifierUnsaved::Value(unsaved) => Some(id == Some(unsaved)),
        }
    }
}

/// Version unsaved-value strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionUnsaved {
    /// A null version means unsaved; otherwise undecided.
    #[default]
    Undefined,
    /// Unsaved exactly when the version is null.
    Null,
    /// Unsaved when the version is null or a negative number.
    Negative,
}

impl VersionUnsaved {
    pub fn is_unsaved(self, version: Option<&Value>) -> Option<bool> {
        let version = version.filter(|v| !v.is_null());
        match (self, version) {
            (_, None) => Some(true),
            (VersionUnsaved::Undefined, Some(_)) => None,
            (VersionUnsaved::Null, Some(_)) => Some(false),
            (VersionUnsaved::Negative, Some(v)) => Some(v.is_negative_number()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentifierDescriptor {
    pub name: String,
    pub id_type: TypeRef,
    pub column: String,
    pub generation: IdGeneration,
    pub unsaved: IdentifierUnsaved,
}

#[derive(Debug, Clone, Copy)]
pub struct VersionDescriptor {
    /// Index of the version attribute among the entity's attributes.
    pub index: usize,
    pub unsaved: VersionUnsaved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: QualifiedName,
}

/// A secondary table joined to the primary table on the identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryTableJoin {
    pub table: QualifiedName,
    /// Column in the secondary table referencing the primary key.
    pub key_column: String,
    /// Optional joins are rendered as outer joins.
    pub optional: bool,
}

// ============================================================================
// EntityDescriptor
// ============================================================================

/// Static description of one entity type.
///
/// Immutable once the owning metamodel is built, apart from the internal
/// loader cache which is safe for concurrent use.
#[derive(Debug)]
pub struct EntityDescriptor {
    name: String,
    super_entity: Option<String>,
    root_name: String,
    identifier: IdentifierDescriptor,
    version: Option<VersionDescriptor>,
    attributes: Vec<AttributeDescriptor>,
    table: TableRef,
    secondary_tables: Vec<SecondaryTableJoin>,
    dirty_tracking: bool,
    mutable: bool,
    loaders: RwLock<HashMap<LockMode, Arc<EntityLoader>>>,
}

impl EntityDescriptor {
    pub fn builder(name: impl Into<String>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn super_entity(&self) -> Option<&str> {
        self.super_entity.as_deref()
    }

    /// Name of the root of this entity's hierarchy; entity keys use it.
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    pub(crate) fn set_root_name(&mut self, root: String) {
        self.root_name = root;
    }

    pub fn identifier(&self) -> &IdentifierDescriptor {
        &self.identifier
    }

    pub fn version(&self) -> Option<&VersionDescriptor> {
        self.version.as_ref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version.map(|v| v.index)
    }

    /// Version policy of the version attribute's type.
    pub fn version_support(&self) -> Option<&dyn VersionSupport> {
        let index = self.version_index()?;
        self.attributes[index]
            .attribute_type()
            .and_then(|ty| ty.version_support())
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute(&self, index: usize) -> Option<&AttributeDescriptor> {
        self.attributes.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn secondary_tables(&self) -> &[SecondaryTableJoin] {
        &self.secondary_tables
    }

    /// Whether instances track their own dirty attributes.
    pub fn is_dirty_tracking(&self) -> bool {
        self.dirty_tracking
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Optimistic-lock participation flag per attribute.
    pub fn property_versionability(&self) -> Vec<bool> {
        self.attributes.iter().map(|a| a.versionable).collect()
    }

    /// Unsaved-value heuristic.
    ///
    /// Returns `Some(true)` for transient, `Some(false)` for saved, `None`
    /// when neither the version nor the identifier decides.
    pub fn is_transient(&self, id: Option<&Value>, version: Option<&Value>) -> Option<bool> {
        if id.is_none_or(Value::is_null) {
            return Some(true);
        }
        if let Some(desc) = &self.version {
            if let Some(result) = desc.unsaved.is_unsaved(version) {
                return Some(result);
            }
        }
        self.identifier.unsaved.is_unsaved(id)
    }

    /// Loader for `lock_mode`, created on first use and cached.
    pub fn loader(&self, lock_mode: LockMode) -> Arc<EntityLoader> {
        {
            let cache = self.loaders.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(loader) = cache.get(&lock_mode) {
                return Arc::clone(loader);
            }
        }
        let mut cache = self.loaders.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(lock_mode).or_insert_with(|| {
            tracing::trace!(entity = %self.name, lock_mode = %lock_mode, "Creating entity loader");
            Arc::new(EntityLoader::new(
                self.name.clone(),
                lock_mode,
                self.render_select(lock_mode),
            ))
        }))
    }

    fn render_select(&self, lock_mode: LockMode) -> String {
        let column = |name: &str| {
            Identifier::to_identifier(name).map_or_else(|| name.to_string(), |i| i.render())
        };
        let id_column = column(&self.identifier.column);

        let mut select = vec![format!("t0.{id_column}")];
        for attr in &self.attributes {
            let Some(col) = &attr.column else { continue };
            let alias = attr
                .table
                .as_deref()
                .and_then(|t| self.secondary_index(t))
                .map_or(0, |i| i + 1);
            select.push(format!("t{alias}.{}", column(col)));
        }

        let mut sql = format!(
            "SELECT {} FROM {} t0",
            select.join(", "),
            self.table.name.render()
        );
        for (i, join) in self.secondary_tables.iter().enumerate() {
            let alias = i + 1;
            let kind = if join.optional {
                "LEFT OUTER JOIN"
            } else {
                "INNER JOIN"
            };
            sql.push_str(&format!(
                " {kind} {} t{alias} ON t0.{id_column} = t{alias}.{}",
                join.table.render(),
                column(&join.key_column)
            ));
        }
        sql.push_str(&format!(" WHERE t0.{id_column} = ?"));
        sql.push_str(lock_mode.sql_suffix());
        sql
    }

    fn secondary_index(&self, table: &str) -> Option<usize> {
        let wanted = QualifiedName::parse(table).ok()?;
        self.secondary_tables.iter().position(|j| j.table == wanted)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`EntityDescriptor`].
#[derive(Debug)]
pub struct EntityDescriptorBuilder {
    name: String,
    super_entity: Option<String>,
    table: Option<String>,
    identifier: Option<IdentifierDescriptor>,
    id_unsaved: Option<IdentifierUnsaved>,
    version: Option<VersionDescriptor>,
    attributes: Vec<AttributeDescriptor>,
    secondary: Vec<(String, String, bool)>,
    dirty_tracking: bool,
    mutable: bool,
}

impl EntityDescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_entity: None,
            table: None,
            identifier: None,
            id_unsaved: None,
            version: None,
            attributes: Vec::new(),
            secondary: Vec::new(),
            dirty_tracking: false,
            mutable: true,
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn extends(mut self, super_entity: impl Into<String>) -> Self {
        self.super_entity = Some(super_entity.into());
        self
    }

    /// Declare an application-assigned identifier.
    #[must_use]
    pub fn id(mut self, name: impl Into<String>, ty: impl AttributeType + 'static) -> Self {
        let name = name.into();
        self.identifier = Some(IdentifierDescriptor {
            column: name.clone(),
            name,
            id_type: Arc::new(ty),
            generation: IdGeneration::Assigned,
            unsaved: IdentifierUnsaved::Undefined,
        });
        self
    }

    #[must_use]
    pub fn id_column(mut self, column: impl Into<String>) -> Self {
        if let Some(id) = &mut self.identifier {
            id.column = column.into();
        }
        self
    }

    /// Generate identifiers from a database sequence.
    #[must_use]
    pub fn sequence_generated(mut self, sequence: impl Into<String>) -> Self {
        if let Some(id) = &mut self.identifier {
            id.generation = IdGeneration::Sequence(sequence.into());
            id.unsaved = IdentifierUnsaved::Null;
        }
        self
    }

    #[must_use]
    pub fn id_unsaved_value(mut self, unsaved: IdentifierUnsaved) -> Self {
        self.id_unsaved = Some(unsaved);
        self
    }

    /// Declare the version attribute. It is appended to the attribute list.
    #[must_use]
    pub fn version(mut self, name: impl Into<String>, ty: impl AttributeType + 'static) -> Self {
        self.version = Some(VersionDescriptor {
            index: self.attributes.len(),
            unsaved: self.version.map(|v| v.unsaved).unwrap_or_default(),
        });
        self.attributes
            .push(AttributeDescriptor::basic(name, ty).excluded_from_locking());
        self
    }

    #[must_use]
    pub fn version_unsaved_value(mut self, unsaved: VersionUnsaved) -> Self {
        if let Some(v) = &mut self.version {
            v.unsaved = unsaved;
        }
        self
    }

    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    #[must_use]
    pub fn basic(self, name: impl Into<String>, ty: impl AttributeType + 'static) -> Self {
        self.attribute(AttributeDescriptor::basic(name, ty))
    }

    #[must_use]
    pub fn secondary_table(
        mut self,
        table: impl Into<String>,
        key_column: impl Into<String>,
        optional: bool,
    ) -> Self {
        self.secondary.push((table.into(), key_column.into(), optional));
        self
    }

    /// Instances track their own dirty attributes.
    #[must_use]
    pub fn dirty_tracking(mut self) -> Self {
        self.dirty_tracking = true;
        self
    }

    /// Loaded instances are read-only and never dirty-checked.
    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn build(self) -> Result<EntityDescriptor> {
        let entity = Some(self.name.as_str());
        let mut identifier = self
            .identifier
            .ok_or_else(|| Error::mapping(entity, "entity has no identifier"))?;
        if let Some(unsaved) = self.id_unsaved {
            identifier.unsaved = unsaved;
        }

        let table_name = self.table.unwrap_or_else(|| self.name.clone());
        let table = TableRef {
            name: QualifiedName::parse(&table_name)?,
        };

        let mut secondary_tables = Vec::with_capacity(self.secondary.len());
        for (name, key_column, optional) in self.secondary {
            secondary_tables.push(SecondaryTableJoin {
                table: QualifiedName::parse(&name)?,
                key_column,
                optional,
            });
        }

        let mut seen = HashSet::new();
        for attr in &self.attributes {
            if attr.name == identifier.name || !seen.insert(attr.name.as_str()) {
                return Err(Error::mapping(
                    entity,
                    format!("duplicate attribute '{}'", attr.name),
                ));
            }
            if let Some(t) = &attr.table {
                let wanted = QualifiedName::parse(t)?;
                if !secondary_tables.iter().any(|j| j.table == wanted) {
                    return Err(Error::mapping(
                        entity,
                        format!("attribute '{}' maps to unknown table '{t}'", attr.name),
                    ));
                }
            }
        }

        if let Some(version) = &self.version {
            let attr = &self.attributes[version.index];
            let supported = matches!(&attr.kind, AttributeKind::Basic(ty) if ty.version_support().is_some());
            if !supported {
                return Err(Error::mapping(
                    entity,
                    format!("attribute '{}' has a type that cannot be versioned", attr.name),
                ));
            }
        }

        Ok(EntityDescriptor {
            root_name: self.name.clone(),
            name: self.name,
            super_entity: self.super_entity,
            identifier,
            version: self.version,
            attributes: self.attributes,
            table,
            secondary_tables,
            dirty_tracking: self.dirty_tracking,
            mutable: self.mutable,
            loaders: RwLock::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::attribute::{LongType, StringType};
    use crate::metamodel::IntegerType;

    fn order() -> EntityDescriptor {
        EntityDescriptor::builder("Order")
            .table("sales.orders")
            .id("id", LongType)
            .sequence_generated("order_seq")
            .version("version", IntegerType)
            .basic("status", StringType)
            .attribute(AttributeDescriptor::basic("notes", StringType).in_table("order_notes"))
            .secondary_table("order_notes", "order_id", true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_transient_heuristic_prefers_version_then_id() {
        let desc = order();
        assert_eq!(desc.is_transient(None, None), Some(true));
        assert_eq!(desc.is_transient(Some(&Value::Null), None), Some(true));
        // version null decides before the identifier
        assert_eq!(desc.is_transient(Some(&Value::BigInt(1)), None), Some(true));
        // version present: undefined strategy falls through to id (Null strategy)
        assert_eq!(
            desc.is_transient(Some(&Value::BigInt(1)), Some(&Value::Int(3))),
            Some(false)
        );
    }

    #[test]
    fn test_unsaved_value_strategies() {
        assert_eq!(VersionUnsaved::Negative.is_unsaved(Some(&Value::Int(-1))), Some(true));
        assert_eq!(VersionUnsaved::Negative.is_unsaved(Some(&Value::Int(0))), Some(false));
        assert_eq!(VersionUnsaved::Null.is_unsaved(Some(&Value::Int(-1))), Some(false));
        assert_eq!(VersionUnsaved::Undefined.is_unsaved(Some(&Value::Int(2))), None);
        assert_eq!(
            IdentifierUnsaved::Value(Value::BigInt(0)).is_unsaved(Some(&Value::BigInt(0))),
            Some(true)
        );
        assert_eq!(IdentifierUnsaved::Any.is_unsaved(Some(&Value::BigInt(5))), Some(true));
        assert_eq!(IdentifierUnsaved::None.is_unsaved(None), Some(false));
        assert_eq!(IdentifierUnsaved::Undefined.is_unsaved(Some(&Value::BigInt(5))), None);
    }

    #[test]
    fn test_loader_cached_per_lock_mode() {
        let desc = order();
        let a = desc.loader(LockMode::None);
        let b = desc.loader(LockMode::None);
        let c = desc.loader(LockMode::PessimisticWrite);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(
            a.sql,
            "SELECT t0.id, t0.version, t0.status, t1.notes FROM sales.orders t0 \
             LEFT OUTER JOIN order_notes t1 ON t0.id = t1.order_id WHERE t0.id = ?"
        );
        assert!(c.sql.ends_with("FOR UPDATE"));
    }

    #[test]
    fn test_build_rejects_bad_mappings() {
        let no_id = EntityDescriptor::builder("Thing").basic("a", StringType).build();
        assert!(no_id.is_err());

        let dup = EntityDescriptor::builder("Thing")
            .id("id", LongType)
            .basic("a", StringType)
            .basic("a", StringType)
            .build();
        assert!(dup.is_err());

        let bad_version = EntityDescriptor::builder("Thing")
            .id("id", LongType)
            .version("v", StringType)
            .build();
        assert!(bad_version.is_err());

        let bad_table = EntityDescriptor::builder("Thing")
            .id("id", LongType)
            .attribute(AttributeDescriptor::basic("a", StringType).in_table("missing"))
            .build();
        assert!(bad_table.is_err());
    }

    #[test]
    fn test_versionability_excludes_version_attribute() {
        let desc = order();
        assert_eq!(desc.property_versionability(), vec![false, true, true]);
        assert_eq!(desc.version_index(), Some(0));
        assert!(desc.version_support().is_some());
        assert_eq!(desc.index_of("status"), Some(1));
        assert_eq!(desc.root_name(), "Order");
    }
}

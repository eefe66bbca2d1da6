//! Runtime metamodel: entity descriptors, attribute types and loaders.
//!
//! A [`Metamodel`] is assembled once at boot through [`MetamodelBuilder`],
//! which validates cross-entity references and populates the relational
//! [`DatabaseModel`]. After `build()` it is shared read-only.

pub mod attribute;
pub mod entity;
pub mod loader;
pub mod version;

pub use attribute::{
    AttributeDescriptor, AttributeKind, AttributeType, BinaryType, BooleanType, CascadeAction,
    CascadeStyle, DecimalType, DoubleType, ForeignKeyDirection, IntegerType, JsonType, LongType,
    ShortType, StringType, TimestampType, TypeRef, UuidType,
};
pub use entity::{
    EntityDescriptor, EntityDescriptorBuilder, IdGeneration, IdentifierDescriptor,
    IdentifierUnsaved, SecondaryTableJoin, TableRef, VersionDescriptor, VersionUnsaved,
};
pub use loader::{EntityLoader, LockMode};
pub use version::{
    IntegerVersion, LongVersion, ShortVersion, TimestampVersion, VersionContext, VersionSupport,
};

use crate::error::{Error, Result};
use crate::relational::{Column, DatabaseModel, Identifier, QualifiedName, Sequence};
use std::collections::HashMap;
use std::sync::Arc;

/// All entity descriptors of one session factory.
#[derive(Debug)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityDescriptor>>,
    database: DatabaseModel,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Descriptor for `name`, or a mapping error when unknown.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityDescriptor>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::mapping(Some(name), "unknown entity"))
    }

    pub fn find_entity(&self, name: &str) -> Option<&Arc<EntityDescriptor>> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityDescriptor>> {
        self.entities.values()
    }

    pub fn database(&self) -> &DatabaseModel {
        &self.database
    }

    /// Is `name` the same entity as `ancestor` or one of its subclasses?
    pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
        let mut current = Some(name);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.entities.get(n).and_then(|d| d.super_entity());
        }
        false
    }
}

/// Boot-time assembly of a [`Metamodel`].
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityDescriptor>,
    sequences: Vec<Sequence>,
}

impl MetamodelBuilder {
    #[must_use]
    pub fn entity(mut self, descriptor: EntityDescriptor) -> Self {
        self.entities.push(descriptor);
        self
    }

    /// Declare a sequence with explicit initial value and increment.
    #[must_use]
    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequences.push(sequence);
        self
    }

    pub fn build(self) -> Result<Metamodel> {
        let mut entities: HashMap<String, EntityDescriptor> = HashMap::new();
        for descriptor in self.entities {
            if entities.contains_key(descriptor.name()) {
                return Err(Error::mapping(
                    Some(descriptor.name()),
                    "entity declared more than once",
                ));
            }
            entities.insert(descriptor.name().to_string(), descriptor);
        }

        // Resolve hierarchy roots, rejecting unknown parents and cycles.
        let mut roots = HashMap::new();
        for name in entities.keys() {
            let mut current = name.clone();
            let mut depth = 0;
            while let Some(parent) = entities[&current].super_entity() {
                if !entities.contains_key(parent) {
                    return Err(Error::mapping(
                        Some(current.as_str()),
                        format!("unknown super entity '{parent}'"),
                    ));
                }
                depth += 1;
                if depth > entities.len() {
                    return Err(Error::mapping(Some(name.as_str()), "cyclic entity hierarchy"));
                }
                current = parent.to_string();
            }
            roots.insert(name.clone(), current);
        }

        for descriptor in entities.values() {
            for attr in descriptor.attributes() {
                if let Some(target) = attr.target() {
                    if !entities.contains_key(target) {
                        return Err(Error::mapping(
                            Some(descriptor.name()),
                            format!("association '{}' targets unknown entity '{target}'", attr.name),
                        ));
                    }
                }
            }
        }

        let mut database = DatabaseModel::new();
        for sequence in self.sequences {
            database.add_sequence(sequence)?;
        }
        for descriptor in entities.values() {
            register_tables(&mut database, descriptor)?;
        }

        let entities = entities
            .into_iter()
            .map(|(name, mut descriptor)| {
                if let Some(root) = roots.remove(&name) {
                    descriptor.set_root_name(root);
                }
                tracing::debug!(
                    entity = %name,
                    root = %descriptor.root_name(),
                    attributes = descriptor.attributes().len(),
                    versioned = descriptor.is_versioned(),
                    "Completed initialization of entity descriptor"
                );
                (name, Arc::new(descriptor))
            })
            .collect();

        Ok(Metamodel { entities, database })
    }
}

fn register_tables(database: &mut DatabaseModel, descriptor: &EntityDescriptor) -> Result<()> {
    let entity = Some(descriptor.name());
    let ident = |name: &str| {
        Identifier::to_identifier(name)
            .ok_or_else(|| Error::mapping(entity, format!("invalid column name '{name}'")))
    };

    let id = descriptor.identifier();
    let id_column = ident(&id.column)?;
    let primary = database.table_mut(&descriptor.table().name);
    primary.set_primary_key(vec![id_column.clone()]);
    primary.add_column(Column::new(id_column, id.id_type.name()).not_null());

    for attr in descriptor.attributes() {
        let Some(column) = &attr.column else { continue };
        let sql_type = attr.attribute_type().map_or("fk", |ty| ty.name());
        let mut col = Column::new(ident(column)?, sql_type);
        col.nullable = attr.nullable;
        let table = match &attr.table {
            Some(t) => database.table_mut(&QualifiedName::parse(t)?),
            None => database.table_mut(&descriptor.table().name),
        };
        table.add_column(col);
    }

    for join in descriptor.secondary_tables() {
        let key = ident(&join.key_column)?;
        let table = database.table_mut(&join.table);
        table.set_primary_key(vec![key.clone()]);
        table.add_column(Column::new(key, id.id_type.name()).not_null());
    }

    if let IdGeneration::Sequence(name) = &id.generation {
        let name = QualifiedName::parse(name)?;
        if database.sequence(&name).is_none() {
            database.add_sequence(Sequence::new(name))?;
        }
    }
    Ok(())
}

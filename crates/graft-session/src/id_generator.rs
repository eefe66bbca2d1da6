//! Identifier generation for transient entities.

use graft_core::{
    DatabaseModel, EntityDescriptor, Error, IdGeneration, IdentifierGenerationError,
    QualifiedName, Result, Value,
};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Produces identifiers for new instances saved without one.
pub trait IdentifierGenerator: Send + Sync {
    fn next_id(&self, descriptor: &EntityDescriptor) -> Result<Value>;
}

/// Hands out values from the sequences registered in a [`DatabaseModel`].
///
/// Each sequence starts at its initial value and advances by its increment
/// size. Values are converted to the identifier's attribute type.
#[derive(Debug, Default)]
pub struct SequenceIdentifierGenerator {
    next: Mutex<HashMap<String, i64>>,
    increments: HashMap<String, i64>,
}

impl SequenceIdentifierGenerator {
    pub fn new(database: &DatabaseModel) -> Self {
        let mut next = HashMap::new();
        let mut increments = HashMap::new();
        for sequence in database.sequences() {
            let key = sequence.name.render().to_ascii_lowercase();
            next.insert(key.clone(), sequence.initial_value());
            increments.insert(key, sequence.increment_size().max(1));
        }
        Self {
            next: Mutex::new(next),
            increments,
        }
    }
}

fn generation_error(descriptor: &EntityDescriptor, message: impl Into<String>) -> Error {
    Error::IdentifierGeneration(IdentifierGenerationError {
        entity: descriptor.name().to_string(),
        message: message.into(),
    })
}

/// Convert a raw sequence value to the identifier's type.
fn typed_id(descriptor: &EntityDescriptor, raw: i64) -> Result<Value> {
    let id = descriptor.identifier();
    match id.id_type.name() {
        "long" => Ok(Value::BigInt(raw)),
        "integer" => i32::try_from(raw)
            .map(Value::Int)
            .map_err(|_| generation_error(descriptor, format!("sequence value {raw} overflows integer"))),
        "short" => i16::try_from(raw)
            .map(Value::SmallInt)
            .map_err(|_| generation_error(descriptor, format!("sequence value {raw} overflows short"))),
        "string" => Ok(Value::Text(raw.to_string())),
        other => Err(generation_error(
            descriptor,
            format!("cannot generate identifiers of type {other}"),
        )),
    }
}

impl IdentifierGenerator for SequenceIdentifierGenerator {
    fn next_id(&self, descriptor: &EntityDescriptor) -> Result<Value> {
        let IdGeneration::Sequence(name) = &descriptor.identifier().generation else {
            return Err(generation_error(
                descriptor,
                "identifier must be assigned before save",
            ));
        };
        let key = QualifiedName::parse(name)?.render().to_ascii_lowercase();
        let raw = {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = next.get_mut(&key).ok_or_else(|| {
                generation_error(descriptor, format!("unknown sequence '{name}'"))
            })?;
            let value = *slot;
            *slot = slot.saturating_add(self.increments.get(&key).copied().unwrap_or(1));
            value
        };
        tracing::trace!(entity = %descriptor.name(), sequence = %name, value = raw, "Generated identifier");
        typed_id(descriptor, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graft_core::Metamodel;
    use graft_core::Sequence;
    use graft_core::metamodel::{IntegerType, LongType, StringType};

    #[test]
    fn test_sequence_values_advance_by_increment() {
        let model = Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Ticket")
                    .id("id", LongType)
                    .sequence_generated("ticket_seq")
                    .build()
                    .unwrap(),
            )
            .sequence(Sequence::with_values(
                QualifiedName::parse("ticket_seq").unwrap(),
                50,
                5,
            ))
            .build()
            .unwrap();
        let generator = SequenceIdentifierGenerator::new(model.database());
        let ticket = model.entity("Ticket").unwrap();
        assert_eq!(generator.next_id(ticket).unwrap(), Value::BigInt(50));
        assert_eq!(generator.next_id(ticket).unwrap(), Value::BigInt(55));
    }

    #[test]
    fn test_integer_ids_and_assigned_failure() {
        let model = Metamodel::builder()
            .entity(
                EntityDescriptor::builder("Tag")
                    .id("id", IntegerType)
                    .sequence_generated("tag_seq")
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityDescriptor::builder("Code")
                    .id("code", StringType)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let generator = SequenceIdentifierGenerator::new(model.database());
        assert_eq!(
            generator.next_id(model.entity("Tag").unwrap()).unwrap(),
            Value::Int(1)
        );
        let err = generator.next_id(model.entity("Code").unwrap()).unwrap_err();
        assert!(matches!(err, Error::IdentifierGeneration(_)));
    }
}

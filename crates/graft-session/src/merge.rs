//! Merge bookkeeping and value copying.
//!
//! # Overview
//!
//! A merge walks a graph of source instances and maps each one onto a
//! managed target. [`MergeContext`] records that mapping for the duration of
//! one top-level merge so that cycles and shared references resolve to the
//! same target, and so that every source is operated on at most once.
//!
//! Copying state from a source to its target goes through
//! [`replace_reference`]: references already in the context resolve to their
//! target, identified references resolve to a session reference, and
//! unsaved references that are not cascaded get a fresh placeholder copy.

use crate::config::EntityCopyPolicy;
use crate::session::Session;
use graft_core::{
    AttributeDescriptor, EntityInstance, EntityRef, EntityReference, Error,
    ForeignKeyDirection, IllegalStateKind, Indirection, InstanceHandle, PropertyValue, Result,
    Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Entity copy observers
// ============================================================================

/// Notified when two source instances map to one managed target.
pub trait EntityCopyObserver {
    fn entity_copy_detected(
        &mut self,
        managed: &EntityRef,
        merge: &EntityRef,
        existing_merge: &EntityRef,
    ) -> Result<()>;

    /// Called once the top-level merge finished successfully.
    fn top_level_merge_complete(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear(&mut self) {}
}

fn describe(entity: &EntityInstance) -> String {
    format!(
        "[{}#{}]",
        entity.entity_name(),
        entity
            .id()
            .map_or_else(|| "<null>".to_string(), |id| id.to_string())
    )
}

/// Rejects multiple representations of one entity.
#[derive(Debug, Default)]
pub struct EntityCopyNotAllowedObserver;

impl EntityCopyObserver for EntityCopyNotAllowedObserver {
    fn entity_copy_detected(
        &mut self,
        managed: &EntityRef,
        merge: &EntityRef,
        existing_merge: &EntityRef,
    ) -> Result<()> {
        Err(Error::illegal_state(
            IllegalStateKind::MultipleRepresentations,
            Some(managed.entity_name()),
            format!(
                "multiple representations of the same entity {} are being merged: {} and {}",
                describe(managed),
                merge.handle(),
                existing_merge.handle()
            ),
        ))
    }
}

#[derive(Debug, Default)]
pub struct EntityCopyAllowedObserver;

impl EntityCopyObserver for EntityCopyAllowedObserver {
    fn entity_copy_detected(
        &mut self,
        _managed: &EntityRef,
        _merge: &EntityRef,
        _existing_merge: &EntityRef,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct Representations {
    entity_name: String,
    description: String,
    sources: BTreeSet<InstanceHandle>,
}

/// Accepts copies and logs a summary when the merge completes.
#[derive(Debug, Default)]
pub struct EntityCopyAllowedLoggedObserver {
    copies: BTreeMap<InstanceHandle, Representations>,
}

impl EntityCopyAllowedLoggedObserver {
    /// Number of managed instances that had more than one representation.
    pub fn managed_with_copies(&self) -> usize {
        self.copies.len()
    }
}

impl EntityCopyObserver for EntityCopyAllowedLoggedObserver {
    fn entity_copy_detected(
        &mut self,
        managed: &EntityRef,
        merge: &EntityRef,
        existing_merge: &EntityRef,
    ) -> Result<()> {
        tracing::debug!(
            entity = %describe(managed),
            merge = %merge.handle(),
            existing = %existing_merge.handle(),
            "Found additional representation of managed entity"
        );
        let representations = self
            .copies
            .entry(managed.handle())
            .or_insert_with(|| Representations {
                entity_name: managed.entity_name().to_string(),
                description: describe(managed),
                sources: BTreeSet::new(),
            });
        representations.sources.insert(merge.handle());
        representations.sources.insert(existing_merge.handle());
        Ok(())
    }

    fn top_level_merge_complete(&mut self) -> Result<()> {
        let mut per_entity: BTreeMap<&str, usize> = BTreeMap::new();
        for copies in self.copies.values() {
            *per_entity.entry(&copies.entity_name).or_insert(0) += 1;
            tracing::info!(
                entity = %copies.description,
                representations = copies.sources.len(),
                "Merged multiple representations of the same entity"
            );
        }
        for (name, count) in per_entity {
            tracing::info!(entity = name, count, "Entities with multiple merged representations");
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.copies.clear();
    }
}

// ============================================================================
// MergeContext
// ============================================================================

#[derive(Debug)]
struct MergeEntry {
    source: EntityRef,
    target: EntityRef,
    operated_on: bool,
}

/// Source-to-target mapping of one top-level merge.
pub struct MergeContext {
    entries: HashMap<InstanceHandle, MergeEntry>,
    /// Target handle to source handle.
    by_target: HashMap<InstanceHandle, InstanceHandle>,
    observer: Box<dyn EntityCopyObserver>,
}

impl MergeContext {
    pub fn new(observer: Box<dyn EntityCopyObserver>) -> Self {
        Self {
            entries: HashMap::new(),
            by_target: HashMap::new(),
            observer,
        }
    }

    pub fn for_policy(policy: EntityCopyPolicy) -> Self {
        let observer: Box<dyn EntityCopyObserver> = match policy {
            EntityCopyPolicy::Disallow => Box::new(EntityCopyNotAllowedObserver),
            EntityCopyPolicy::Allow => Box::new(EntityCopyAllowedObserver),
            EntityCopyPolicy::Log => Box::new(EntityCopyAllowedLoggedObserver::default()),
        };
        Self::new(observer)
    }

    /// Target recorded for `source`.
    pub fn get(&self, source: InstanceHandle) -> Option<&EntityRef> {
        self.entries.get(&source).map(|e| &e.target)
    }

    pub fn contains(&self, source: InstanceHandle) -> bool {
        self.entries.contains_key(&source)
    }

    /// Is `target` the target of some source?
    pub fn contains_target(&self, target: InstanceHandle) -> bool {
        self.by_target.contains_key(&target)
    }

    pub fn source_for(&self, target: InstanceHandle) -> Option<&EntityRef> {
        self.by_target
            .get(&target)
            .and_then(|s| self.entries.get(s))
            .map(|e| &e.source)
    }

    pub fn is_operated_on(&self, source: InstanceHandle) -> bool {
        self.entries.get(&source).is_some_and(|e| e.operated_on)
    }

    pub fn set_operated_on(&mut self, source: InstanceHandle, operated_on: bool) -> Result<()> {
        let entry = self.entries.get_mut(&source).ok_or_else(|| {
            conflict(format!("source {source} is not registered in the merge context"))
        })?;
        entry.operated_on = operated_on;
        Ok(())
    }

    /// Record that `source` merges into `target`.
    ///
    /// A source may be re-recorded only with the same target. A different
    /// source mapping to an already recorded target is an entity copy and is
    /// reported to the observer.
    pub fn put(&mut self, source: &EntityRef, target: &EntityRef, operated_on: bool) -> Result<()> {
        let (source_handle, target_handle) = (source.handle(), target.handle());
        if let Some(existing) = self.entries.get_mut(&source_handle) {
            if existing.target.handle() != target_handle {
                return Err(conflict(format!(
                    "source {} is already mapped to {}, cannot map it to {}",
                    source_handle,
                    existing.target.handle(),
                    target_handle
                )));
            }
            if self.by_target.get(&target_handle) != Some(&source_handle) {
                return Err(conflict(format!(
                    "inconsistent source recorded for target {target_handle}"
                )));
            }
            existing.operated_on = operated_on;
            return Ok(());
        }

        let previous_source = self
            .by_target
            .get(&target_handle)
            .and_then(|s| self.entries.get(s))
            .map(|e| Arc::clone(&e.source));
        if let Some(previous) = previous_source {
            self.observer
                .entity_copy_detected(target, source, &previous)?;
        }
        tracing::trace!(
            source = %source_handle,
            target = %target_handle,
            operated_on,
            "Recording merge mapping"
        );
        self.by_target.insert(target_handle, source_handle);
        self.entries.insert(
            source_handle,
            MergeEntry {
                source: Arc::clone(source),
                target: Arc::clone(target),
                operated_on,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn top_level_merge_complete(&mut self) -> Result<()> {
        self.observer.top_level_merge_complete()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_target.clear();
        self.observer.clear();
    }
}

impl fmt::Debug for MergeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeContext")
            .field("entries", &self.entries.len())
            .field(
                "operated_on",
                &self.entries.values().filter(|e| e.operated_on).count(),
            )
            .finish_non_exhaustive()
    }
}

fn conflict(message: String) -> Error {
    Error::illegal_state(IllegalStateKind::MergeContextConflict, None, message)
}

// ============================================================================
// Replacement
// ============================================================================

/// Resolve one association value of a source onto the target side.
///
/// `current` is the target's present value for the same slot, if any.
pub fn replace_reference(
    session: &mut Session,
    original: &EntityReference,
    current: Option<&EntityReference>,
    ctx: &mut MergeContext,
) -> Result<EntityReference> {
    let Some(entity) = original.implementation() else {
        if current.is_some_and(|c| c.same_as(original)) {
            return Ok(original.clone());
        }
        let id = original.identity().unwrap_or(Value::Null);
        return session.reference(original.entity_name(), id);
    };

    if let Some(target) = ctx.get(entity.handle()) {
        return Ok(EntityReference::Direct(Arc::clone(target)));
    }
    if current.is_some_and(|c| c.is_direct_to(&entity) || c.same_as(original)) {
        return Ok(original.clone());
    }

    let managed_id = session
        .persistence_context()
        .entry(entity.handle())
        .map(|e| e.id.clone());
    let unsaved = managed_id.is_none()
        && entity
            .descriptor()
            .is_transient(entity.id().as_ref(), entity.version().as_ref())
            .unwrap_or(false);
    if unsaved {
        if ctx.contains_target(entity.handle()) {
            return Ok(EntityReference::Direct(entity));
        }
        let copy = EntityInstance::new(entity.descriptor());
        tracing::trace!(
            entity = %entity.entity_name(),
            source = %entity.handle(),
            copy = %copy.handle(),
            "Registering copy of unsaved reference"
        );
        ctx.put(&entity, &copy, false)?;
        return Ok(EntityReference::Direct(copy));
    }

    let id = managed_id.or_else(|| entity.id()).ok_or_else(|| {
        Error::mapping(
            Some(entity.entity_name()),
            "non-transient entity has a null identifier",
        )
    })?;
    session.reference(entity.entity_name(), id)
}

fn replace_value(
    session: &mut Session,
    attr: &AttributeDescriptor,
    original: PropertyValue,
    current: &PropertyValue,
    ctx: &mut MergeContext,
) -> Result<PropertyValue> {
    Ok(match original {
        PropertyValue::Basic(value) => PropertyValue::Basic(attr.deep_copy(&value)),
        PropertyValue::ToOne(None) => PropertyValue::ToOne(None),
        PropertyValue::ToOne(Some(reference)) => {
            let current = match current {
                PropertyValue::ToOne(Some(c)) => Some(c),
                _ => None,
            };
            PropertyValue::ToOne(Some(replace_reference(session, &reference, current, ctx)?))
        }
        PropertyValue::ToMany(references) => PropertyValue::ToMany(
            references
                .iter()
                .map(|r| replace_reference(session, r, None, ctx))
                .collect::<Result<_>>()?,
        ),
    })
}

fn copy_selected(
    session: &mut Session,
    source: &EntityInstance,
    target: &EntityInstance,
    ctx: &mut MergeContext,
    select: impl Fn(&AttributeDescriptor) -> bool,
) -> Result<()> {
    let descriptor = Arc::clone(target.descriptor());
    let originals = source.properties();
    let currents = target.properties();
    let mut copied = Vec::with_capacity(currents.len());
    for ((attr, original), current) in descriptor.attributes().iter().zip(originals).zip(currents) {
        if select(attr) {
            copied.push(replace_value(session, attr, original, &current, ctx)?);
        } else {
            copied.push(current);
        }
    }
    target.replace_properties(copied);
    Ok(())
}

/// Copy every attribute of `source` onto `target`.
pub fn copy_values(
    session: &mut Session,
    source: &EntityInstance,
    target: &EntityInstance,
    ctx: &mut MergeContext,
) -> Result<()> {
    copy_selected(session, source, target, ctx, |_| true)
}

/// First pass for a new target: basic attributes and `FromParent` associations.
pub fn copy_values_from_parent(
    session: &mut Session,
    source: &EntityInstance,
    target: &EntityInstance,
    ctx: &mut MergeContext,
) -> Result<()> {
    copy_selected(session, source, target, ctx, |attr| {
        attr.foreign_key_direction()
            .is_none_or(|d| d == ForeignKeyDirection::FromParent)
    })
}

/// Second pass for a new target, after it was saved: `ToParent` associations.
pub fn copy_values_to_parent(
    session: &mut Session,
    source: &EntityInstance,
    target: &EntityInstance,
    ctx: &mut MergeContext,
) -> Result<()> {
    copy_selected(session, source, target, ctx, |attr| {
        attr.foreign_key_direction() == Some(ForeignKeyDirection::ToParent)
    })
}

/// Carry the source's tracked dirty attributes over to the target.
pub fn mark_interceptor_dirty(source: &EntityInstance, target: &EntityInstance) {
    let (Some(source), Some(target)) = (source.dirtiness(), target.dirtiness()) else {
        return;
    };
    target.clear_dirty();
    for field in source.tracked_dirty_fields() {
        target.track_change(&field);
    }
}

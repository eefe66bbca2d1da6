//! In-memory entity instances, lazy proxies and their capabilities.
//!
//! Instances are shared (`Arc`) between the application and sessions and
//! carry a process-unique [`InstanceHandle`] used wherever identity matters.
//! Property access goes through an internal lock so instances can be
//! mutated through shared references.

use crate::error::{Error, Result};
use crate::metamodel::{AttributeDescriptor, AttributeKind, EntityDescriptor};
use crate::value::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

// ============================================================================
// Handles
// ============================================================================

/// Stable per-instance surrogate identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(u64);

impl InstanceHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        InstanceHandle(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Uniform view over direct references and lazy proxies.
pub trait Indirection {
    /// A proxy whose target has never been loaded.
    fn is_uninitialized(&self) -> bool;

    /// Identifier of the referenced entity, if it has one.
    fn identity(&self) -> Option<Value>;

    /// The concrete instance, when available without a load.
    fn implementation(&self) -> Option<EntityRef>;
}

/// Self-dirtiness tracking, present only on opted-in instances.
pub trait DirtinessTracking {
    fn clear_dirty(&self);
    fn tracked_dirty_fields(&self) -> BTreeSet<String>;
    fn track_change(&self, field: &str);

    fn has_dirty_fields(&self) -> bool {
        !self.tracked_dirty_fields().is_empty()
    }
}

#[derive(Debug, Default)]
struct DirtyTracker {
    fields: Mutex<BTreeSet<String>>,
}

impl DirtinessTracking for DirtyTracker {
    fn clear_dirty(&self) {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn tracked_dirty_fields(&self) -> BTreeSet<String> {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track_change(&self, field: &str) {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.to_string());
    }
}

// ============================================================================
// Property values and references
// ============================================================================

/// Current in-memory value of one attribute.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    Basic(Value),
    ToOne(Option<EntityReference>),
    ToMany(Vec<EntityReference>),
}

impl PropertyValue {
    fn empty_for(attr: &AttributeDescriptor) -> Self {
        match attr.kind {
            AttributeKind::Basic(_) => PropertyValue::Basic(Value::Null),
            AttributeKind::ToOne { .. } => PropertyValue::ToOne(None),
            AttributeKind::ToMany { .. } => PropertyValue::ToMany(Vec::new()),
        }
    }

    fn matches(&self, attr: &AttributeDescriptor) -> bool {
        matches!(
            (self, &attr.kind),
            (PropertyValue::Basic(_), AttributeKind::Basic(_))
                | (PropertyValue::ToOne(_), AttributeKind::ToOne { .. })
                | (PropertyValue::ToMany(_), AttributeKind::ToMany { .. })
        )
    }

    /// References held by this value.
    pub fn references(&self) -> Vec<&EntityReference> {
        match self {
            PropertyValue::Basic(_) | PropertyValue::ToOne(None) => Vec::new(),
            PropertyValue::ToOne(Some(r)) => vec![r],
            PropertyValue::ToMany(rs) => rs.iter().collect(),
        }
    }
}

/// An association target: either the instance itself or a lazy proxy.
#[derive(Clone)]
pub enum EntityReference {
    Direct(EntityRef),
    Proxy(ProxyRef),
}

impl EntityReference {
    pub fn entity_name(&self) -> &str {
        match self {
            EntityReference::Direct(e) => e.entity_name(),
            EntityReference::Proxy(p) => p.entity_name(),
        }
    }

    /// Pointer identity.
    pub fn same_as(&self, other: &EntityReference) -> bool {
        match (self, other) {
            (EntityReference::Direct(a), EntityReference::Direct(b)) => Arc::ptr_eq(a, b),
            (EntityReference::Proxy(a), EntityReference::Proxy(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Does this reference point directly at `entity`?
    pub fn is_direct_to(&self, entity: &EntityInstance) -> bool {
        matches!(self, EntityReference::Direct(e) if e.handle() == entity.handle())
    }
}

impl Indirection for EntityReference {
    fn is_uninitialized(&self) -> bool {
        matches!(self, EntityReference::Proxy(p) if !p.is_initialized())
    }

    fn identity(&self) -> Option<Value> {
        match self {
            EntityReference::Direct(e) => e.id(),
            EntityReference::Proxy(p) => Some(p.id().clone()),
        }
    }

    fn implementation(&self) -> Option<EntityRef> {
        match self {
            EntityReference::Direct(e) => Some(Arc::clone(e)),
            EntityReference::Proxy(p) => p.implementation(),
        }
    }
}

impl fmt::Debug for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityReference::Direct(e) => write!(
                f,
                "Direct({}{}#{})",
                e.entity_name(),
                e.handle(),
                e.id().unwrap_or(Value::Null)
            ),
            EntityReference::Proxy(p) => write!(
                f,
                "Proxy({}#{}{})",
                p.entity_name(),
                p.id(),
                if p.is_initialized() { "" } else { ", uninitialized" }
            ),
        }
    }
}

impl From<EntityRef> for EntityReference {
    fn from(entity: EntityRef) -> Self {
        EntityReference::Direct(entity)
    }
}

impl From<&EntityRef> for EntityReference {
    fn from(entity: &EntityRef) -> Self {
        EntityReference::Direct(Arc::clone(entity))
    }
}

impl From<ProxyRef> for EntityReference {
    fn from(proxy: ProxyRef) -> Self {
        EntityReference::Proxy(proxy)
    }
}

// ============================================================================
// Lazy proxies
// ============================================================================

/// Placeholder for an entity known only by identity.
///
/// The target is set at most once when the proxy is initialized.
pub struct LazyProxy {
    entity_name: String,
    id: Value,
    target: OnceLock<EntityRef>,
}

pub type ProxyRef = Arc<LazyProxy>;

impl LazyProxy {
    pub fn new(entity_name: impl Into<String>, id: Value) -> ProxyRef {
        Arc::new(Self {
            entity_name: entity_name.into(),
            id,
            target: OnceLock::new(),
        })
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.target.get().is_some()
    }

    pub fn implementation(&self) -> Option<EntityRef> {
        self.target.get().cloned()
    }

    /// Initialize the proxy. Fails (returning the argument) if already set.
    pub fn set_implementation(&self, entity: EntityRef) -> std::result::Result<(), EntityRef> {
        self.target.set(entity)
    }
}

impl fmt::Debug for LazyProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyProxy")
            .field("entity_name", &self.entity_name)
            .field("id", &self.id)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

// ============================================================================
// EntityInstance
// ============================================================================

struct InstanceState {
    id: Option<Value>,
    properties: Vec<PropertyValue>,
}

/// One in-memory entity.
pub struct EntityInstance {
    handle: InstanceHandle,
    descriptor: Arc<EntityDescriptor>,
    state: RwLock<InstanceState>,
    tracker: Option<DirtyTracker>,
}

pub type EntityRef = Arc<EntityInstance>;

impl EntityInstance {
    /// A fresh instance with null/empty attributes and no identifier.
    pub fn new(descriptor: &Arc<EntityDescriptor>) -> EntityRef {
        let properties = descriptor
            .attributes()
            .iter()
            .map(PropertyValue::empty_for)
            .collect();
        Arc::new(Self {
            handle: InstanceHandle::next(),
            descriptor: Arc::clone(descriptor),
            state: RwLock::new(InstanceState {
                id: None,
                properties,
            }),
            tracker: descriptor.is_dirty_tracking().then(DirtyTracker::default),
        })
    }

    pub fn with_id(descriptor: &Arc<EntityDescriptor>, id: impl Into<Value>) -> EntityRef {
        let instance = Self::new(descriptor);
        instance.set_id(Some(id.into()));
        instance
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn entity_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id.clone().filter(|v| !v.is_null())
    }

    pub fn set_id(&self, id: Option<Value>) {
        self.write().id = id;
    }

    pub fn property(&self, index: usize) -> Option<PropertyValue> {
        self.read().properties.get(index).cloned()
    }

    pub fn properties(&self) -> Vec<PropertyValue> {
        self.read().properties.clone()
    }

    /// Set one attribute by index, recording the change on tracking instances.
    pub fn set_property(&self, index: usize, value: PropertyValue) -> Result<()> {
        let attr = self.descriptor.attribute(index).ok_or_else(|| {
            Error::mapping(
                Some(self.entity_name()),
                format!("no attribute at index {index}"),
            )
        })?;
        if !value.matches(attr) {
            return Err(Error::mapping(
                Some(self.entity_name()),
                format!("value does not match the kind of attribute '{}'", attr.name),
            ));
        }
        let value = match value {
            PropertyValue::Basic(v) => PropertyValue::Basic(attr.conform(v)?),
            other => other,
        };
        self.write().properties[index] = value;
        if let Some(tracker) = &self.tracker {
            tracker.track_change(&attr.name);
        }
        Ok(())
    }

    /// Replace every attribute at once without recording dirtiness.
    pub fn replace_properties(&self, properties: Vec<PropertyValue>) {
        debug_assert_eq!(properties.len(), self.descriptor.attributes().len());
        self.write().properties = properties;
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.descriptor.index_of(name).ok_or_else(|| {
            Error::mapping(Some(self.entity_name()), format!("unknown attribute '{name}'"))
        })
    }

    pub fn basic(&self, name: &str) -> Result<Value> {
        match self.property(self.index(name)?) {
            Some(PropertyValue::Basic(v)) => Ok(v),
            _ => Err(Error::mapping(
                Some(self.entity_name()),
                format!("'{name}' is not a basic attribute"),
            )),
        }
    }

    pub fn set_basic(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_property(self.index(name)?, PropertyValue::Basic(value.into()))
    }

    pub fn to_one(&self, name: &str) -> Result<Option<EntityReference>> {
        match self.property(self.index(name)?) {
            Some(PropertyValue::ToOne(r)) => Ok(r),
            _ => Err(Error::mapping(
                Some(self.entity_name()),
                format!("'{name}' is not a to-one association"),
            )),
        }
    }

    pub fn set_to_one(&self, name: &str, target: Option<EntityReference>) -> Result<()> {
        self.set_property(self.index(name)?, PropertyValue::ToOne(target))
    }

    pub fn to_many(&self, name: &str) -> Result<Vec<EntityReference>> {
        match self.property(self.index(name)?) {
            Some(PropertyValue::ToMany(rs)) => Ok(rs),
            _ => Err(Error::mapping(
                Some(self.entity_name()),
                format!("'{name}' is not a to-many association"),
            )),
        }
    }

    pub fn set_to_many(&self, name: &str, targets: Vec<EntityReference>) -> Result<()> {
        self.set_property(self.index(name)?, PropertyValue::ToMany(targets))
    }

    /// Append one element to a to-many association.
    pub fn add_to_many(&self, name: &str, target: EntityReference) -> Result<()> {
        let mut targets = self.to_many(name)?;
        targets.push(target);
        self.set_to_many(name, targets)
    }

    /// Current value of the version attribute.
    pub fn version(&self) -> Option<Value> {
        let index = self.descriptor.version_index()?;
        match self.property(index) {
            Some(PropertyValue::Basic(v)) if !v.is_null() => Some(v),
            _ => None,
        }
    }

    /// Flatten current state: basic values are deep-copied, associations
    /// become target identifiers (arrays of them for collections).
    pub fn disassemble(&self) -> Vec<Value> {
        let properties = self.properties();
        self.descriptor
            .attributes()
            .iter()
            .zip(properties)
            .map(|(attr, value)| match value {
                PropertyValue::Basic(v) => attr.deep_copy(&v),
                PropertyValue::ToOne(r) => r.and_then(|r| r.identity()).unwrap_or(Value::Null),
                PropertyValue::ToMany(rs) => Value::Array(
                    rs.iter()
                        .map(|r| r.identity().unwrap_or(Value::Null))
                        .collect(),
                ),
            })
            .collect()
    }

    /// The dirtiness-tracking capability, if the descriptor enables it.
    pub fn dirtiness(&self) -> Option<&dyn DirtinessTracking> {
        self.tracker.as_ref().map(|t| t as &dyn DirtinessTracking)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InstanceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InstanceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EntityInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("EntityInstance")
            .field("entity", &self.entity_name())
            .field("handle", &self.handle)
            .field("id", &state.id)
            .field("properties", &state.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::{AttributeDescriptor, IntegerType, LongType, StringType};

    fn order_descriptor(tracking: bool) -> Arc<EntityDescriptor> {
        let mut builder = EntityDescriptor::builder("Order")
            .id("id", LongType)
            .version("version", IntegerType)
            .basic("status", StringType)
            .attribute(AttributeDescriptor::to_one("customer", "Customer"))
            .attribute(AttributeDescriptor::to_many("lines", "Line"));
        if tracking {
            builder = builder.dirty_tracking();
        }
        Arc::new(builder.build().unwrap())
    }

    fn customer_descriptor() -> Arc<EntityDescriptor> {
        Arc::new(
            EntityDescriptor::builder("Customer")
                .id("id", LongType)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_handles_are_unique() {
        let desc = order_descriptor(false);
        let a = EntityInstance::new(&desc);
        let b = EntityInstance::new(&desc);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn test_disassemble_flattens_associations() {
        let desc = order_descriptor(false);
        let cust = EntityInstance::with_id(&customer_descriptor(), 9_i64);
        let order = EntityInstance::with_id(&desc, 1_i64);
        order.set_basic("status", "open").unwrap();
        order.set_to_one("customer", Some(cust.into())).unwrap();
        order
            .add_to_many("lines", LazyProxy::new("Line", Value::BigInt(3)).into())
            .unwrap();

        assert_eq!(
            order.disassemble(),
            vec![
                Value::Null,
                Value::Text("open".into()),
                Value::BigInt(9),
                Value::Array(vec![Value::BigInt(3)]),
            ]
        );
        assert_eq!(order.version(), None);
    }

    #[test]
    fn test_set_property_rejects_wrong_kind() {
        let desc = order_descriptor(false);
        let order = EntityInstance::new(&desc);
        assert!(order.set_property(2, PropertyValue::Basic(Value::Int(1))).is_err());
        assert!(order.set_basic("missing", 1).is_err());
        assert!(order.to_many("status").is_err());
    }

    #[test]
    fn test_set_basic_conforms_to_the_attribute_type() {
        let order = EntityInstance::new(&order_descriptor(false));
        order.set_basic("version", 5_i64).unwrap();
        assert_eq!(order.version(), Some(Value::Int(5)));

        let err = order.set_basic("status", 7).unwrap_err();
        assert!(matches!(
            err,
            Error::Type(ref e) if e.expected == "string" && e.attribute.as_deref() == Some("status")
        ));
        assert!(order.set_basic("version", "five").is_err());
        assert!(order.set_basic("status", Value::Null).is_ok());
    }

    #[test]
    fn test_dirtiness_tracking_only_when_enabled() {
        let plain = EntityInstance::new(&order_descriptor(false));
        assert!(plain.dirtiness().is_none());

        let tracked = EntityInstance::new(&order_descriptor(true));
        tracked.set_basic("status", "x").unwrap();
        let tracker = tracked.dirtiness().unwrap();
        assert!(tracker.tracked_dirty_fields().contains("status"));
        tracker.clear_dirty();
        assert!(!tracker.has_dirty_fields());

        tracked.replace_properties(tracked.properties());
        assert!(!tracker.has_dirty_fields());
    }

    #[test]
    fn test_proxy_indirection() {
        let cust = EntityInstance::with_id(&customer_descriptor(), 4_i64);
        let proxy = LazyProxy::new("Customer", Value::BigInt(4));
        let reference = EntityReference::Proxy(Arc::clone(&proxy));
        assert!(reference.is_uninitialized());
        assert_eq!(reference.identity(), Some(Value::BigInt(4)));
        assert!(reference.implementation().is_none());

        proxy.set_implementation(Arc::clone(&cust)).unwrap();
        assert!(!reference.is_uninitialized());
        assert!(Arc::ptr_eq(&reference.implementation().unwrap(), &cust));
        assert!(proxy.set_implementation(cust).is_err());
    }
}

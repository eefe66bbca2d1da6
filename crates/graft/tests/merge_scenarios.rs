use graft::event::{LOAD, Listener, LoadEvent, LoadEventListener};
use graft::metamodel::{IntegerType, LongType, StringType};
use graft::prelude::*;
use graft::{
    CascadeAction, EntityCopyPolicy, IdentityMismatchKind, IllegalStateKind, MemoryStorage,
    Statistics, StatisticsSink, Storage,
};
use std::sync::{Arc, OnceLock};

struct Fixture {
    factory: Arc<SessionFactory>,
    storage: Arc<MemoryStorage>,
    statistics: Arc<Statistics>,
}

fn metamodel() -> Metamodel {
    let merge_only = CascadeStyle::of(&[CascadeAction::Merge]);
    Metamodel::builder()
        .entity(
            EntityDescriptor::builder("Customer")
                .id("id", LongType)
                .sequence_generated("customer_seq")
                .version("version", IntegerType)
                .basic("name", StringType)
                .build()
                .expect("customer descriptor"),
        )
        .entity(
            EntityDescriptor::builder("Order")
                .table("orders")
                .id("id", LongType)
                .sequence_generated("order_seq")
                .version("version", IntegerType)
                .basic("status", StringType)
                .attribute(AttributeDescriptor::to_one("customer", "Customer").cascade(merge_only))
                .attribute(AttributeDescriptor::to_one("billed_to", "Customer").cascade(merge_only))
                .attribute(AttributeDescriptor::to_many("lines", "Line").cascade(CascadeStyle::ALL))
                .build()
                .expect("order descriptor"),
        )
        .entity(
            EntityDescriptor::builder("VipCustomer")
                .extends("Customer")
                .table("Customer")
                .id("id", LongType)
                .version("version", IntegerType)
                .basic("name", StringType)
                .basic("tier", StringType)
                .build()
                .expect("vip descriptor"),
        )
        .entity(
            EntityDescriptor::builder("Person")
                .id("id", LongType)
                .sequence_generated("person_seq")
                .version("version", IntegerType)
                .basic("name", StringType)
                .attribute(AttributeDescriptor::to_one("partner", "Person").cascade(merge_only))
                .build()
                .expect("person descriptor"),
        )
        .entity(
            EntityDescriptor::builder("Line")
                .id("id", LongType)
                .sequence_generated("line_seq")
                .version("version", IntegerType)
                .basic("product", StringType)
                .attribute(AttributeDescriptor::to_one("order", "Order"))
                .build()
                .expect("line descriptor"),
        )
        .build()
        .expect("metamodel")
}

fn fixture(policy: EntityCopyPolicy) -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let statistics = Arc::new(Statistics::new(true));
    let settings = Settings {
        entity_copy_observer: policy,
        generate_statistics: true,
        ..Settings::default()
    };
    let factory = SessionFactory::builder(metamodel())
        .storage(Arc::clone(&storage) as Arc<dyn Storage>)
        .statistics(Arc::clone(&statistics) as Arc<dyn StatisticsSink>)
        .settings(settings)
        .build()
        .expect("factory");
    Fixture {
        factory,
        storage,
        statistics,
    }
}

impl Fixture {
    fn descriptor(&self, name: &str) -> Arc<EntityDescriptor> {
        Arc::clone(self.factory.metamodel().entity(name).expect("known entity"))
    }

    fn seed_customer(&self, id: i64, version: i32, name: &str) {
        self.storage.put_row(
            &self.descriptor("Customer"),
            id,
            vec![Value::Int(version), Value::Text(name.to_string())],
        );
    }

    fn seed_person(&self, id: i64, name: &str, partner: i64) {
        self.storage.put_row(
            &self.descriptor("Person"),
            id,
            vec![
                Value::Int(1),
                Value::Text(name.to_string()),
                Value::BigInt(partner),
            ],
        );
    }

    fn detached_person(&self, id: i64, name: &str) -> EntityRef {
        let person = EntityInstance::with_id(&self.descriptor("Person"), id);
        person.set_basic("version", 1).expect("version");
        person.set_basic("name", name).expect("name");
        person
    }

    /// A detached copy of a stored customer, as a client would send it back.
    fn detached_customer(&self, id: i64, version: i32, name: &str) -> EntityRef {
        let customer = EntityInstance::with_id(&self.descriptor("Customer"), id);
        customer.set_basic("version", version).expect("version");
        customer.set_basic("name", name).expect("name");
        customer
    }
}

/// Answers every load with one pinned instance.
#[derive(Default)]
struct PinnedLoad(OnceLock<EntityRef>);

impl Listener for PinnedLoad {}

impl LoadEventListener for PinnedLoad {
    fn on_load(&self, _session: &mut Session, event: &mut LoadEvent) -> Result<()> {
        event.result = self.0.get().cloned();
        Ok(())
    }
}

fn target_of(entity: &EntityInstance, association: &str) -> EntityRef {
    entity
        .to_one(association)
        .expect("to-one attribute")
        .and_then(|r| r.implementation())
        .expect("resolved reference")
}

#[test]
fn merge_detached_copies_state_and_increments_version_at_commit() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(1, 1, "Ada");

    let mut session = fx.factory.open_session();
    let customer = session.get("Customer", 1_i64).unwrap().expect("customer row");
    session.commit().unwrap();
    assert!(!session.contains(&customer));

    customer.set_basic("name", "Grace").unwrap();
    let mut session = fx.factory.open_session();
    let managed = session.merge(&customer).unwrap();

    assert!(!Arc::ptr_eq(&managed, &customer));
    assert!(session.contains(&managed));
    assert!(!session.contains(&customer));
    assert_eq!(managed.basic("name").unwrap(), Value::Text("Grace".into()));

    session.commit().unwrap();
    let row = fx.storage.row("Customer", 1_i64).expect("stored row");
    assert_eq!(row.values, vec![Value::Int(2), Value::Text("Grace".into())]);
    assert_eq!(managed.version(), Some(Value::Int(2)));
    assert_eq!(customer.version(), Some(Value::Int(1)));
}

#[test]
fn merge_stale_detached_copy_fails() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(1, 3, "Ada");

    let stale = fx.detached_customer(1, 2, "Linus");
    let mut session = fx.factory.open_session();
    let err = session.merge(&stale).unwrap_err();

    assert!(err.is_stale_state());
    assert_eq!(fx.statistics.optimistic_failures_for("Customer"), 1);
    let row = fx.storage.row("Customer", 1_i64).expect("stored row");
    assert_eq!(row.values[1], Value::Text("Ada".into()));
}

#[test]
fn merge_onto_instance_already_managed() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(5, 1, "Ada");

    let mut session = fx.factory.open_session();
    let managed = session.get("Customer", 5_i64).unwrap().expect("customer row");
    let loads = fx.storage.load_count();

    let copy = fx.detached_customer(5, 1, "Ada Lovelace");
    let merged = session.merge(&copy).unwrap();

    assert!(Arc::ptr_eq(&merged, &managed));
    assert_eq!(fx.storage.load_count(), loads);
    assert_eq!(managed.basic("name").unwrap(), Value::Text("Ada Lovelace".into()));
    assert!(session.is_dirty().unwrap());
}

#[test]
fn merge_managed_instance_returns_itself() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(2, 1, "Ada");

    let mut session = fx.factory.open_session();
    let managed = session.get("Customer", 2_i64).unwrap().expect("customer row");
    let merged = session.merge(&managed).unwrap();
    assert!(Arc::ptr_eq(&merged, &managed));
}

#[test]
fn merge_transient_graph_saves_copies() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    let order = EntityInstance::new(&fx.descriptor("Order"));
    order.set_basic("status", "new").unwrap();
    for product in ["tea", "cups"] {
        let line = EntityInstance::new(&fx.descriptor("Line"));
        line.set_basic("product", product).unwrap();
        line.set_to_one("order", Some((&order).into())).unwrap();
        order.add_to_many("lines", line.into()).unwrap();
    }

    let mut session = fx.factory.open_session();
    let managed = session.merge(&order).unwrap();

    assert!(!Arc::ptr_eq(&managed, &order));
    assert_eq!(order.id(), None);
    assert_eq!(managed.id(), Some(Value::BigInt(1)));
    assert_eq!(managed.version(), Some(Value::Int(1)));

    let lines = managed.to_many("lines").unwrap();
    let sources = order.to_many("lines").unwrap();
    assert_eq!(lines.len(), 2);
    for (line, source) in lines.iter().zip(&sources) {
        let line = line.implementation().expect("direct line");
        let source = source.implementation().expect("direct source line");
        assert!(!Arc::ptr_eq(&line, &source));
        assert!(session.contains(&line));
        assert!(Arc::ptr_eq(&target_of(&line, "order"), &managed));
    }
    assert_eq!(session.debug_state().pending_inserts, 3);

    session.commit().unwrap();
    assert_eq!(fx.storage.row_count(), 3);
    let row = fx.storage.row("Order", 1_i64).expect("order row");
    assert_eq!(
        row.values[4],
        Value::Array(vec![Value::BigInt(1), Value::BigInt(2)])
    );
}

#[test]
fn merge_with_requested_id_mismatch_fails() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(1, 1, "Ada");
    let copy = fx.detached_customer(1, 1, "Ada");

    let mut session = fx.factory.open_session();
    let err = session.merge_with_id(&copy, 2_i64).unwrap_err();
    assert!(matches!(
        err,
        Error::IdentityMismatch(ref e) if e.kind == IdentityMismatchKind::RequestedId
    ));
}

#[test]
fn merge_detached_without_row_is_saved_as_new() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    let copy = fx.detached_customer(40, 1, "Ghost");

    let mut session = fx.factory.open_session();
    let managed = session.merge(&copy).unwrap();
    assert!(!Arc::ptr_eq(&managed, &copy));
    assert_eq!(session.debug_state().pending_inserts, 1);
    session.commit().unwrap();
    assert_eq!(fx.storage.row_count(), 1);
}

#[test]
fn merge_rejects_two_representations_by_default() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(1, 1, "Ada");

    let order = EntityInstance::new(&fx.descriptor("Order"));
    order
        .set_to_one("customer", Some(fx.detached_customer(1, 1, "Ada").into()))
        .unwrap();
    order
        .set_to_one("billed_to", Some(fx.detached_customer(1, 1, "Ada").into()))
        .unwrap();

    let mut session = fx.factory.open_session();
    let err = session.merge(&order).unwrap_err();
    assert_eq!(
        err.illegal_state_kind(),
        Some(IllegalStateKind::MultipleRepresentations)
    );
}

#[test]
fn merge_accepts_two_representations_when_allowed() {
    for policy in [EntityCopyPolicy::Allow, EntityCopyPolicy::Log] {
        let fx = fixture(policy);
        fx.seed_customer(1, 1, "Ada");

        let order = EntityInstance::new(&fx.descriptor("Order"));
        order
            .set_to_one("customer", Some(fx.detached_customer(1, 1, "Ada").into()))
            .unwrap();
        order
            .set_to_one("billed_to", Some(fx.detached_customer(1, 1, "Ada").into()))
            .unwrap();

        let mut session = fx.factory.open_session();
        let managed = session.merge(&order).unwrap();
        let customer = target_of(&managed, "customer");
        assert!(Arc::ptr_eq(&customer, &target_of(&managed, "billed_to")));
        assert!(session.contains(&customer));

        session.commit().unwrap();
        assert_eq!(fx.storage.row_count(), 2);
    }
}

#[test]
fn merge_uninitialized_proxy_returns_loaded_instance() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(3, 1, "Ada");

    let mut session = fx.factory.open_session();
    let proxy = session.reference("Customer", Value::BigInt(3)).unwrap();
    assert!(proxy.is_uninitialized());

    let managed = session.merge(proxy.clone()).unwrap();
    assert_eq!(managed.basic("name").unwrap(), Value::Text("Ada".into()));
    assert!(!proxy.is_uninitialized());
}

#[test]
fn merge_deleted_instance_fails() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_customer(4, 1, "Ada");

    let mut session = fx.factory.open_session();
    let managed = session.get("Customer", 4_i64).unwrap().expect("customer row");
    session.delete(&managed).unwrap();

    let err = session.merge(&managed).unwrap_err();
    assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::ObjectDeleted));
}

#[test]
fn merge_detached_cycle_maps_each_instance_once() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.seed_person(1, "Ann", 2);
    fx.seed_person(2, "Bob", 1);

    let ann = fx.detached_person(1, "Ann B.");
    let bob = fx.detached_person(2, "Bob A.");
    ann.set_to_one("partner", Some((&bob).into())).unwrap();
    bob.set_to_one("partner", Some((&ann).into())).unwrap();

    let mut session = fx.factory.open_session();
    let managed = session.merge(&ann).unwrap();
    let partner = target_of(&managed, "partner");

    assert!(!Arc::ptr_eq(&managed, &ann));
    assert!(!Arc::ptr_eq(&partner, &bob));
    assert!(session.contains(&partner));
    assert!(Arc::ptr_eq(&target_of(&partner, "partner"), &managed));
    assert_eq!(partner.basic("name").unwrap(), Value::Text("Bob A.".into()));

    session.commit().unwrap();
    assert_eq!(fx.storage.row_count(), 2);
    let row = fx.storage.row("Person", 1_i64).expect("stored row");
    assert_eq!(
        row.values,
        vec![Value::Int(2), Value::Text("Ann B.".into()), Value::BigInt(2)]
    );
}

#[test]
fn merge_fails_when_the_lookup_returns_the_source_itself() {
    let pinned = Arc::new(PinnedLoad::default());
    let registered = Arc::clone(&pinned);
    let factory = SessionFactory::builder(metamodel())
        .configure_listeners(move |registry| {
            registry.prepend_listeners(&LOAD, vec![registered as Arc<dyn LoadEventListener>])
        })
        .build()
        .expect("factory");
    let descriptor = factory.metamodel().entity("Customer").expect("known entity");
    let source = EntityInstance::with_id(descriptor, 8_i64);
    source.set_basic("version", 1).unwrap();
    assert!(pinned.0.set(Arc::clone(&source)).is_ok());

    let mut session = factory.open_session();
    let err = session.merge(&source).unwrap_err();
    assert_eq!(err.illegal_state_kind(), Some(IllegalStateKind::NotDetached));
}

#[test]
fn merge_onto_a_row_of_another_class_fails() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.storage.put_row(
        &fx.descriptor("VipCustomer"),
        7_i64,
        vec![
            Value::Int(1),
            Value::Text("Ada".into()),
            Value::Text("gold".into()),
        ],
    );

    let copy = fx.detached_customer(7, 1, "Ada");
    let mut session = fx.factory.open_session();
    let err = session.merge(&copy).unwrap_err();
    assert!(matches!(
        err,
        Error::IdentityMismatch(ref e) if e.kind == IdentityMismatchKind::WrongClass
    ));
}

#[test]
fn merge_compares_versions_within_their_type() {
    let fx = fixture(EntityCopyPolicy::Disallow);
    fx.storage.put_row(
        &fx.descriptor("Customer"),
        9_i64,
        vec![Value::BigInt(5), Value::Text("Ada".into())],
    );

    let copy = fx.detached_customer(9, 5, "Ada");
    copy.set_basic("version", 5_i64).unwrap();
    assert_eq!(copy.version(), Some(Value::Int(5)));
    assert!(matches!(
        copy.set_basic("version", "5"),
        Err(Error::Type(ref e)) if e.expected == "integer"
    ));

    copy.set_basic("name", "Grace").unwrap();
    let mut session = fx.factory.open_session();
    let managed = session.merge(&copy).unwrap();
    session.commit().unwrap();

    assert_eq!(managed.version(), Some(Value::Int(6)));
    let row = fx.storage.row("Customer", 9_i64).expect("stored row");
    assert_eq!(row.values, vec![Value::Int(6), Value::Text("Grace".into())]);
}

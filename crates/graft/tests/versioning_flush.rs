use graft::metamodel::{IntegerType, LongType, StringType, TimestampType};
use graft::prelude::*;
use graft::{Clock, IllegalStateKind, MemoryStorage, Storage};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
struct ManualClock(AtomicI64);

impl ManualClock {
    fn advance(&self, micros: i64) {
        self.0.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn metamodel() -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityDescriptor::builder("Account")
                .id("id", LongType)
                .sequence_generated("account_seq")
                .version("version", IntegerType)
                .basic("owner", StringType)
                .attribute(
                    AttributeDescriptor::basic("note", StringType).excluded_from_locking(),
                )
                .build()
                .expect("account descriptor"),
        )
        .entity(
            EntityDescriptor::builder("Document")
                .id("id", LongType)
                .sequence_generated("document_seq")
                .version("modified", TimestampType)
                .basic("title", StringType)
                .dirty_tracking()
                .build()
                .expect("document descriptor"),
        )
        .entity(
            EntityDescriptor::builder("Folder")
                .id("id", LongType)
                .sequence_generated("folder_seq")
                .basic("name", StringType)
                .attribute(
                    AttributeDescriptor::to_many("documents", "Document")
                        .cascade(CascadeStyle::of(&[graft::CascadeAction::SaveUpdate, graft::CascadeAction::Delete])),
                )
                .attribute(AttributeDescriptor::to_one("owner", "Account"))
                .build()
                .expect("folder descriptor"),
        )
        .build()
        .expect("metamodel")
}

fn factory(clock: Arc<ManualClock>) -> (Arc<SessionFactory>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let factory = SessionFactory::builder(metamodel())
        .storage(Arc::clone(&storage) as Arc<dyn Storage>)
        .clock(clock)
        .build()
        .expect("factory");
    (factory, storage)
}

fn new_instance(factory: &SessionFactory, name: &str) -> EntityRef {
    EntityInstance::new(factory.metamodel().entity(name).expect("known entity"))
}

#[test]
fn versionable_change_increments_version() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let account = new_instance(&factory, "Account");
    account.set_basic("owner", "ada").unwrap();
    session.persist(&account).unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(account.version(), Some(Value::Int(1)));

    account.set_basic("owner", "grace").unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(account.version(), Some(Value::Int(2)));
    assert_eq!(session.entry(&account).unwrap().version, Some(Value::Int(2)));

    let row = storage.row("Account", 1_i64).expect("account row");
    assert_eq!(row.values[0], Value::Int(2));
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn change_excluded_from_locking_keeps_version() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let account = new_instance(&factory, "Account");
    session.persist(&account).unwrap();
    session.flush().unwrap();

    account.set_basic("note", "vip").unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(account.version(), Some(Value::Int(1)));
    let row = storage.row("Account", 1_i64).expect("account row");
    assert_eq!(row.values[2], Value::Text("vip".into()));
}

#[test]
fn concurrent_update_is_detected_at_flush() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let descriptor = Arc::clone(factory.metamodel().entity("Account").unwrap());
    storage.put_row(&descriptor, 7_i64, vec![Value::Int(4), Value::Text("ada".into()), Value::Null]);

    let mut session = factory.open_session();
    let account = session.get("Account", 7_i64).unwrap().expect("account row");
    account.set_basic("owner", "grace").unwrap();

    storage.put_row(&descriptor, 7_i64, vec![Value::Int(5), Value::Text("linus".into()), Value::Null]);
    let err = session.flush().unwrap_err();
    assert!(err.is_stale_state());
    assert!(err.is_retryable());
    assert_eq!(err.entity_name(), Some("Account"));
}

#[test]
fn force_increment_lock_bumps_version_once() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let descriptor = Arc::clone(factory.metamodel().entity("Account").unwrap());
    storage.put_row(&descriptor, 3_i64, vec![Value::Int(1), Value::Text("ada".into()), Value::Null]);

    let mut session = factory.open_session();
    let account = session.get("Account", 3_i64).unwrap().expect("account row");
    session.lock(&account, LockMode::OptimisticForceIncrement).unwrap();
    assert!(session.is_dirty().unwrap());

    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(account.version(), Some(Value::Int(2)));
    assert_eq!(session.entry(&account).unwrap().lock_mode, LockMode::Read);

    let result = session.flush().unwrap();
    assert_eq!(result.total(), 0);
}

#[test]
fn optimistic_lock_on_unversioned_entity_fails() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let descriptor = Arc::clone(factory.metamodel().entity("Folder").unwrap());
    storage.put_row(&descriptor, 1_i64, vec![Value::Text("inbox".into()), Value::Array(vec![]), Value::Null]);

    let mut session = factory.open_session();
    let folder = session.get("Folder", 1_i64).unwrap().expect("folder row");
    let err = session.lock(&folder, LockMode::Optimistic).unwrap_err();
    assert!(matches!(err, Error::Mapping(_)));
}

#[test]
fn timestamp_versions_follow_the_clock() {
    let clock = Arc::new(ManualClock(AtomicI64::new(1_000)));
    let (factory, _storage) = factory(Arc::clone(&clock));
    let mut session = factory.open_session();
    let document = new_instance(&factory, "Document");
    document.set_basic("title", "draft").unwrap();
    session.persist(&document).unwrap();
    session.flush().unwrap();
    assert_eq!(document.version(), Some(Value::Timestamp(1_000)));

    document.set_basic("title", "final").unwrap();
    session.flush().unwrap();
    assert_eq!(document.version(), Some(Value::Timestamp(1_001)));

    clock.advance(5_000);
    document.set_basic("title", "published").unwrap();
    session.flush().unwrap();
    assert_eq!(document.version(), Some(Value::Timestamp(6_000)));
}

#[test]
fn tracked_instances_report_their_own_dirty_attributes() {
    let (factory, _storage) = factory(Arc::new(ManualClock(AtomicI64::new(10))));
    let mut session = factory.open_session();
    let document = new_instance(&factory, "Document");
    session.persist(&document).unwrap();
    session.flush().unwrap();
    assert!(document.dirtiness().is_some_and(|t| !t.has_dirty_fields()));

    document.set_basic("title", "same as before?").unwrap();
    assert!(session.is_dirty().unwrap());
    assert_eq!(session.flush().unwrap().updated, 1);
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn flush_saves_reachable_transient_instances() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let folder = new_instance(&factory, "Folder");
    folder.set_basic("name", "inbox").unwrap();
    session.persist(&folder).unwrap();
    session.flush().unwrap();

    let document = new_instance(&factory, "Document");
    folder.add_to_many("documents", (&document).into()).unwrap();
    let result = session.flush().unwrap();

    assert_eq!(result.inserted, 1);
    assert_eq!(result.updated, 1);
    assert!(session.contains(&document));
    let row = storage.row("Folder", 1_i64).expect("folder row");
    assert_eq!(row.values[1], Value::Array(vec![Value::BigInt(1)]));
}

#[test]
fn flush_rejects_reference_to_unsaved_instance() {
    let (factory, _storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let folder = new_instance(&factory, "Folder");
    let owner = new_instance(&factory, "Account");
    folder.set_to_one("owner", Some(owner.into())).unwrap();
    session.persist(&folder).unwrap();

    let err = session.flush().unwrap_err();
    assert_eq!(
        err.illegal_state_kind(),
        Some(IllegalStateKind::TransientReference)
    );
}

#[test]
fn delete_cascades_before_parent() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let folder = new_instance(&factory, "Folder");
    for title in ["a", "b"] {
        let document = new_instance(&factory, "Document");
        document.set_basic("title", title).unwrap();
        folder.add_to_many("documents", document.into()).unwrap();
    }
    session.persist(&folder).unwrap();
    session.flush().unwrap();
    assert_eq!(storage.row_count(), 3);

    session.delete(&folder).unwrap();
    assert!(!session.contains(&folder));
    assert_eq!(session.debug_state().pending_deletes, 3);

    let result = session.flush().unwrap();
    assert_eq!(result.deleted, 3);
    assert_eq!(storage.row_count(), 0);
    assert_eq!(session.debug_state().tracked, 0);
}

#[test]
fn persist_after_delete_cancels_the_removal() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let mut session = factory.open_session();
    let account = new_instance(&factory, "Account");
    session.persist(&account).unwrap();
    session.flush().unwrap();

    session.delete(&account).unwrap();
    session.persist(&account).unwrap();
    assert!(session.contains(&account));
    assert_eq!(session.flush().unwrap().deleted, 0);
    assert_eq!(storage.row_count(), 1);
}

#[test]
fn refresh_discards_unflushed_changes() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let descriptor = Arc::clone(factory.metamodel().entity("Account").unwrap());
    storage.put_row(&descriptor, 2_i64, vec![Value::Int(1), Value::Text("ada".into()), Value::Null]);

    let mut session = factory.open_session();
    let account = session.get("Account", 2_i64).unwrap().expect("account row");
    account.set_basic("owner", "changed").unwrap();
    session.refresh(&account).unwrap();

    assert_eq!(account.basic("owner").unwrap(), Value::Text("ada".into()));
    assert!(!session.is_dirty().unwrap());
}

#[test]
fn evicted_instance_is_no_longer_flushed() {
    let (factory, storage) = factory(Arc::new(ManualClock(AtomicI64::new(0))));
    let descriptor = Arc::clone(factory.metamodel().entity("Account").unwrap());
    storage.put_row(&descriptor, 2_i64, vec![Value::Int(1), Value::Text("ada".into()), Value::Null]);

    let mut session = factory.open_session();
    let account = session.get("Account", 2_i64).unwrap().expect("account row");
    account.set_basic("owner", "changed").unwrap();
    session.evict(&account).unwrap();
    session.evict(&account).unwrap();

    assert!(!session.contains(&account));
    assert_eq!(session.flush().unwrap().total(), 0);
    let row = storage.row("Account", 2_i64).expect("account row");
    assert_eq!(row.values[1], Value::Text("ada".into()));
}

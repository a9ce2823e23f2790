//! Identity, persist rules, rollback and close.

use asupersync::runtime::RuntimeBuilder;
use persistkit::prelude::*;

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Err(e) => e,
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn seeded() -> MemoryStore {
    let store = MemoryStore::new();
    store.seed("author", Row::new(Key(1), 0).with_field("name", "Thorben"));
    store
}

#[test]
fn find_returns_the_same_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let first = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        let second = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        assert!(EntityRef::ptr_eq(&first, &second));
        assert_eq!(store.stats().row_loads, 1);

        // Changes through one handle are visible through the other.
        first.set("name", "Changed");
        assert_eq!(second.get("name"), Some(Value::from("Changed")));

        let err = expect_err(session.find(&cx, "author", Key(99)).await);
        assert!(matches!(err, Error::NotFound { entity_type: "author", key: Key(99) }));
    });
}

#[test]
fn persist_assigns_identity_and_commit_inserts() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let author = EntityRef::new(Entity::new("author").with_field("name", "Vlad"));
        assert_eq!(author.key(), None);

        unwrap_outcome(session.persist(&cx, &author).await);
        assert_eq!(author.key(), Some(Key(2)));
        assert!(session.contains(&author));
        assert!(session.is_dirty(&author));
        assert_eq!(store.count("author"), 1);

        // Persisting the same managed instance again is a no-op.
        unwrap_outcome(session.persist(&cx, &author).await);
        assert_eq!(session.debug_info().pending_new, 1);

        let summary = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(summary.inserted, 1);
        assert_eq!(author.version(), 1);
        assert!(!session.is_dirty(&author));
        session.close().expect("close session");

        let mut other = factory.open_session().expect("open second session");
        let loaded = unwrap_outcome(other.find(&cx, "author", Key(2)).await);
        assert!(!EntityRef::ptr_eq(&loaded, &author));
        assert_eq!(loaded.version(), 1);
        assert_eq!(loaded.get("name"), Some(Value::from("Vlad")));
    });
}

#[test]
fn persist_rejects_preassigned_identity() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let author = EntityRef::new(
            Entity::new("author")
                .with_key(Key(42))
                .with_field("name", "Hand made"),
        );

        let err = expect_err(session.persist(&cx, &author).await);
        assert!(matches!(
            err,
            Error::IdentityAlreadyAssigned { entity_type: "author", key: Key(42) }
        ));
        assert!(!session.contains(&author));
        assert_eq!(session.debug_info().pending_new, 0);
        assert!(store.row("author", Key(42)).is_none());
    });
}

#[test]
fn persist_rejects_entity_from_closed_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let factory = SessionFactory::new(seeded());

    rt.block_on(async {
        let mut old = factory.open_session().expect("open old session");
        let author = unwrap_outcome(old.find(&cx, "author", Key(1)).await);
        old.close().expect("close old session");

        let mut session = factory.open_session().expect("open session");
        let err = expect_err(session.persist(&cx, &author).await);
        assert!(matches!(err, Error::DetachedEntity { entity_type: "author", key: Key(1) }));
        assert!(err.is_detached());
        assert!(matches!(
            session.mark_dirty(&author),
            Err(Error::DetachedEntity { .. })
        ));
        assert_eq!(session.debug_info().tracked, 0);
    });
}

#[test]
fn persist_rejects_entity_from_another_factory() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory_a = SessionFactory::new(store.clone());
    let factory_b = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut a = factory_a.open_session().expect("open session a");
        let foreign = unwrap_outcome(a.find(&cx, "author", Key(1)).await);
        a.close().expect("close session a");

        let mut b = factory_b.open_session().expect("open session b");
        assert_eq!(a.id(), b.id());
        let own = unwrap_outcome(b.find(&cx, "author", Key(1)).await);

        let err = expect_err(b.persist(&cx, &foreign).await);
        assert!(matches!(err, Error::DetachedEntity { entity_type: "author", key: Key(1) }));
        assert!(b.contains(&own));
        assert!(!b.contains(&foreign));
    });
}

#[test]
fn persist_rejects_second_instance_with_managed_identity() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let factory = SessionFactory::new(seeded());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let managed = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        assert!(session.evict(&managed));
        assert!(!session.contains(&managed));
        assert!(!session.evict(&managed));

        // Reload registers a new instance for the same identity.
        let reloaded = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        assert!(!EntityRef::ptr_eq(&reloaded, &managed));
        let err = expect_err(session.persist(&cx, &managed).await);
        assert!(matches!(err, Error::DuplicateIdentity { .. }));
    });
}

#[test]
fn rollback_restores_fields_and_cancels_inserts() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        author.set("name", "Changed");
        author.set("nickname", "T");
        let fresh = EntityRef::new(Entity::new("author").with_field("name", "Gavin"));
        unwrap_outcome(session.persist(&cx, &fresh).await);

        session.rollback().expect("rollback");
        assert_eq!(author.get("name"), Some(Value::from("Thorben")));
        assert_eq!(author.get("nickname"), None);
        assert!(!session.is_dirty(&author));
        assert_eq!(fresh.key(), None);
        assert!(!session.contains(&fresh));

        let summary = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(summary, CommitSummary::default());
        assert_eq!(store.count("author"), 1);

        // The cancelled insert can be persisted again.
        unwrap_outcome(session.persist(&cx, &fresh).await);
        assert!(fresh.key().is_some());
    });
}

#[test]
fn close_twice_reports_session_closed() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let factory = SessionFactory::new(seeded());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        session.close().expect("first close");

        assert!(!session.is_open());
        assert!(matches!(session.close(), Err(Error::SessionClosed)));
        assert!(matches!(
            session.find(&cx, "author", Key(1)).await,
            Outcome::Err(Error::SessionClosed)
        ));
        assert!(matches!(session.commit(&cx).await, Outcome::Err(Error::SessionClosed)));
        assert!(matches!(session.rollback(), Err(Error::SessionClosed)));
        assert!(!session.contains(&author));
        assert!(!author.read().is_attached());
    });
}

#[test]
fn close_discards_uncommitted_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let store = seeded();
    let factory = SessionFactory::new(store.clone());

    rt.block_on(async {
        let mut session = factory.open_session().expect("open session");
        let author = unwrap_outcome(session.find(&cx, "author", Key(1)).await);
        author.set("name", "Never written");
        session.close().expect("close session");

        // The detached instance keeps its local state.
        assert_eq!(author.get("name"), Some(Value::from("Never written")));
        assert_eq!(
            store.row("author", Key(1)).expect("row").fields["name"],
            Value::from("Thorben")
        );
        assert_eq!(store.stats().commits, 0);
    });
}

#[test]
fn closed_factory_refuses_new_sessions() {
    let factory = SessionFactory::new(seeded());
    let open = factory.open_session().expect("open session");
    factory.close();

    assert!(matches!(factory.open_session(), Err(Error::FactoryClosed)));
    assert!(open.is_open());
}

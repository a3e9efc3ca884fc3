mod fixtures;

use asupersync::runtime::RuntimeBuilder;
use asupersync::Cx;
use std::sync::Arc;

use docdb::prelude::*;
use docdb::{ChangeType, IdentityConflictKind};
use fixtures::{Company, InMemoryServer, User, expect_err, unwrap_outcome, user};
use serde_json::json;

#[test]
fn stored_entity_round_trips_through_a_new_session() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    let store = DocumentStore::new(server.clone()).database("shop");

    rt.block_on(async {
        let mut writer = store.open_session();
        let ann = entity_ref(user("Ann", 31));
        writer.store(&ann).unwrap();
        unwrap_outcome(writer.save_changes(&cx).await);

        let id = ann.read().unwrap().id.clone().expect("server assigned an id");
        assert_eq!(id, "users/1");
        assert_eq!(writer.get_document_id(&ann).unwrap(), "users/1");
        let saved_cv = writer.get_change_vector_for(&ann).unwrap().unwrap();

        let mut reader = store.open_session();
        let loaded = unwrap_outcome(reader.load::<User>(&cx, "users/1").await).unwrap();
        assert_eq!(loaded.read().unwrap().name, "Ann");
        assert_eq!(loaded.read().unwrap().id.as_deref(), Some("users/1"));
        assert_eq!(
            reader.get_change_vector_for(&loaded).unwrap().as_deref(),
            Some(saved_cv.as_str())
        );

        let metadata = reader.get_metadata_for(&loaded).unwrap();
        assert_eq!(metadata.get_str("@collection").as_deref(), Some("Users"));
        assert!(metadata.get_str("Raven-Rust-Type").unwrap().ends_with("User"));

        // The identity property is not part of the stored body.
        let stored = server.document("users/1").unwrap();
        assert!(!stored.contains_key("id"));
        assert_eq!(stored["name"], json!("Ann"));
    });
}

#[test]
fn second_save_without_changes_sends_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = entity_ref(user("Ann", 31));
        session.store_with_id(&ann, "users/ann").unwrap();
        unwrap_outcome(session.save_changes(&cx).await);
        assert_eq!(server.request_count(), 1);

        assert!(!session.has_changes().unwrap());
        unwrap_outcome(session.save_changes(&cx).await);
        assert_eq!(server.request_count(), 1);

        ann.write().unwrap().age = 32;
        assert!(session.has_changed(&ann).unwrap());
        unwrap_outcome(session.save_changes(&cx).await);
        assert_eq!(server.request_count(), 2);
        assert_eq!(server.document("users/ann").unwrap()["age"], json!(32));
    });
}

#[test]
fn one_instance_per_document_id() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    server.seed("users/2", "Users", json!({ "name": "Bob", "age": 40 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let first = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
        // Lookups are case-insensitive.
        let second = unwrap_outcome(session.load::<User>(&cx, "USERS/1").await).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(server.request_count(), 1);

        let many = unwrap_outcome(session.load_many::<User>(&cx, &["users/1", "users/2"]).await);
        assert!(Arc::ptr_eq(many["users/1"].as_ref().unwrap(), &first));
        assert_eq!(many["users/2"].as_ref().unwrap().read().unwrap().name, "Bob");
        assert_eq!(server.request_count(), 2);

        // A second live instance for a tracked id is rejected.
        let impostor = entity_ref(user("Eve", 20));
        let err = session.store_with_id(&impostor, "users/1").unwrap_err();
        assert_eq!(
            err.identity_conflict_kind(),
            Some(IdentityConflictKind::NonUniqueInstance)
        );
    });
}

#[test]
fn optimistic_concurrency_rejects_stale_writes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::with_conventions(
        server.clone(),
        DocumentConventions::default().use_optimistic_concurrency(true),
    );

    rt.block_on(async {
        let mut first = store.open_session();
        let mut second = store.open_session();
        let a = unwrap_outcome(first.load::<User>(&cx, "users/1").await).unwrap();
        let b = unwrap_outcome(second.load::<User>(&cx, "users/1").await).unwrap();

        a.write().unwrap().age = 32;
        unwrap_outcome(first.save_changes(&cx).await);

        b.write().unwrap().age = 50;
        let err = expect_err(second.save_changes(&cx).await);
        assert!(err.is_concurrency_conflict());
        match err {
            Error::Concurrency(conflict) => {
                assert_eq!(conflict.id.as_deref(), Some("users/1"));
                assert_ne!(conflict.expected_change_vector, conflict.actual_change_vector);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.document("users/1").unwrap()["age"], json!(32));

        // A new document must not overwrite an existing one.
        let mut third = store.open_session();
        let clash = entity_ref(user("Clash", 1));
        third.store_with_id(&clash, "users/1").unwrap();
        assert!(expect_err(third.save_changes(&cx).await).is_concurrency_conflict());
    });
}

#[test]
fn forced_change_vector_without_optimistic_concurrency() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = entity_ref(User {
            id: None,
            name: "Ann".to_string(),
            age: 99,
            company: None,
        });
        session
            .store_with_change_vector(&ann, "users/1", Some("A:0-stale"))
            .unwrap();
        assert!(expect_err(session.save_changes(&cx).await).is_concurrency_conflict());
        let sent = &server.requests()[0];
        assert_eq!(
            sent.body.as_ref().unwrap()["Commands"][0]["ChangeVector"],
            json!("A:0-stale")
        );
    });
}

#[test]
fn deleted_documents_become_known_missing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
        session.delete(&ann).unwrap();
        let changes = session.what_changed().unwrap();
        assert_eq!(changes["users/1"][0].change, ChangeType::DocumentDeleted);

        // Storing an entity marked for deletion is refused.
        let err = session.store(&ann).unwrap_err();
        assert_eq!(
            err.identity_conflict_kind(),
            Some(IdentityConflictKind::StoreAfterDelete)
        );

        unwrap_outcome(session.save_changes(&cx).await);
        assert!(server.document("users/1").is_none());
        assert!(session.is_deleted("users/1"));

        let before = server.request_count();
        assert!(unwrap_outcome(session.load::<User>(&cx, "users/1").await).is_none());
        assert_eq!(server.request_count(), before);
    });
}

#[test]
fn includes_are_served_without_another_request() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("companies/1", "Companies", json!({ "name": "Acme" }));
    server.seed(
        "users/1",
        "Users",
        json!({ "name": "Ann", "age": 31, "company": "companies/1" }),
    );
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = unwrap_outcome(
            session
                .load_with_includes::<User>(&cx, "users/1", &["company"])
                .await,
        )
        .unwrap();
        let company_id = ann.read().unwrap().company.clone().unwrap();
        assert!(session.is_loaded(&company_id));

        let acme = unwrap_outcome(session.load::<Company>(&cx, &company_id).await).unwrap();
        assert_eq!(acme.read().unwrap().name, "Acme");
        assert_eq!(server.request_count(), 1);
    });
}

#[test]
fn deferred_patch_refreshes_the_tracked_entity() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
        let old_cv = session.get_change_vector_for(&ann).unwrap();

        session
            .defer(vec![CommandData::patch(
                "users/1",
                PatchRequest::new("this.age = args.age").with_value("age", json!(41)),
            )])
            .unwrap();
        // A second patch for the same id in one batch is refused.
        assert!(
            session
                .defer(vec![CommandData::patch("users/1", PatchRequest::new("x"))])
                .is_err()
        );

        unwrap_outcome(session.save_changes(&cx).await);
        assert_eq!(ann.read().unwrap().age, 41);
        assert_ne!(session.get_change_vector_for(&ann).unwrap(), old_cv);
        assert!(!session.has_changes().unwrap());
    });
}

#[test]
fn metadata_edits_are_saved() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
        assert!(!session.has_changes().unwrap());

        let metadata = session.get_metadata_for(&ann).unwrap();
        metadata.set("tier", "gold");
        assert!(session.has_changed(&ann).unwrap());

        unwrap_outcome(session.save_changes(&cx).await);
        let stored = server.document("users/1").unwrap();
        assert_eq!(stored["@metadata"]["tier"], json!("gold"));
        assert!(!session.has_changes().unwrap());

        let mut reader = store.open_session();
        let again = unwrap_outcome(reader.load::<User>(&cx, "users/1").await).unwrap();
        assert_eq!(
            reader.get_metadata_for(&again).unwrap().get_str("tier").as_deref(),
            Some("gold")
        );
    });
}

#[test]
fn what_changed_reports_field_level_changes() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    server.seed("users/1", "Users", json!({ "name": "Ann", "age": 31 }));
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        let ann = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
        {
            let mut guard = ann.write().unwrap();
            guard.age = 32;
            guard.company = Some("companies/9".to_string());
        }
        let bob = entity_ref(user("Bob", 40));
        session.store_with_id(&bob, "users/2").unwrap();

        let changes = session.what_changed().unwrap();
        assert_eq!(changes["users/2"][0].change, ChangeType::DocumentAdded);
        let ann_changes = &changes["users/1"];
        assert!(
            ann_changes
                .iter()
                .any(|c| c.field_name == "age" && c.change == ChangeType::FieldChanged)
        );
        assert!(ann_changes.iter().any(|c| c.field_name == "company"));

        session.ignore_changes_for(&ann).unwrap();
        assert!(!session.what_changed().unwrap().contains_key("users/1"));
    });
}

#[test]
fn request_budget_stops_chatty_sessions() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let server = InMemoryServer::new();
    let store = DocumentStore::new(server.clone());

    rt.block_on(async {
        let mut session = store.open_session();
        session.set_max_number_of_requests(2);
        unwrap_outcome(session.load::<User>(&cx, "users/1").await);
        unwrap_outcome(session.load::<User>(&cx, "users/2").await);
        let err = expect_err(session.load::<User>(&cx, "users/3").await);
        assert!(matches!(err, Error::RequestBudgetExceeded(_)));
        assert_eq!(server.request_count(), 2);
        assert_eq!(session.number_of_requests(), 2);
        let stats = session.request_stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.busiest_operation, Some("load"));
    });
}

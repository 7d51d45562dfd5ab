mod common;

use docmap::{memory::InMemoryStore, prelude::*};
use serde::Deserialize;

#[tokio::test]
async fn syncing_clears_the_dirty_set() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann", "age": 20 }).await.unwrap();

    user.sync_original();
    assert!(user.dirty_attributes().is_empty());
    assert!(!user.is_dirty());

    user.set("age", 21);
    assert_eq!(user.dirty_attributes(), doc! { "age": 21 });

    user.unset("name");
    assert_eq!(user.dirty_attributes(), doc! { "age": 21, "name": Bson::Null });
}

#[tokio::test]
async fn stored_documents_hydrate_back_to_the_same_fields() {
    let odm = common::odm();
    let mut user = odm.model("User").unwrap();
    user.merge(doc! { "name": "Ann", "email": "ann@example.com", "age": 20, "status": "active" });
    user.embed_many_mut("addresses").unwrap().create(doc! { "city": "Paris" });
    user.embed_one_mut("settings").unwrap().set_value(doc! { "theme": "dark" });
    user.save().await.unwrap();

    let found = odm.find_or_fail("User", user.id().unwrap().clone()).await.unwrap();

    for (field, value) in user.attributes() {
        assert_eq!(found.get(field), Some(value), "field `{field}` changed");
    }
    assert_eq!(found.to_document(), user.to_document());
    assert!(!found.is_dirty());
}

#[tokio::test]
async fn inserts_stamp_keys_and_timestamps() {
    let odm = common::odm();
    let user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();

    assert!(user.is_persisted());
    assert!(matches!(user.id(), Some(Bson::ObjectId(_))));
    assert!(matches!(user.get("created_at"), Some(Bson::DateTime(_))));
    assert!(matches!(user.get("updated_at"), Some(Bson::DateTime(_))));

    let stored = odm
        .collection("users")
        .find_one(None, &Default::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.get("_id"), user.id());
    assert!(!stored.contains_key("id"));
}

#[tokio::test]
async fn updates_write_only_dirty_fields() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann", "age": 20 }).await.unwrap();

    // Bypass the model so a blind overwrite of `name` would be visible.
    odm.query("User").unwrap().update(doc! { "name": "Changed elsewhere" }).await.unwrap();

    user.set("age", 21);
    assert!(user.save().await.unwrap());
    assert!(!user.is_dirty());

    user.refresh().await.unwrap();
    assert_eq!(user.get("name"), Some(&Bson::String("Changed elsewhere".into())));
    assert_eq!(user.get("age"), Some(&Bson::Int32(21)));
}

#[tokio::test]
async fn missing_required_fields_fail_validation() {
    let odm = common::odm();

    let err = odm.create("User", doc! { "age": 3 }).await.unwrap_err();
    assert!(matches!(err, OdmError::Validation { ref field, .. } if field == "name"));

    let err = odm.create("User", doc! { "name": 7 }).await.unwrap_err();
    assert!(matches!(err, OdmError::Validation { ref field, .. } if field == "name"));
    assert_eq!(odm.query("User").unwrap().count().await.unwrap(), 0);
}

#[tokio::test]
async fn deleting_requires_a_saved_instance() {
    let odm = common::odm();

    let mut draft = odm.model("User").unwrap();
    assert!(matches!(draft.delete().await, Err(OdmError::InvalidState(_))));

    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    assert!(user.delete().await.unwrap());
    assert!(!user.is_persisted());
    assert!(matches!(user.refresh().await, Err(OdmError::NotFound { .. })));
}

#[tokio::test]
async fn relationship_fields_are_not_assignable() {
    let odm = common::odm();
    let mut user = odm.model("User").unwrap();

    user.set("posts", Bson::Array(vec![]));

    assert_eq!(user.get("posts"), None);
    assert!(!user.to_document().contains_key("posts"));
}

#[tokio::test]
async fn json_and_typed_views() {
    #[derive(Debug, Deserialize)]
    struct UserRow {
        name: String,
        age: i32,
    }

    let odm = common::odm();
    let user = odm.create("User", doc! { "name": "Ann", "age": 20 }).await.unwrap();

    let json = serde_json::to_value(&user).unwrap();
    assert_eq!(json["name"], "Ann");
    assert_eq!(json["id"].as_str().map(str::len), Some(24));

    let row: UserRow = user.deserialize().unwrap();
    assert_eq!(row.name, "Ann");
    assert_eq!(row.age, 20);
    assert_eq!(user.get_as::<String>("name").unwrap().as_deref(), Some("Ann"));
}

#[derive(Debug)]
struct Guard;

impl ModelHook for Guard {
    fn before_query(&self, context: &QueryContext<'_>) -> HookOutcome {
        match context.action {
            QueryAction::Delete => HookOutcome::Abort("bulk deletes are disabled".into()),
            _ => HookOutcome::Continue,
        }
    }

    fn before_save(&self, model: &Model) -> HookOutcome {
        match model.get("name").and_then(Bson::as_str) {
            Some("blocked") => HookOutcome::Abort("blocked name".into()),
            _ => HookOutcome::Continue,
        }
    }

    fn before_delete(&self, _model: &Model) -> HookOutcome {
        HookOutcome::Abort("records are kept".into())
    }
}

fn guarded() -> Odm {
    let registry = ModelRegistry::builder()
        .register(ModelSchema::builder("Note").field("name", FieldType::String).hook(Guard))
        .build()
        .unwrap();

    Odm::builder()
        .backend(InMemoryStore::new())
        .registry(registry)
        .build()
        .unwrap()
}

#[tokio::test]
async fn hooks_turn_operations_into_empty_results() {
    let odm = guarded();

    let mut blocked = odm.model("Note").unwrap();
    blocked.set("name", "blocked");
    assert!(!blocked.save().await.unwrap());
    assert!(!blocked.is_persisted());

    let mut kept = odm.create("Note", doc! { "name": "kept" }).await.unwrap();
    assert!(!kept.delete().await.unwrap());
    assert!(kept.is_persisted());

    assert_eq!(odm.query("Note").unwrap().delete().await.unwrap(), 0);
    assert_eq!(odm.query("Note").unwrap().count().await.unwrap(), 1);
}

#[tokio::test]
async fn builder_requires_a_backend() {
    let err = Odm::builder().registry(common::registry()).build().unwrap_err();

    assert!(matches!(err, OdmError::Configuration(_)));
}

#[tokio::test]
async fn unknown_models_are_configuration_errors() {
    let odm = common::odm();

    assert!(matches!(odm.query("Ghost"), Err(OdmError::Configuration(_))));
}

mod common;

use docmap::{memory::InMemoryStore, prelude::*};

async fn author_with_posts(odm: &Odm, name: &str, titles: &[&str]) -> Model {
    let mut author = odm.create("User", doc! { "name": name }).await.unwrap();
    author
        .has_many("posts")
        .unwrap()
        .create_many(titles.iter().map(|title| doc! { "title": *title, "views": title.len() as i32 }))
        .await
        .unwrap();
    author
}

fn titles(related: &RelatedMany) -> Vec<&str> {
    related
        .iter()
        .map(|post| post.get("title").and_then(Bson::as_str).unwrap())
        .collect()
}

#[tokio::test]
async fn has_many_create_links_and_appends() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    let user_id = user.id().cloned().unwrap();

    let mut posts = user.has_many("posts").unwrap();
    assert!(!posts.is_loaded());
    let before = posts.len();

    let created = posts.create(doc! { "title": "T" }).await.unwrap().unwrap();
    assert_eq!(created.get("user_id"), Some(&user_id));
    assert!(created.is_persisted());

    assert_eq!(posts.len(), before + 1);
    assert!(posts.is_loaded());

    let stored = odm.query("Post").unwrap().where_eq("user_id", user_id).count().await.unwrap();
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn related_writes_need_a_saved_owner() {
    let odm = common::odm();
    let mut draft = odm.model("User").unwrap();
    draft.set("name", "Draft");

    let err = draft.has_many("posts").unwrap().create(doc! { "title": "T" }).await.unwrap_err();
    assert!(matches!(err, OdmError::InvalidState(_)));

    let company = odm.model("Company").unwrap();
    let err = draft.belongs_to("company").unwrap().associate(company).await.unwrap_err();
    assert!(matches!(err, OdmError::InvalidState(_)));

    assert_eq!(odm.query("Post").unwrap().count().await.unwrap(), 0);
}

#[tokio::test]
async fn has_many_load_fetches_only_linked_records() {
    let odm = common::odm();
    let mut ann = author_with_posts(&odm, "Ann", &["a1", "a2"]).await;
    author_with_posts(&odm, "Ben", &["b1"]).await;

    let mut fresh = odm.find_or_fail("User", ann.id().cloned().unwrap()).await.unwrap();
    let mut posts = fresh.has_many("posts").unwrap();
    let loaded = posts.load().await.unwrap();
    assert_eq!(titles(loaded), vec!["a1", "a2"]);

    let popular = ann
        .has_many("posts")
        .unwrap()
        .query()
        .unwrap()
        .where_op("views", ">", 1)
        .count()
        .await
        .unwrap();
    assert_eq!(popular, 2);
}

#[tokio::test]
async fn preloading_issues_one_query_per_relation() {
    let (odm, store) = common::counting_odm();
    let authors: [(&str, &[&str]); 4] = [
        ("Ann", &["a1", "a2"]),
        ("Ben", &["b1"]),
        ("Cid", &[]),
        ("Dot", &["d1", "d2", "d3"]),
    ];
    for (name, posts) in authors {
        author_with_posts(&odm, name, posts).await;
    }
    store.reset();

    let users = odm
        .query("User")
        .unwrap()
        .preload("posts")
        .order_by("name", SortDirection::Asc)
        .fetch()
        .await
        .unwrap();

    assert_eq!(store.finds("users"), 1);
    assert_eq!(store.finds("posts"), 1);

    let loaded = users
        .iter()
        .map(|user| titles(user.related_many("posts").unwrap()))
        .collect::<Vec<_>>();
    assert_eq!(loaded, vec![vec!["a1", "a2"], vec!["b1"], vec![], vec!["d1", "d2", "d3"]]);
    assert!(users.iter().all(|user| user.related_many("posts").unwrap().is_loaded()));
}

#[tokio::test]
async fn belongs_to_preload_shares_parents() {
    let (odm, store) = common::counting_odm();
    author_with_posts(&odm, "Ann", &["a1", "a2", "a3"]).await;
    author_with_posts(&odm, "Ben", &["b1", "b2"]).await;
    store.reset();

    let posts = odm.query("Post").unwrap().preload("author").fetch().await.unwrap();

    assert_eq!(posts.len(), 5);
    assert_eq!(store.finds("users"), 1);
    for post in &posts {
        let author = post.related_one("author").unwrap().get().unwrap();
        assert_eq!(author.id(), post.get("user_id"));
    }
}

#[tokio::test]
async fn nested_and_constrained_preloads() {
    let (odm, store) = common::counting_odm();
    let mut ann = author_with_posts(&odm, "Ann", &["short", "a much longer title"]).await;
    {
        let mut posts = ann.has_many("posts").unwrap();
        let post = &mut posts[1];
        post.has_many("comments").unwrap().create(doc! { "body": "nice" }).await.unwrap();
    }
    store.reset();

    let users = odm
        .query("User")
        .unwrap()
        .preload("posts.comments")
        .preload_with("posts", |q| q.where_op("views", ">", 5))
        .fetch()
        .await
        .unwrap();

    assert_eq!(store.finds("posts"), 1);
    assert_eq!(store.finds("comments"), 1);

    let posts = users[0].related_many("posts").unwrap();
    assert_eq!(titles(posts), vec!["a much longer title"]);
    let comments = posts[0].related_many("comments").unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].get("body"), Some(&Bson::String("nice".into())));
}

#[tokio::test]
async fn owners_without_keys_get_empty_relations_without_a_query() {
    let (odm, store) = common::counting_odm();
    odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    store.reset();

    let users = odm.query("User").unwrap().preload("company").fetch().await.unwrap();

    assert_eq!(store.total_finds(), 1);
    let company = users[0].related_one("company").unwrap();
    assert!(company.is_loaded());
    assert!(company.get().is_none());
}

#[tokio::test]
async fn has_one_create_and_load() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();

    {
        let mut profile = user.has_one("profile").unwrap();
        let created = profile.create(doc! { "bio": "hello" }).await.unwrap().unwrap();
        assert!(created.is_persisted());
        assert!(profile.is_loaded());
        assert_eq!(profile.attribute("bio"), Some(&Bson::String("hello".into())));
    }

    let mut fresh = odm.find_or_fail("User", user.id().cloned().unwrap()).await.unwrap();
    let mut profile = fresh.has_one("profile").unwrap();
    assert!(!profile.is_loaded());
    let loaded = profile.load().await.unwrap().unwrap();
    assert_eq!(loaded.get("user_id"), user.id());
}

#[tokio::test]
async fn belongs_to_associate_and_dissociate() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();

    let mut company = odm.model("Company").unwrap();
    company.set("name", "Acme");

    let mut relation = user.belongs_to("company").unwrap();
    assert!(relation.associate(company).await.unwrap());
    let company_id = relation.get().and_then(Model::id).cloned().unwrap();
    assert!(relation.is_loaded());

    let mut stored = odm.find_or_fail("User", user.id().cloned().unwrap()).await.unwrap();
    assert_eq!(stored.get("company_id"), Some(&company_id));
    let loaded = stored.belongs_to("company").unwrap().load().await.unwrap().cloned().unwrap();
    assert_eq!(loaded.get("name"), Some(&Bson::String("Acme".into())));

    assert!(user.belongs_to("company").unwrap().dissociate().await.unwrap());
    stored.refresh().await.unwrap();
    assert_eq!(stored.get("company_id"), Some(&Bson::Null));
}

#[tokio::test]
async fn relation_kind_mismatches_are_configuration_errors() {
    let odm = common::odm();
    let mut user = odm.model("User").unwrap();

    assert!(matches!(user.has_one("posts"), Err(OdmError::Configuration(_))));
    assert!(matches!(user.has_many("nothing"), Err(OdmError::Configuration(_))));
}

#[tokio::test]
async fn loaded_relations_serialize_nested() {
    let odm = common::odm();
    author_with_posts(&odm, "Ann", &["a1"]).await;

    let user = odm.query("User").unwrap().preload("posts").first().await.unwrap().unwrap();
    let json = serde_json::to_value(&user).unwrap();

    assert_eq!(json["posts"][0]["title"], "a1");
    assert_eq!(json["posts"][0]["user_id"], json["id"]);
}

#[derive(Debug)]
struct RejectTitled;

impl ModelHook for RejectTitled {
    fn before_save(&self, model: &Model) -> HookOutcome {
        match model.get("title").and_then(Bson::as_str) {
            Some("rejected") => HookOutcome::Abort("rejected title".into()),
            _ => HookOutcome::Continue,
        }
    }
}

#[derive(Debug)]
struct FrozenUsers;

impl ModelHook for FrozenUsers {
    fn before_save(&self, model: &Model) -> HookOutcome {
        match model.get("status").and_then(Bson::as_str) {
            Some("frozen") => HookOutcome::Abort("frozen user".into()),
            _ => HookOutcome::Continue,
        }
    }
}

fn guarded_odm() -> Odm {
    let registry = ModelRegistry::builder()
        .register(
            ModelSchema::builder("User")
                .field("name", FieldType::String)
                .field("status", FieldType::String)
                .has_many("posts", "Post")
                .has_one("profile", "Profile")
                .belongs_to("company", "Company")
                .hook(FrozenUsers),
        )
        .register(
            ModelSchema::builder("Post")
                .field("title", FieldType::String)
                .hook(RejectTitled),
        )
        .register(
            ModelSchema::builder("Profile")
                .field("title", FieldType::String)
                .hook(RejectTitled),
        )
        .register(
            ModelSchema::builder("Company")
                .field("title", FieldType::String)
                .hook(RejectTitled),
        )
        .build()
        .unwrap();

    Odm::new(InMemoryStore::new(), registry)
}

#[tokio::test]
async fn aborted_related_saves_are_not_cached() {
    let odm = guarded_odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();

    {
        let mut posts = user.has_many("posts").unwrap();
        assert!(posts.create(doc! { "title": "rejected" }).await.unwrap().is_none());
        assert!(posts.is_empty());

        let saved = posts
            .create_many([doc! { "title": "kept" }, doc! { "title": "rejected" }])
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(posts.len(), 1);
    }
    assert_eq!(odm.query("Post").unwrap().count().await.unwrap(), 1);

    let mut profile = user.has_one("profile").unwrap();
    assert!(profile.create(doc! { "title": "rejected" }).await.unwrap().is_none());
    assert!(profile.get().is_none());
    assert_eq!(odm.query("Profile").unwrap().count().await.unwrap(), 0);
}

#[tokio::test]
async fn aborted_association_keeps_the_owner_unchanged() {
    let odm = guarded_odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    let unlinked = user.get("company_id").cloned();

    let mut rejected = odm.model("Company").unwrap();
    rejected.set("title", "rejected");
    let mut company = user.belongs_to("company").unwrap();
    assert!(!company.associate(rejected).await.unwrap());
    assert!(!company.is_loaded());
    assert_eq!(user.get("company_id").cloned(), unlinked);

    user.set("status", "frozen");
    let acme = odm.create("Company", doc! { "title": "Acme" }).await.unwrap();
    let mut company = user.belongs_to("company").unwrap();
    assert!(!company.associate(acme).await.unwrap());
    assert!(company.get().is_none());
    assert_eq!(user.get("company_id").cloned(), unlinked);

    let stored = odm.find_or_fail("User", user.id().cloned().unwrap()).await.unwrap();
    assert!(matches!(stored.get("company_id"), None | Some(Bson::Null)));
}

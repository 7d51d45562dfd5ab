mod common;

use docmap::prelude::*;

async fn user_with_contacts(odm: &Odm) -> Model {
    odm.create(
        "User",
        doc! {
            "name": "Ann",
            "contacts": [
                { "firstName": "Alice", "age": 32 },
                { "firstName": "Bob", "age": 28 },
            ],
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn embedded_queries_filter_in_memory() {
    let odm = common::odm();
    let user = user_with_contacts(&odm).await;

    let older = user.embed_many("contacts").unwrap().query().where_op("age", ">", 30).get().unwrap();

    assert_eq!(older.len(), 1);
    assert_eq!(older[0].attributes(), &doc! { "firstName": "Alice", "age": 32 });
}

#[tokio::test]
async fn embedded_like_is_case_sensitive_and_search_is_not() {
    let odm = common::odm();
    let user = user_with_contacts(&odm).await;
    let contacts = user.embed_many("contacts").unwrap();

    assert_eq!(contacts.query().where_op("firstName", "like", "%LIC%").count().unwrap(), 0);
    assert_eq!(contacts.query().where_op("firstName", "like", "%lic%").count().unwrap(), 1);
    assert_eq!(contacts.query().search("BO", ["firstName"]).count().unwrap(), 1);
}

#[tokio::test]
async fn embedded_mutations_mark_the_field_dirty_and_persist() {
    let odm = common::odm();
    let mut user = user_with_contacts(&odm).await;
    assert!(!user.is_dirty());

    {
        let mut contacts = user.embed_many_mut("contacts").unwrap();
        let carol = contacts.create(doc! { "firstName": "Carol", "age": 45 });
        assert_eq!(carol.index(), Some(2));
        assert_eq!(contacts.remove_where(|c| c.get("firstName") == Some(&Bson::String("Bob".into()))), 1);
    }

    let dirty = user.dirty_attributes();
    assert_eq!(dirty.keys().collect::<Vec<_>>(), vec!["contacts"]);

    user.save().await.unwrap();
    let stored = odm.find_or_fail("User", user.id().cloned().unwrap()).await.unwrap();
    let names = stored
        .embed_many("contacts")
        .unwrap()
        .iter()
        .map(|c| c.get("firstName").and_then(Bson::as_str).unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Alice", "Carol"]);
}

#[tokio::test]
async fn single_embeds_replace_and_clear() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    assert!(user.embed_one("settings").unwrap().is_empty());

    user.embed_one_mut("settings").unwrap().create(doc! { "theme": "dark" });
    user.save().await.unwrap();

    let mut stored = odm.find_or_fail("User", user.id().cloned().unwrap()).await.unwrap();
    let theme = stored.embed_one("settings").unwrap().value().and_then(|s| s.get("theme")).cloned();
    assert_eq!(theme, Some(Bson::String("dark".into())));

    assert!(stored.embed_one_mut("settings").unwrap().update(|s| s.set("theme", "light")));
    assert_eq!(stored.dirty_attributes(), doc! { "settings": { "theme": "light" } });

    stored.embed_one_mut("settings").unwrap().clear();
    assert_eq!(stored.dirty_attributes(), doc! { "settings": Bson::Null });
}

#[tokio::test]
async fn embedded_pages_sorts_and_statistics() {
    let odm = common::odm();
    let mut user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    user.embed_many_mut("contacts")
        .unwrap()
        .create_many((1..=7).map(|i| doc! { "firstName": format!("c{i}"), "age": i * 10 }));

    let contacts = user.embed_many("contacts").unwrap();

    let page = contacts.query().order_by("age", SortDirection::Desc).paginate(2, 3).unwrap();
    assert_eq!(page.meta.last_page, 3);
    assert_eq!(page.data.iter().map(|c| c.get("age").cloned().unwrap()).collect::<Vec<_>>(), vec![
        Bson::Int32(40),
        Bson::Int32(30),
        Bson::Int32(20),
    ]);

    let stats = contacts.query().where_op("age", "<=", 30).aggregate("age").unwrap().unwrap();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.sum, 60.0);
    assert_eq!(stats.avg, 20.0);
    assert_eq!((stats.min, stats.max), (10.0, 30.0));
}

#[tokio::test]
async fn embed_views_narrow_fetched_instances_only() {
    let odm = common::odm();
    user_with_contacts(&odm).await;

    let mut users = odm
        .query("User")
        .unwrap()
        .embed_with("contacts", |q| q.where_op("age", "<", 30))
        .fetch()
        .await
        .unwrap();

    let user = &mut users[0];
    assert_eq!(user.embed_many("contacts").unwrap().len(), 1);
    assert!(!user.is_dirty());

    user.set("name", "Annie");
    user.save().await.unwrap();

    let stored = odm.query("User").unwrap().first().await.unwrap().unwrap();
    assert_eq!(stored.embed_many("contacts").unwrap().len(), 2);
}

#[tokio::test]
async fn embedding_an_unknown_field_fails() {
    let odm = common::odm();
    user_with_contacts(&odm).await;

    let err = odm.query("User").unwrap().embed("friends").fetch().await.unwrap_err();
    assert!(matches!(err, OdmError::Configuration(_)));
}

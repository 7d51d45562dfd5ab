mod common;

use docmap::prelude::*;

async fn seed_people(odm: &Odm) {
    odm.create_many(
        "User",
        [
            doc! { "name": "Ann", "age": 20, "country": "US", "status": "inactive" },
            doc! { "name": "Ben", "age": 16, "country": "US", "status": "active" },
            doc! { "name": "Cid", "age": 30, "country": "FR", "status": "active" },
            doc! { "name": "Dot", "age": 40, "country": "FR", "status": "inactive" },
        ],
    )
    .await
    .unwrap();
}

fn names(models: &[Model]) -> Vec<String> {
    models
        .iter()
        .map(|m| m.get("name").and_then(Bson::as_str).unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn or_where_absorbs_only_the_last_and_condition() {
    let odm = common::odm();
    seed_people(&odm).await;

    let query = odm
        .query("User")
        .unwrap()
        .where_op("age", ">=", 18)
        .where_eq("country", "US")
        .or_where("status", "active")
        .order_by("name", SortDirection::Asc);

    assert_eq!(
        query.compiled_filter().unwrap(),
        Some(Expr::And(vec![
            Filter::gte("age", 18),
            Expr::Or(vec![Filter::eq("country", "US"), Filter::eq("status", "active")]),
        ]))
    );
    assert_eq!(names(&query.fetch().await.unwrap()), vec!["Ann", "Cid"]);
}

#[tokio::test]
async fn a_single_and_entry_with_or_is_a_plain_disjunction() {
    let odm = common::odm();
    seed_people(&odm).await;

    let query = odm
        .query("User")
        .unwrap()
        .where_op("age", ">=", 35)
        .or_where("status", "active")
        .order_by("name", SortDirection::Asc);

    assert_eq!(
        query.compiled_filter().unwrap(),
        Some(Expr::Or(vec![Filter::gte("age", 35), Filter::eq("status", "active")]))
    );
    assert_eq!(names(&query.fetch().await.unwrap()), vec!["Ben", "Cid", "Dot"]);
}

#[tokio::test]
async fn unknown_operators_fail_at_execution() {
    let odm = common::odm();

    let err = odm
        .query("User")
        .unwrap()
        .where_op("age", "~=", 3)
        .fetch()
        .await
        .unwrap_err();

    assert!(matches!(err, OdmError::Validation { ref field, .. } if field == "age"));
}

#[tokio::test]
async fn like_operator_string_is_case_insensitive() {
    let odm = common::odm();
    seed_people(&odm).await;

    let found = odm.query("User").unwrap().where_op("name", "like", "%N%").fetch().await.unwrap();
    assert_eq!(names(&found), vec!["Ann", "Ben"]);

    let found = odm.query("User").unwrap().where_like("name", "%N%").fetch().await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn paginates_with_page_metadata() {
    let odm = common::odm();
    odm.create_many("User", (1..=11).map(|i| doc! { "name": format!("user{i:02}"), "age": i }))
        .await
        .unwrap();

    let page = odm
        .query("User")
        .unwrap()
        .order_by("age", SortDirection::Asc)
        .paginate(3, 4)
        .await
        .unwrap();

    assert_eq!(page.data.len(), 3);
    assert_eq!(page.meta.total, 11);
    assert_eq!(page.meta.last_page, 3);
    assert!(!page.meta.has_next_page);
    assert!(page.meta.has_prev_page);
    assert_eq!(page.meta.next_page_url, None);
    assert_eq!(page.meta.previous_page_url.as_deref(), Some("/?page=2"));
    assert_eq!(names(&page.data), vec!["user09", "user10", "user11"]);
}

#[tokio::test]
async fn empty_pages_report_one_last_page() {
    let odm = common::odm();

    let page = odm.query("User").unwrap().paginate(1, 0).await.unwrap();

    assert!(page.data.is_empty());
    assert_eq!(page.meta.total, 0);
    assert_eq!(page.meta.last_page, 1);
    assert_eq!(page.meta.per_page, odm.config().default_per_page);

    let json = serde_json::to_value(&page).unwrap();
    assert_eq!(json["meta"]["lastPage"], 1);
    assert_eq!(json["meta"]["firstPageUrl"], "/?page=1");
}

#[tokio::test]
async fn first_or_fail_names_the_model() {
    let odm = common::odm();

    assert!(odm.query("User").unwrap().where_eq("name", "nobody").first().await.unwrap().is_none());

    let err = odm
        .query("User")
        .unwrap()
        .where_eq("name", "nobody")
        .first_or_fail()
        .await
        .unwrap_err();
    assert!(matches!(err, OdmError::NotFound { ref model } if model == "User"));
}

#[tokio::test]
async fn bulk_update_and_delete_report_affected_counts() {
    let odm = common::odm();
    seed_people(&odm).await;

    let updated = odm
        .query("User")
        .unwrap()
        .where_eq("country", "FR")
        .update(doc! { "status": "archived" })
        .await
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(odm.query("User").unwrap().where_eq("status", "archived").count().await.unwrap(), 2);

    let deleted = odm.query("User").unwrap().where_op("age", "<", 18).delete().await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(odm.query("User").unwrap().count().await.unwrap(), 3);
}

#[tokio::test]
async fn bulk_updates_stamp_updated_at_unless_given() {
    let odm = common::odm();
    let user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    let epoch = docmap::bson::DateTime::from_millis(1_000);

    let updated_at = |odm: Odm, id: Bson| async move {
        let stored = odm.find_or_fail("User", id).await.unwrap();
        match stored.get("updated_at") {
            Some(Bson::DateTime(at)) => *at,
            other => panic!("unexpected updated_at {other:?}"),
        }
    };
    let id = user.id().cloned().unwrap();

    odm.query("User")
        .unwrap()
        .where_eq("name", "Ann")
        .update(doc! { "status": "pinned", "updated_at": epoch })
        .await
        .unwrap();
    assert_eq!(updated_at(odm.clone(), id.clone()).await, epoch);

    odm.query("User")
        .unwrap()
        .where_eq("name", "Ann")
        .update(doc! { "status": "active" })
        .await
        .unwrap();
    assert!(updated_at(odm.clone(), id).await > epoch);
}

#[tokio::test]
async fn pages_far_past_the_end_are_empty() {
    let odm = common::odm();
    seed_people(&odm).await;

    let page = odm.query("User").unwrap().paginate(u64::MAX, 10).await.unwrap();

    assert!(page.data.is_empty());
    assert_eq!(page.meta.total, 4);
    assert_eq!(page.meta.last_page, 1);
    assert!(!page.meta.has_next_page);
}

#[tokio::test]
async fn groups_carry_keys_and_counts() {
    let odm = common::odm();
    seed_people(&odm).await;

    let groups = odm
        .query("User")
        .unwrap()
        .group_by(["country"])
        .order_by("country", SortDirection::Asc)
        .fetch()
        .await
        .unwrap();

    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].get("country"), Some(&Bson::String("FR".into())));
    assert_eq!(groups[0].get("count"), Some(&Bson::Int64(2)));
    assert!(!groups[0].is_persisted());

    let busy = odm
        .query("User")
        .unwrap()
        .where_eq("status", "active")
        .group_by(["country"])
        .having(|h| h.where_op("count", ">=", 1))
        .fetch()
        .await
        .unwrap();
    assert_eq!(busy.len(), 2);
}

#[tokio::test]
async fn distinct_ids_and_exists() {
    let odm = common::odm();
    seed_people(&odm).await;

    let mut countries = odm.query("User").unwrap().distinct("country").await.unwrap();
    countries.sort_by_key(|c| c.as_str().map(str::to_string));
    assert_eq!(countries, vec![Bson::String("FR".into()), Bson::String("US".into())]);

    let ids = odm.query("User").unwrap().where_eq("country", "US").ids().await.unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| matches!(id, Bson::ObjectId(_))));

    assert!(odm.query("User").unwrap().where_eq("name", "Dot").exists().await.unwrap());
    assert!(!odm.query("User").unwrap().where_eq("name", "Eve").exists().await.unwrap());
}

#[tokio::test]
async fn projection_keeps_the_primary_key() {
    let odm = common::odm();
    seed_people(&odm).await;

    let found = odm
        .query("User")
        .unwrap()
        .select(["name"])
        .where_eq("name", "Ann")
        .first()
        .await
        .unwrap()
        .unwrap();

    assert!(found.id().is_some());
    assert_eq!(found.get("name"), Some(&Bson::String("Ann".into())));
    assert_eq!(found.get("age"), None);
}

#[tokio::test]
async fn string_keys_are_converted_before_lookup() {
    let odm = common::odm();
    let user = odm.create("User", doc! { "name": "Ann" }).await.unwrap();
    let hex = match user.id() {
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        other => panic!("unexpected key {other:?}"),
    };

    let found = odm.find_or_fail("User", hex.as_str()).await.unwrap();
    assert_eq!(found.id(), user.id());
}

#[tokio::test]
async fn shutdown_requires_the_last_handle() {
    let odm = common::odm();
    let other = odm.clone();

    assert!(matches!(other.shutdown().await, Err(OdmError::InvalidState(_))));
    odm.shutdown().await.unwrap();
}

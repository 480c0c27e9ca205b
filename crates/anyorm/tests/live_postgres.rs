//! Smoke test against a real Postgres. Skipped unless `DATABASE_URL` is set
//! (a `.env` file is honored).

#![cfg(feature = "postgres")]

use anyorm::{
    Driver, EagerLoader, ModelDef, ModelRegistry, OrmError, PgDriver, PoolConfig, QueryBuilder,
    RelationshipMeta, Row, Value,
};

fn live_driver() -> Option<PgDriver> {
    dotenvy::dotenv().ok();
    let config = match PoolConfig::from_env() {
        Ok(config) => config.max_size(4),
        Err(_) => {
            eprintln!("DATABASE_URL not set; skipping live Postgres test");
            return None;
        }
    };
    Some(PgDriver::new(&config).expect("pool config"))
}

#[tokio::test]
async fn round_trip_and_lateral_eager_load() -> Result<(), OrmError> {
    let Some(driver) = live_driver() else {
        return Ok(());
    };
    driver.connect().await?;
    // Temp tables are per connection, so pin one for the whole test.
    driver.begin_transaction().await?;

    driver
        .execute(
            "CREATE TEMP TABLE IF NOT EXISTS anyorm_users (id BIGINT PRIMARY KEY, name TEXT NOT NULL)",
            &[],
        )
        .await?;
    driver
        .execute(
            "CREATE TEMP TABLE IF NOT EXISTS anyorm_posts (id BIGSERIAL PRIMARY KEY, user_id BIGINT NOT NULL, score NUMERIC NOT NULL)",
            &[],
        )
        .await?;

    let users = QueryBuilder::on(&driver, "anyorm_users");
    users
        .insert_many(
            &driver,
            (1..=3i64)
                .map(|id| Row::from_pairs([("id", Value::Int(id)), ("name", Value::from(format!("u{id}")))]))
                .collect(),
        )
        .await?;
    let posts = QueryBuilder::on(&driver, "anyorm_posts");
    for user in 1..=3i64 {
        for score in 0..4i64 {
            posts
                .insert(
                    &driver,
                    Row::from_pairs([("user_id", Value::Int(user)), ("score", Value::Int(score))]),
                )
                .await?;
        }
    }

    assert_eq!(posts.count(&driver).await?, 12);
    assert_eq!(posts.sum(&driver, "score").await?, 18.0);

    let mut registry = ModelRegistry::new();
    registry
        .register(
            ModelDef::new("User", "anyorm_users")
                .relation(RelationshipMeta::has_many("posts", "Post", "user_id")),
        )
        .register(ModelDef::new("Post", "anyorm_posts"));

    let top = EagerLoader::new()
        .with_constrained("posts", |q| q.order_by_desc("score").limit(2))
        .get(&driver, &registry, "User", &QueryBuilder::on(&driver, "anyorm_users"))
        .await?;
    assert_eq!(top.len(), 3);
    for user in &top {
        assert_eq!(user.relation("posts").map(|p| p.len()), Some(2));
    }

    driver.rollback().await?;
    driver.disconnect().await?;
    Ok(())
}

use super::*;
use crate::QueryBuilder;
use crate::query::Aggregate;

fn builder(dialect: Dialect, table: &str) -> QueryBuilder {
    QueryBuilder::new(dialect.grammar(), table)
}

fn compiled(q: QueryBuilder) -> CompiledQuery {
    q.to_compiled().unwrap()
}

#[test]
fn update_where_placeholders_continue_after_set() {
    let q = compiled(builder(Dialect::Postgres, "users").where_eq("id", 7).where_eq("tenant", 3));
    let stmt = PostgresGrammar
        .compile_update(
            &q,
            &[
                ("name".to_string(), Value::from("bob")),
                ("email".to_string(), Value::from("b@x.io")),
            ],
        )
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"UPDATE "users" SET "name" = $1, "email" = $2 WHERE "id" = $3 AND "tenant" = $4"#
    );
    assert_eq!(
        stmt.bindings,
        vec![
            Value::from("bob"),
            Value::from("b@x.io"),
            Value::Int(7),
            Value::Int(3)
        ]
    );
}

#[test]
fn update_without_values_is_rejected() {
    let q = compiled(builder(Dialect::Postgres, "users").where_eq("id", 1));
    assert!(PostgresGrammar.compile_update(&q, &[]).is_err());
}

#[test]
fn update_limit_is_dialect_specific() {
    let q = compiled(builder(Dialect::MySql, "jobs").where_eq("state", "new").limit(10));
    let stmt = MySqlGrammar
        .compile_update(&q, &[("state".to_string(), Value::from("taken"))])
        .unwrap();
    assert_eq!(
        stmt.sql,
        "UPDATE `jobs` SET `state` = ? WHERE `state` = ? LIMIT 10"
    );

    let q = compiled(builder(Dialect::Postgres, "jobs").where_eq("state", "new").limit(10));
    assert!(
        PostgresGrammar
            .compile_update(&q, &[("state".to_string(), Value::from("taken"))])
            .is_err()
    );
}

#[test]
fn multi_row_insert() {
    let q = compiled(builder(Dialect::Sqlite, "tags"));
    let rows = vec![
        Row::from_pairs([("name", "rust"), ("slug", "rust")]),
        Row::from_pairs([("name", "Go"), ("slug", "go")]),
    ];
    let stmt = SqliteGrammar.compile_insert(&q, &rows).unwrap();
    assert_eq!(
        stmt.sql,
        r#"INSERT INTO "tags" ("name", "slug") VALUES (?, ?), (?, ?)"#
    );
    assert_eq!(stmt.bindings.len(), 4);
}

#[test]
fn insert_rows_must_share_columns() {
    let q = compiled(builder(Dialect::Postgres, "tags"));
    let rows = vec![
        Row::from_pairs([("name", "rust")]),
        Row::from_pairs([("slug", "go")]),
    ];
    assert!(PostgresGrammar.compile_insert(&q, &rows).is_err());
}

#[test]
fn insert_without_columns_uses_dialect_default() {
    let q = compiled(builder(Dialect::Postgres, "events"));
    let stmt = PostgresGrammar.compile_insert(&q, &[Row::new()]).unwrap();
    assert_eq!(stmt.sql, r#"INSERT INTO "events" DEFAULT VALUES"#);

    let q = compiled(builder(Dialect::MySql, "events"));
    let stmt = MySqlGrammar.compile_insert(&q, &[Row::new()]).unwrap();
    assert_eq!(stmt.sql, "INSERT INTO `events` () VALUES ()");
}

#[test]
fn insert_get_id_uses_returning_where_available() {
    let row = Row::from_pairs([("email", "a@x.io")]);

    let q = compiled(builder(Dialect::Postgres, "users"));
    let stmt = PostgresGrammar.compile_insert_get_id(&q, &row).unwrap();
    assert_eq!(
        stmt.sql,
        r#"INSERT INTO "users" ("email") VALUES ($1) RETURNING "id""#
    );

    let q = compiled(builder(Dialect::MySql, "users"));
    let stmt = MySqlGrammar.compile_insert_get_id(&q, &row).unwrap();
    assert_eq!(stmt.sql, "INSERT INTO `users` (`email`) VALUES (?)");
}

#[test]
fn upsert_per_dialect() {
    let rows = vec![Row::from_pairs([("email", "a@x.io"), ("name", "A")])];
    let update = Upsert {
        unique_by: vec!["email".into()],
        update: vec!["name".into()],
    };
    let ignore = Upsert {
        unique_by: vec!["email".into()],
        update: vec![],
    };

    let q = compiled(builder(Dialect::Postgres, "users"));
    assert_eq!(
        PostgresGrammar.compile_upsert(&q, &rows, &update).unwrap().sql,
        r#"INSERT INTO "users" ("email", "name") VALUES ($1, $2) ON CONFLICT ("email") DO UPDATE SET "name" = EXCLUDED."name""#
    );
    assert_eq!(
        PostgresGrammar.compile_upsert(&q, &rows, &ignore).unwrap().sql,
        r#"INSERT INTO "users" ("email", "name") VALUES ($1, $2) ON CONFLICT ("email") DO NOTHING"#
    );

    let q = compiled(builder(Dialect::MySql, "users"));
    assert_eq!(
        MySqlGrammar.compile_upsert(&q, &rows, &update).unwrap().sql,
        "INSERT INTO `users` (`email`, `name`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
    );
    assert_eq!(
        MySqlGrammar.compile_upsert(&q, &rows, &ignore).unwrap().sql,
        "INSERT IGNORE INTO `users` (`email`, `name`) VALUES (?, ?)"
    );

    let q = compiled(builder(Dialect::Sqlite, "users"));
    let err = SqliteGrammar.compile_upsert(&q, &rows, &update).unwrap_err();
    assert!(matches!(
        err,
        OrmError::UnsupportedConstruct {
            target: "sqlite",
            ..
        }
    ));
}

#[test]
fn delete_and_truncate() {
    let q = compiled(builder(Dialect::Postgres, "sessions").where_op("expires_at", "<", 100));
    let stmt = PostgresGrammar.compile_delete(&q).unwrap();
    assert_eq!(stmt.sql, r#"DELETE FROM "sessions" WHERE "expires_at" < $1"#);

    assert_eq!(
        PostgresGrammar.compile_truncate(&q).sql,
        r#"TRUNCATE TABLE "sessions""#
    );
    assert_eq!(
        SqliteGrammar.compile_truncate(&q).sql,
        r#"DELETE FROM "sessions""#
    );
}

#[test]
fn aggregate_ignores_selection_and_order() {
    let q = compiled(
        builder(Dialect::Postgres, "orders")
            .select(&["id", "total"])
            .where_eq("status", "paid")
            .order_by("created_at"),
    );
    let stmt = PostgresGrammar
        .compile_aggregate(&q, Aggregate::Sum, "total")
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT SUM("total") AS "aggregate" FROM "orders" WHERE "status" = $1"#
    );
    assert_eq!(stmt.bindings, vec![Value::from("paid")]);
}

#[test]
fn aggregate_wraps_grouped_or_limited_queries() {
    let q = compiled(
        builder(Dialect::Postgres, "orders")
            .where_eq("status", "paid")
            .group_by(&["user_id"])
            .having("COUNT(*)", ">", 1),
    );
    let stmt = PostgresGrammar
        .compile_aggregate(&q, Aggregate::Count, "*")
        .unwrap();
    assert_eq!(
        stmt.sql,
        concat!(
            r#"SELECT COUNT(*) AS "aggregate" FROM (SELECT "user_id" FROM "orders" "#,
            r#"WHERE "status" = $1 GROUP BY "user_id" HAVING COUNT(*) > $2) AS "__agg""#
        )
    );
    assert_eq!(stmt.bindings, vec![Value::from("paid"), Value::Int(1)]);

    let q = compiled(builder(Dialect::MySql, "orders").limit(5));
    let stmt = MySqlGrammar.compile_aggregate(&q, Aggregate::Count, "*").unwrap();
    assert_eq!(
        stmt.sql,
        "SELECT COUNT(*) AS `aggregate` FROM (SELECT * FROM `orders` ORDER BY `id` ASC LIMIT 5) AS `__agg`"
    );
}

#[test]
fn exists_wraps_select() {
    let q = compiled(builder(Dialect::Sqlite, "users").where_eq("email", "a@x.io"));
    let stmt = SqliteGrammar.compile_exists(&q).unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT EXISTS(SELECT * FROM "users" WHERE "email" = ?) AS "exists""#
    );
}

#[test]
fn lateral_query_binds_parent_ids_as_one_array() {
    let relation = compiled(
        builder(Dialect::Postgres, "posts")
            .where_eq("published", true)
            .or_where_eq("pinned", true)
            .order_by_desc("created_at")
            .limit(3),
    );
    let spec = LateralQuery {
        relation: &relation,
        foreign_key: "user_id",
        parent_ids: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
    };
    let stmt = PostgresGrammar.compile_lateral(&spec).unwrap();
    assert_eq!(
        stmt.sql,
        concat!(
            r#"SELECT "__parent"."__parent_key", "__child".* "#,
            r#"FROM unnest($1::bigint[]) AS "__parent"("__parent_key") "#,
            r#"CROSS JOIN LATERAL (SELECT * FROM "posts" "#,
            r#"WHERE "posts"."user_id" = "__parent"."__parent_key" "#,
            r#"AND ("published" = $2 OR "pinned" = $3) "#,
            r#"ORDER BY "created_at" DESC, "id" ASC LIMIT 3) AS "__child""#
        )
    );
    assert_eq!(
        stmt.bindings,
        vec![
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            Value::Bool(true),
            Value::Bool(true),
        ]
    );
}

#[test]
fn lateral_array_cast_follows_id_type() {
    let relation = compiled(builder(Dialect::Postgres, "comments").limit(1));
    let spec = LateralQuery {
        relation: &relation,
        foreign_key: "post_id",
        parent_ids: vec![Value::from("a"), Value::from("b")],
    };
    let stmt = PostgresGrammar.compile_lateral(&spec).unwrap();
    assert!(stmt.sql.contains("unnest($1::text[])"));

    let spec = LateralQuery {
        relation: &relation,
        foreign_key: "post_id",
        parent_ids: vec![Value::from("1"), Value::Int(2), Value::from(" 3")],
    };
    let stmt = PostgresGrammar.compile_lateral(&spec).unwrap();
    assert!(stmt.sql.contains("unnest($1::bigint[])"));
    assert_eq!(
        stmt.bindings[0],
        Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
    );
}

#[test]
fn lateral_is_unsupported_on_mysql_and_sqlite() {
    let relation = compiled(builder(Dialect::MySql, "posts").limit(3));
    let spec = LateralQuery {
        relation: &relation,
        foreign_key: "user_id",
        parent_ids: vec![Value::Int(1)],
    };
    assert!(matches!(
        MySqlGrammar.compile_lateral(&spec),
        Err(OrmError::LateralUnsupported("mysql"))
    ));
    assert!(matches!(
        SqliteGrammar.compile_lateral(&spec),
        Err(OrmError::LateralUnsupported("sqlite"))
    ));
    assert!(!MySqlGrammar.supports_lateral());
    assert!(PostgresGrammar.supports_lateral());
}

#[test]
fn identifiers_and_literals_are_escaped() {
    assert_eq!(PostgresGrammar.wrap_column(r#"we"ird"#), r#""we""ird""#);
    assert_eq!(MySqlGrammar.wrap_column("a.b"), "`a`.`b`");
    assert_eq!(PostgresGrammar.wrap_column("COUNT(*)"), "COUNT(*)");
    assert_eq!(PostgresGrammar.wrap_table("users u"), r#""users" AS "u""#);
    assert_eq!(MySqlGrammar.quote_value(&Value::from(r"a\b")), r"'a\\b'");
    assert_eq!(
        PostgresGrammar.quote_value(&Value::Bytes(vec![0xde, 0xad])),
        r"'\xdead'::bytea"
    );
    assert_eq!(SqliteGrammar.quote_value(&Value::Null), "NULL");
}

#[test]
fn offset_without_limit_per_dialect() {
    let q = compiled(builder(Dialect::Postgres, "t").offset(5));
    assert!(PostgresGrammar.compile_select(&q).unwrap().sql.ends_with("OFFSET 5"));
    assert!(
        MySqlGrammar
            .compile_select(&q)
            .unwrap()
            .sql
            .ends_with("LIMIT 18446744073709551615 OFFSET 5")
    );
    assert!(SqliteGrammar.compile_select(&q).unwrap().sql.ends_with("LIMIT -1 OFFSET 5"));
}

#[test]
fn ilike_falls_back_to_like() {
    let q = compiled(builder(Dialect::MySql, "users").where_op("name", "ilike", "a%"));
    assert_eq!(
        MySqlGrammar.compile_select(&q).unwrap().sql,
        "SELECT * FROM `users` WHERE `name` LIKE ?"
    );
    assert_eq!(
        PostgresGrammar.compile_select(&q).unwrap().sql,
        r#"SELECT * FROM "users" WHERE "name" ILIKE $1"#
    );
}

#[test]
fn where_offsets_thread_through_sections() {
    let wheres = compiled(builder(Dialect::Postgres, "t").where_eq("a", 1).where_eq("b", 2)).wheres;
    let fragment = PostgresGrammar.compile_wheres(&wheres, 4);
    assert_eq!(fragment.sql, r#""a" = $5 AND "b" = $6"#);
    assert_eq!(fragment.bindings.len(), 2);

    let marker = PostgresGrammar.compile_where_fragment(&wheres);
    assert_eq!(marker.sql, r#""a" = ? AND "b" = ?"#);
}

#[test]
fn lock_suffix_per_dialect() {
    let q = compiled(builder(Dialect::MySql, "t").shared_lock());
    assert!(MySqlGrammar.compile_select(&q).unwrap().sql.ends_with(" LOCK IN SHARE MODE"));
    assert!(PostgresGrammar.compile_select(&q).unwrap().sql.ends_with(" FOR SHARE"));
    assert_eq!(SqliteGrammar.compile_select(&q).unwrap().sql, r#"SELECT * FROM "t""#);
}

use super::*;
use crate::grammar::Dialect;

fn pg(table: &str) -> QueryBuilder {
    QueryBuilder::new(Dialect::Postgres.grammar(), table)
}

fn mysql(table: &str) -> QueryBuilder {
    QueryBuilder::new(Dialect::MySql.grammar(), table)
}

#[test]
fn numbered_placeholders_follow_clause_order() {
    let stmt = pg("users")
        .where_eq("a", 1)
        .where_in("b", vec![2, 3])
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "users" WHERE "a" = $1 AND "b" IN ($2, $3)"#
    );
    assert_eq!(stmt.bindings, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn nested_group_keeps_bindings_after_a_quoted_identifier() {
    let stmt = pg("t")
        .where_group(|g| g.where_eq("o'neil", 1).where_eq("b", 2))
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "t" WHERE ("o'neil" = $1 AND "b" = $2)"#
    );
    assert_eq!(stmt.bindings, vec![Value::Int(1), Value::Int(2)]);

    let stmt = mysql("t")
        .where_group(|g| g.where_eq("why?", 1).or_where_eq("b", 2))
        .to_sql()
        .unwrap();
    assert_eq!(stmt.sql, "SELECT * FROM `t` WHERE (`why?` = ? OR `b` = ?)");
    assert_eq!(stmt.bindings, vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn binding_order_is_structural_not_call_order() {
    // having and order-raw are appended before the where, yet bind after it.
    let q = pg("orders")
        .select_raw("SUM(amount) * ? AS scaled", vec![Value::Int(10)])
        .order_by_raw("FIELD(status, ?)", vec![Value::from("open")])
        .group_by(&["user_id"])
        .having("COUNT(*)", ">", 2)
        .where_eq("region", "eu")
        .where_raw("created_at > ?", vec![Value::from("2024-01-01")]);
    let stmt = q.to_sql().unwrap();
    assert_eq!(
        stmt.sql,
        concat!(
            r#"SELECT SUM(amount) * $1 AS scaled FROM "orders" "#,
            r#"WHERE "region" = $2 AND created_at > $3 "#,
            r#"GROUP BY "user_id" HAVING COUNT(*) > $4 ORDER BY FIELD(status, $5)"#
        )
    );
    assert_eq!(
        stmt.bindings,
        vec![
            Value::Int(10),
            Value::from("eu"),
            Value::from("2024-01-01"),
            Value::Int(2),
            Value::from("open"),
        ]
    );
    assert_eq!(q.to_compiled().unwrap().bindings, stmt.bindings);
}

#[test]
fn nested_group_renders_in_parentheses_with_ordered_bindings() {
    let stmt = mysql("t")
        .where_eq("a", 1)
        .where_group(|q| q.where_eq("b", 2).or_where_eq("c", 3))
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        "SELECT * FROM `t` WHERE `a` = ? AND (`b` = ? OR `c` = ?)"
    );
    assert_eq!(stmt.bindings, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn nested_group_numbers_placeholders_at_final_compile() {
    let stmt = pg("t")
        .where_eq("a", 1)
        .where_group(|q| {
            q.where_eq("b", 2)
                .or_where_group(|q| q.where_in("c", vec![3, 4]).where_null("d"))
        })
        .where_eq("e", 5)
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "t" WHERE "a" = $1 AND ("b" = $2 OR ("c" IN ($3, $4) AND "d" IS NULL)) AND "e" = $5"#
    );
    assert_eq!(stmt.bindings.len(), 5);
}

#[test]
fn empty_group_is_dropped() {
    let stmt = pg("t").where_group(|q| q).to_sql().unwrap();
    assert_eq!(stmt.sql, r#"SELECT * FROM "t""#);
}

#[test]
fn empty_where_in_compiles_to_literal_empty_list() {
    let stmt = pg("t")
        .where_in("id", Vec::<i64>::new())
        .to_sql()
        .unwrap();
    assert_eq!(stmt.sql, r#"SELECT * FROM "t" WHERE "id" IN ()"#);
    assert!(stmt.bindings.is_empty());
}

#[test]
fn pagination_adds_primary_key_tie_breaker_once() {
    let q = pg("posts").order_by_desc("created_at").paginate(10, 3);
    let stmt = q.to_sql().unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "posts" ORDER BY "created_at" DESC, "id" ASC LIMIT 10 OFFSET 20"#
    );

    // paginate is idempotent, and to_compiled does not add a second tie-breaker.
    let again = q.paginate(10, 3).to_sql().unwrap();
    assert_eq!(again.sql, stmt.sql);
}

#[test]
fn tie_breaker_is_skipped_when_order_references_key() {
    let stmt = pg("posts").order_by_desc("id").limit(5).to_sql().unwrap();
    assert_eq!(stmt.sql, r#"SELECT * FROM "posts" ORDER BY "id" DESC LIMIT 5"#);
}

#[test]
fn unpaginated_reads_get_no_tie_breaker() {
    let stmt = pg("posts").order_by("title").to_sql().unwrap();
    assert_eq!(stmt.sql, r#"SELECT * FROM "posts" ORDER BY "title" ASC"#);
}

#[test]
fn tie_breaker_is_qualified_when_joined() {
    let stmt = pg("posts")
        .join("users", "users.id", "=", "posts.user_id")
        .limit(1)
        .to_sql()
        .unwrap();
    assert!(stmt.sql.ends_with(r#"ORDER BY "posts"."id" ASC LIMIT 1"#));
}

#[test]
fn invalid_operator_surfaces_as_validation_error() {
    let err = pg("t").where_op("a", "; DROP TABLE t", 1).to_sql().unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
}

#[test]
fn raw_marker_mismatch_is_rejected() {
    let err = pg("t")
        .where_raw("a = ? AND b = ?", vec![Value::Int(1)])
        .to_compiled()
        .unwrap_err();
    assert!(err.is_compile_error());
}

#[test]
fn null_equality_becomes_is_null() {
    let stmt = pg("t")
        .where_eq("deleted_at", Value::Null)
        .where_op("owner", "!=", None::<i64>)
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "t" WHERE "deleted_at" IS NULL AND "owner" IS NOT NULL"#
    );
}

#[test]
fn global_scopes_apply_once_and_can_be_removed() {
    let q = pg("users")
        .with_global_scope("active", |q| q.where_eq("active", true))
        .where_eq("role", "admin");

    let compiled = q.to_compiled().unwrap();
    assert_eq!(compiled.wheres.len(), 2);
    // Compiling twice neither mutates the builder nor doubles the scope.
    assert_eq!(q.to_compiled().unwrap(), compiled);

    let unscoped = q.clone().without_global_scope("active").to_compiled().unwrap();
    assert_eq!(unscoped.wheres.len(), 1);
}

#[test]
fn scopes_are_isolated_from_or_conditions() {
    let stmt = pg("posts")
        .with_global_scope("published", |q| q.where_not_null("published_at"))
        .where_eq("author", 1)
        .or_where_eq("author", 2)
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "posts" WHERE ("author" = $1 OR "author" = $2) AND ("published_at" IS NOT NULL)"#
    );
    assert_eq!(stmt.bindings, vec![Value::Int(1), Value::Int(2)]);
}

#[test]
fn clone_is_independent() {
    let base = pg("t").where_eq("a", 1);
    let narrowed = base.clone().where_eq("b", 2);
    assert_eq!(base.to_compiled().unwrap().wheres.len(), 1);
    assert_eq!(narrowed.to_compiled().unwrap().wheres.len(), 2);
}

#[test]
fn select_columns_and_distinct() {
    let stmt = pg("users as u")
        .select(&["u.id", "u.email as mail"])
        .distinct()
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT DISTINCT "u"."id", "u"."email" AS "mail" FROM "users" AS "u""#
    );
}

#[test]
fn joins_render_in_order() {
    let stmt = mysql("posts")
        .join("users", "users.id", "=", "posts.user_id")
        .left_join("tags", "tags.post_id", "=", "posts.id")
        .cross_join("regions")
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        "SELECT * FROM `posts` INNER JOIN `users` ON `users`.`id` = `posts`.`user_id` \
         LEFT JOIN `tags` ON `tags`.`post_id` = `posts`.`id` CROSS JOIN `regions`"
    );
}

#[test]
fn raw_sql_inlines_literals() {
    let sql = pg("users")
        .where_eq("name", "O'Brien")
        .where_in("id", vec![1, 2])
        .to_raw_sql()
        .unwrap();
    assert_eq!(
        sql,
        r#"SELECT * FROM "users" WHERE "name" = 'O''Brien' AND "id" IN (1, 2)"#
    );
}

#[test]
fn locks_are_appended_last() {
    let stmt = pg("accounts")
        .where_eq("id", 1)
        .lock_for_update()
        .to_sql()
        .unwrap();
    assert_eq!(
        stmt.sql,
        r#"SELECT * FROM "accounts" WHERE "id" = $1 FOR UPDATE"#
    );
}

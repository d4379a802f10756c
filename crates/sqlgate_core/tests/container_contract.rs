use std::sync::Arc;

use sqlgate_core::{
    DatabaseContext, DatabaseContextConfiguration, DbContext, DbError, DbType, ExecutionType,
    Value,
};
use sqlgate_test_support::fixtures::column;
use sqlgate_test_support::{FakeAdapter, FakeOutcome};

async fn context(adapter: &FakeAdapter, provider: &str) -> Arc<DatabaseContext> {
    let config = DatabaseContextConfiguration::new("Host=db;Database=app", provider);
    Arc::new(
        DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn parameter_budget_is_enforced_at_ninety_percent() {
    let adapter = FakeAdapter::sqlite();
    let config = DatabaseContextConfiguration::new("Data Source=:memory:", "sqlite");
    let ctx = DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
        .await
        .unwrap();

    let mut container = ctx.create_container();
    for i in 0..899 {
        container
            .add_parameter(Some(&format!("w{i}")), DbType::Int64, Value::Int(i as i64))
            .unwrap();
    }
    let overflow = container.add_parameter(Some("w899"), DbType::Int64, Value::Int(899));
    match overflow {
        Err(DbError::TooManyParameters { max_allowed }) => assert_eq!(max_allowed, 899),
        other => panic!("expected parameter budget failure, got {other:?}"),
    }
}

#[tokio::test]
async fn postgres_markers_are_positional_dollars() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("SELECT * FROM \"t\" WHERE \"a\"=");
    let first = container.bind(Some("w0"), DbType::Int64, Value::Int(1)).unwrap();
    container.append_sql(first);
    container.append_sql(" AND \"b\"=");
    let second = container.bind(Some("w1"), DbType::Text, "x".into()).unwrap();
    container.append_sql(second);

    assert_eq!(
        container.sql(),
        "SELECT * FROM \"t\" WHERE \"a\"=$1 AND \"b\"=$2"
    );
}

#[tokio::test]
async fn parameters_are_addressable_by_base_name() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.add_parameter(Some("w0"), DbType::Text, "old".into()).unwrap();
    container.set_parameter_value("w0", "new".into()).unwrap();

    let value: String = container.get_parameter_value("w0").unwrap();
    assert_eq!(value, "new");

    // Lookups use the base name, never the dialect marker.
    assert!(container.get_parameter_value::<String>("$1").is_err());
}

#[tokio::test]
async fn anonymous_parameters_get_generated_names() {
    let adapter = FakeAdapter::sql_server();
    let ctx = context(&adapter, "Microsoft.Data.SqlClient").await;

    let mut container = ctx.create_container();
    let base = container
        .add_parameter(None, DbType::Text, "v".into())
        .unwrap();
    assert!(base.chars().next().unwrap().is_ascii_alphabetic());
    assert!(base.len() >= 2);
    assert_eq!(container.make_parameter_name(&base), format!("@{base}"));
}

#[tokio::test]
async fn stored_procedure_wrapping_uses_dialect_style() {
    let adapter = FakeAdapter::sql_server();
    let ctx = context(&adapter, "Microsoft.Data.SqlClient").await;

    let mut container = ctx.create_container();
    container.append_sql("dbo.sync_users");
    container.add_parameter(Some("p0"), DbType::Int64, Value::Int(1)).unwrap();
    container.add_parameter(Some("p1"), DbType::Text, "x".into()).unwrap();
    container
        .wrap_for_stored_procedure(ExecutionType::Write, true)
        .unwrap();

    assert_eq!(container.sql(), "EXEC [dbo].[sync_users] @p0, @p1");
}

#[tokio::test]
async fn postgres_read_procedures_become_set_returning_selects() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "npgsql").await;

    let mut reads = ctx.create_container();
    reads.append_sql("active_users");
    reads.add_parameter(Some("p0"), DbType::Int64, Value::Int(10)).unwrap();
    reads
        .wrap_for_stored_procedure(ExecutionType::Read, true)
        .unwrap();
    assert_eq!(reads.sql(), "SELECT * FROM \"active_users\"($1)");

    let mut writes = ctx.create_container();
    writes.append_sql("archive_users");
    writes
        .wrap_for_stored_procedure(ExecutionType::Write, false)
        .unwrap();
    assert_eq!(writes.sql(), "CALL \"archive_users\"()");
}

#[tokio::test]
async fn sqlite_has_no_procedure_wrapping() {
    let adapter = FakeAdapter::sqlite();
    let config = DatabaseContextConfiguration::new("Data Source=:memory:", "sqlite");
    let ctx = DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
        .await
        .unwrap();

    let mut container = ctx.create_container();
    container.append_sql("sync_users");
    let result = container.wrap_for_stored_procedure(ExecutionType::Write, false);
    assert!(matches!(result, Err(DbError::NotSupported(_))));
}

#[tokio::test]
async fn preview_renders_bound_values_as_literals() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("SELECT * FROM \"t\" WHERE \"name\"=");
    let marker = container
        .bind(Some("w0"), DbType::Text, "o'neil".into())
        .unwrap();
    container.append_sql(marker);

    assert_eq!(
        container.preview(),
        "SELECT * FROM \"t\" WHERE \"name\"=$1 /* w0='o''neil' */"
    );
}

#[tokio::test]
async fn clear_resets_text_and_parameters() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("SELECT 1");
    container.add_parameter(Some("w0"), DbType::Int64, Value::Int(1)).unwrap();
    container.clear();

    assert_eq!(container.sql(), "");
    assert_eq!(container.parameter_count(), 0);
}

#[tokio::test]
async fn reader_streams_rows_and_reads_by_name() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "SELECT \"id\", \"name\" FROM \"t\"",
        FakeOutcome::Rows {
            columns: vec![column("id", "int8"), column("name", "text")],
            rows: vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Text("b".into())],
            ],
        },
    );
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("SELECT \"id\", \"name\" FROM \"t\"");
    let mut reader = container.execute_reader(ExecutionType::Read).await.unwrap();

    let mut names = Vec::new();
    while reader.read().await.unwrap() {
        names.push(reader.get_named_as::<String>("name").unwrap());
    }
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    reader.dispose().await.unwrap();
}

#[tokio::test]
async fn scalar_execution_coerces_types() {
    let adapter = FakeAdapter::postgres();
    adapter.script("SELECT COUNT(*) FROM \"t\"", FakeOutcome::scalar(41i64));
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("SELECT COUNT(*) FROM \"t\"");
    let count: Option<i64> = container.execute_scalar(ExecutionType::Read).await.unwrap();
    assert_eq!(count, Some(41));
}

#[tokio::test]
async fn unique_violations_are_classified_by_the_dialect() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1)",
        FakeOutcome::unique_violation(
            "duplicate key value violates unique constraint \"t_name_key\"",
            None,
            Some("23505"),
        ),
    );
    let ctx = context(&adapter, "npgsql").await;

    let mut container = ctx.create_container();
    container.append_sql("INSERT INTO \"t\" (\"name\") VALUES (");
    let marker = container.bind(Some("i0"), DbType::Text, "dup".into()).unwrap();
    container.append_sql(format!("{marker})"));

    let result = container.execute_non_query(ExecutionType::Write).await;
    assert!(matches!(result, Err(DbError::UniqueViolation(_))));
}

#[tokio::test]
async fn unrecognized_products_get_the_fallback_dialect() {
    let adapter = FakeAdapter::unrecognized();
    let config = DatabaseContextConfiguration::new("Server=weird", "acme-dbms");
    let ctx = DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
        .await
        .unwrap();

    assert!(ctx.is_fallback_dialect());
    assert_eq!(
        sqlgate_core::DbContext::product(&ctx),
        sqlgate_core::SupportedDatabase::Unknown
    );
}

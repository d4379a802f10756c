use std::sync::Arc;

use sqlgate_core::{
    DatabaseContext, DatabaseContextConfiguration, DbError, TableGateway, Value,
};
use sqlgate_test_support::fixtures::{
    AccountRow, AuditedDocument, DboUser, OracleUser, SampleUser, TaskRow, TaskState, column,
};
use sqlgate_test_support::{FakeAdapter, FakeOutcome};

async fn context(adapter: &FakeAdapter, connection_string: &str) -> Arc<DatabaseContext> {
    let config = DatabaseContextConfiguration::new(connection_string, provider_of(adapter));
    Arc::new(
        DatabaseContext::connect(config, adapter.clone().as_adapter_arc())
            .await
            .expect("context should come up"),
    )
}

fn provider_of(adapter: &FakeAdapter) -> String {
    use sqlgate_core::DriverAdapter;
    adapter.provider_name().to_string()
}

fn insert_statements(adapter: &FakeAdapter) -> Vec<String> {
    adapter
        .executed_sql()
        .into_iter()
        .filter(|sql| sql.starts_with("INSERT") || sql.starts_with("MERGE"))
        .collect()
}

#[tokio::test]
async fn postgres_identity_insert_uses_returning() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"",
        FakeOutcome::scalar(7i64),
    );
    let ctx = context(&adapter, "Host=db;Database=app").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let mut user = SampleUser {
        id: None,
        name: "alice".into(),
    };
    let created = gateway.create(&mut user, None).await.unwrap();

    assert!(created);
    assert_eq!(user.id, Some(7));

    let inserts = insert_statements(&adapter);
    assert_eq!(
        inserts,
        vec!["INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"".to_string()]
    );
    let recorded = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("INSERT"))
        .unwrap();
    assert_eq!(recorded.params, vec![("i0".to_string(), Value::Text("alice".into()))]);
}

#[tokio::test]
async fn postgres_retrieve_one_round_trips() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"",
        FakeOutcome::scalar(7i64),
    );
    adapter.script(
        "SELECT \"id\", \"name\" FROM \"t\" WHERE \"id\"=$1",
        FakeOutcome::Rows {
            columns: vec![column("id", "int8"), column("name", "text")],
            rows: vec![vec![Value::Int(7), Value::Text("alice".into())]],
        },
    );
    let ctx = context(&adapter, "Host=db;Database=app").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let mut user = SampleUser {
        id: None,
        name: "alice".into(),
    };
    gateway.create(&mut user, None).await.unwrap();

    let fetched = gateway
        .retrieve_one(&Value::Int(7), None)
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(fetched, user);
}

#[tokio::test]
async fn retrieve_one_rejects_multiple_rows() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "SELECT \"id\", \"name\" FROM \"t\" WHERE \"id\"=$1",
        FakeOutcome::Rows {
            columns: vec![column("id", "int8"), column("name", "text")],
            rows: vec![
                vec![Value::Int(7), Value::Text("a".into())],
                vec![Value::Int(7), Value::Text("b".into())],
            ],
        },
    );
    let ctx = context(&adapter, "Host=db;Database=app").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let result = gateway.retrieve_one(&Value::Int(7), None).await;
    assert!(matches!(result, Err(DbError::MultipleRowsFound(2))));
}

#[tokio::test]
async fn sql_server_identity_insert_uses_output_inserted() {
    let adapter = FakeAdapter::sql_server();
    adapter.script(
        "INSERT INTO [dbo].[t] ([name]) OUTPUT INSERTED.[id] VALUES (@i0)",
        FakeOutcome::scalar(3i64),
    );
    let ctx = context(&adapter, "Server=db;Database=app").await;

    let gateway = TableGateway::<DboUser>::new(ctx).unwrap();
    let mut user = DboUser {
        id: None,
        name: "alice".into(),
    };
    let created = gateway.create(&mut user, None).await.unwrap();

    assert!(created);
    assert_eq!(user.id, Some(3));
    assert_eq!(
        insert_statements(&adapter),
        vec!["INSERT INTO [dbo].[t] ([name]) OUTPUT INSERTED.[id] VALUES (@i0)".to_string()]
    );
}

#[tokio::test]
async fn mysql_insert_reads_last_insert_id_on_same_connection() {
    let adapter = FakeAdapter::mysql();
    adapter.script("SELECT LAST_INSERT_ID()", FakeOutcome::scalar(5i64));
    let ctx = context(&adapter, "Server=db;Database=app").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let mut user = SampleUser {
        id: None,
        name: "alice".into(),
    };
    let created = gateway.create(&mut user, None).await.unwrap();

    assert!(created);
    assert_eq!(user.id, Some(5));

    let executed = adapter.executed();
    let insert_pos = executed
        .iter()
        .position(|r| r.sql == "INSERT INTO `t` (`name`) VALUES (?)")
        .expect("insert should be recorded");
    let last_id = &executed[insert_pos + 1];
    assert_eq!(last_id.sql, "SELECT LAST_INSERT_ID()");
    assert_eq!(
        last_id.connection_id, executed[insert_pos].connection_id,
        "last-insert-id must run on the inserting connection"
    );
}

#[tokio::test]
async fn oracle_insert_prefetches_sequence() {
    let adapter = FakeAdapter::oracle();
    adapter.script("SELECT t_seq.NEXTVAL FROM DUAL", FakeOutcome::scalar(42i64));
    let ctx = context(&adapter, "Data Source=db").await;

    let gateway = TableGateway::<OracleUser>::new(ctx).unwrap();
    let mut user = OracleUser {
        id: None,
        name: "alice".into(),
    };
    let created = gateway.create(&mut user, None).await.unwrap();

    assert!(created);
    assert_eq!(user.id, Some(42));

    let executed = adapter.executed_sql();
    let nextval_pos = executed
        .iter()
        .position(|sql| sql == "SELECT t_seq.NEXTVAL FROM DUAL")
        .expect("sequence prefetch should run");
    let insert_pos = executed
        .iter()
        .position(|sql| sql == "INSERT INTO \"T\" (\"ID\",\"NAME\") VALUES (:i0,:i1)")
        .expect("insert should carry the prefetched id");
    assert!(nextval_pos < insert_pos);

    let recorded = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("INSERT"))
        .unwrap();
    assert_eq!(
        recorded.params,
        vec![
            ("i0".to_string(), Value::Int(42)),
            ("i1".to_string(), Value::Text("alice".into())),
        ]
    );
}

#[tokio::test]
async fn postgres_upsert_emits_on_conflict_do_update() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "Host=db;Database=app").await;

    let gateway = TableGateway::<AccountRow>::new(ctx).unwrap();
    let mut account = AccountRow {
        username: "john".into(),
        email: "a".into(),
        version: 0,
    };
    gateway.upsert(&mut account, None).await.unwrap();

    let inserts = insert_statements(&adapter);
    assert_eq!(
        inserts,
        vec![
            "INSERT INTO \"accounts\" (\"username\",\"email\",\"version\") VALUES ($1,$2,$3) \
             ON CONFLICT(\"username\") DO UPDATE SET \"email\"=EXCLUDED.\"email\", \
             \"version\"=\"version\"+1"
                .to_string()
        ]
    );
    // The version side effect lands on the entity before emission.
    assert_eq!(account.version, 1);
}

#[tokio::test]
async fn mysql_upsert_emits_on_duplicate_key() {
    let adapter = FakeAdapter::mysql();
    let ctx = context(&adapter, "Server=db").await;

    let gateway = TableGateway::<AccountRow>::new(ctx).unwrap();
    let mut account = AccountRow {
        username: "john".into(),
        email: "b".into(),
        version: 0,
    };
    gateway.upsert(&mut account, None).await.unwrap();

    let inserts = insert_statements(&adapter);
    assert_eq!(
        inserts,
        vec![
            "INSERT INTO `accounts` (`username`,`email`,`version`) VALUES (?,?,?) \
             ON DUPLICATE KEY UPDATE `email`=VALUES(`email`), `version`=`version`+1"
                .to_string()
        ]
    );
}

#[tokio::test]
async fn sql_server_upsert_emits_single_row_merge() {
    let adapter = FakeAdapter::sql_server();
    let ctx = context(&adapter, "Server=db").await;

    let gateway = TableGateway::<AccountRow>::new(ctx).unwrap();
    let mut account = AccountRow {
        username: "john".into(),
        email: "c".into(),
        version: 0,
    };
    gateway.upsert(&mut account, None).await.unwrap();

    let merges = insert_statements(&adapter);
    assert_eq!(merges.len(), 1);
    let merge = &merges[0];
    assert!(merge.starts_with("MERGE INTO [accounts] t USING (SELECT @i0 AS [username]"));
    assert!(merge.contains("ON (t.[username]=s.[username])"));
    assert!(merge.contains("WHEN MATCHED THEN UPDATE SET t.[email]=s.[email], t.[version]=t.[version]+1"));
    assert!(merge.contains(
        "WHEN NOT MATCHED THEN INSERT ([username],[email],[version]) VALUES (s.[username],s.[email],s.[version])"
    ));
    assert!(merge.ends_with(';'));
}

#[tokio::test]
async fn sqlite_retrieve_chunks_below_parameter_cap() {
    let adapter = FakeAdapter::sqlite();
    let ctx = context(&adapter, "Data Source=app.db").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let ids: Vec<Value> = (0..10_000).map(Value::Int).collect();
    let found = gateway.retrieve(&ids, None).await.unwrap();
    assert!(found.is_empty());

    let selects: Vec<_> = adapter
        .executed()
        .into_iter()
        .filter(|r| r.sql.starts_with("SELECT \"id\", \"name\""))
        .collect();

    // 10,000 ids at 899 per chunk.
    assert_eq!(selects.len(), 12);
    let mut total = 0usize;
    for select in &selects {
        assert!(select.params.len() <= 899, "chunk exceeded the 0.9x budget");
        assert!(select.sql.contains("IN ("));
        total += select.params.len();
    }
    assert_eq!(total, 10_000);
}

#[tokio::test]
async fn update_with_version_returns_zero_on_conflict() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "UPDATE \"accounts\" SET \"email\"=$1, \"version\"=\"version\"+1 \
         WHERE \"username\"=$2 AND \"version\"=$3",
        FakeOutcome::Affected(0),
    );
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<AccountRow>::new(ctx).unwrap();
    let mut account = AccountRow {
        username: "john".into(),
        email: "new@example.com".into(),
        version: 3,
    };
    let rows = gateway.update(&mut account, None).await.unwrap();

    // Optimistic conflict is a zero row count, not an error.
    assert_eq!(rows, 0);

    let recorded = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("UPDATE"))
        .unwrap();
    assert_eq!(
        recorded.params,
        vec![
            ("s0".to_string(), Value::Text("new@example.com".into())),
            ("k0".to_string(), Value::Text("john".into())),
            ("v0".to_string(), Value::Int(3)),
        ]
    );
}

#[tokio::test]
async fn create_stamps_audit_and_version_before_emission() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<AuditedDocument>::new(ctx).unwrap();
    let mut doc = AuditedDocument {
        title: "quarterly report".into(),
        ..AuditedDocument::default()
    };
    gateway.create(&mut doc, None).await.unwrap();

    assert_eq!(doc.version, 1);
    assert_eq!(doc.created_by.as_deref(), Some("system"));
    assert_eq!(doc.updated_by.as_deref(), Some("system"));
    assert!(doc.created_on.is_some());
    assert_eq!(doc.created_on, doc.updated_on);

    let recorded = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("INSERT"))
        .unwrap();
    // Every insertable column is bound: title, version, four audit columns.
    assert_eq!(recorded.params.len(), 6);
}

#[tokio::test]
async fn batch_create_chunks_by_column_count() {
    let adapter = FakeAdapter::sqlite();
    let ctx = context(&adapter, "Data Source=app.db").await;

    let gateway = TableGateway::<AccountRow>::new(ctx).unwrap();
    // Three insertable columns; 899 / 3 = 299 rows per statement.
    let mut rows: Vec<AccountRow> = (0..700)
        .map(|i| AccountRow {
            username: format!("user{i}"),
            email: format!("user{i}@example.com"),
            version: 0,
        })
        .collect();
    let inserted = gateway.batch_create(&mut rows, None).await.unwrap();
    assert_eq!(inserted, 700);

    let inserts: Vec<_> = adapter
        .executed()
        .into_iter()
        .filter(|r| r.sql.starts_with("INSERT"))
        .collect();
    assert_eq!(inserts.len(), 3); // 299 + 299 + 102
    assert!(inserts[0].params.len() <= 899);
    assert_eq!(inserts[0].params.len(), 299 * 3);
    assert_eq!(inserts[2].params.len(), 102 * 3);
    assert!(inserts[0].params[0].0.starts_with('b'));
}

#[tokio::test]
async fn batch_create_empty_and_single_row() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"",
        FakeOutcome::scalar(1i64),
    );
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    assert_eq!(gateway.batch_create(&mut [], None).await.unwrap(), 0);

    let mut one = vec![SampleUser {
        id: None,
        name: "only".into(),
    }];
    // The single-row path goes through Create, key retrieval included.
    assert_eq!(gateway.batch_create(&mut one, None).await.unwrap(), 1);
    assert_eq!(one[0].id, Some(1));
}

#[tokio::test]
async fn context_override_routes_the_same_gateway_to_another_backend() {
    let pg_adapter = FakeAdapter::postgres();
    pg_adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"",
        FakeOutcome::scalar(1i64),
    );
    let pg_ctx = context(&pg_adapter, "Host=db").await;

    let mysql_adapter = FakeAdapter::mysql();
    mysql_adapter.script("SELECT LAST_INSERT_ID()", FakeOutcome::scalar(2i64));
    let mysql_ctx = context(&mysql_adapter, "Server=db").await;

    // One gateway instance; per-call routing decides dialect and wire.
    let gateway = TableGateway::<SampleUser>::new(pg_ctx).unwrap();

    let mut on_default = SampleUser {
        id: None,
        name: "alice".into(),
    };
    gateway.create(&mut on_default, None).await.unwrap();
    assert_eq!(on_default.id, Some(1));

    let mut on_tenant = SampleUser {
        id: None,
        name: "bob".into(),
    };
    gateway
        .create(&mut on_tenant, Some(&*mysql_ctx))
        .await
        .unwrap();
    assert_eq!(on_tenant.id, Some(2));

    assert!(
        pg_adapter
            .executed_sql()
            .contains(&"INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"".to_string())
    );
    assert!(
        mysql_adapter
            .executed_sql()
            .contains(&"INSERT INTO `t` (`name`) VALUES (?)".to_string())
    );
}

#[tokio::test]
async fn retrieve_preserves_request_order() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "SELECT \"id\", \"name\" FROM \"t\" WHERE \"id\" IN ($1,$2,$3)",
        FakeOutcome::Rows {
            columns: vec![column("id", "int8"), column("name", "text")],
            rows: vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Text("b".into())],
                vec![Value::Int(3), Value::Text("c".into())],
            ],
        },
    );
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();
    let found = gateway
        .retrieve(&[Value::Int(3), Value::Int(1), Value::Int(2)], None)
        .await
        .unwrap();

    let ids: Vec<Option<i64>> = found.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![Some(3), Some(1), Some(2)]);
}

#[tokio::test]
async fn update_refreshes_update_audit_but_not_create_audit() {
    let adapter = FakeAdapter::postgres();
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<AuditedDocument>::new(ctx).unwrap();
    let created = sqlgate_core::chrono::Utc::now() - sqlgate_core::chrono::Duration::hours(3);
    let mut doc = AuditedDocument {
        id: Some(4),
        title: "minutes".into(),
        version: 2,
        created_by: Some("alice".into()),
        created_on: Some(created),
        updated_by: Some("alice".into()),
        updated_on: Some(created),
    };
    gateway.update(&mut doc, None).await.unwrap();

    assert_eq!(doc.created_by.as_deref(), Some("alice"));
    assert_eq!(doc.created_on, Some(created));
    assert_eq!(doc.updated_by.as_deref(), Some("system"));
    assert!(doc.updated_on.unwrap() > created);
    assert_eq!(doc.version, 3);

    let update = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("UPDATE"))
        .unwrap();
    assert!(!update.sql.contains("\"created_by\""));
    assert!(!update.sql.contains("\"created_on\""));
    assert!(update.sql.contains("\"updated_by\""));
    assert!(update.sql.contains("\"version\"=\"version\"+1"));
    assert!(update.sql.contains("WHERE \"id\"=") && update.sql.contains("AND \"version\"="));
    // Keys: SET params, then the id key, then the version check.
    let names: Vec<&str> = update.params.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["s0", "s1", "s2", "k0", "v0"]);
}

#[tokio::test]
async fn enum_and_json_columns_round_trip_through_their_wire_forms() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"tasks\" (\"state\",\"payload\") VALUES ($1,$2) RETURNING \"id\"",
        FakeOutcome::scalar(11i64),
    );
    adapter.script(
        "SELECT \"id\", \"state\", \"payload\" FROM \"tasks\" WHERE \"id\"=$1",
        FakeOutcome::Rows {
            columns: vec![column("id", "int8"), column("state", "text"), column("payload", "jsonb")],
            rows: vec![vec![
                Value::Int(11),
                Value::Text("Running".into()),
                Value::Json("{\"retries\":2}".into()),
            ]],
        },
    );
    let ctx = context(&adapter, "Host=db").await;

    let gateway = TableGateway::<TaskRow>::new(ctx).unwrap();
    let mut task = TaskRow {
        id: None,
        state: TaskState::Running,
        payload: serde_json::json!({"retries": 2}),
    };
    assert!(gateway.create(&mut task, None).await.unwrap());

    let recorded = adapter
        .executed()
        .into_iter()
        .find(|r| r.sql.starts_with("INSERT"))
        .unwrap();
    // The enum binds as its name, the json column as serialized text.
    assert_eq!(recorded.params[0], ("i0".to_string(), Value::Text("Running".into())));
    assert_eq!(
        recorded.params[1],
        ("i1".to_string(), Value::Json("{\"retries\":2}".into()))
    );

    let fetched = gateway
        .retrieve_one(&Value::Int(11), None)
        .await
        .unwrap()
        .expect("row should exist");
    assert_eq!(fetched.state, TaskState::Running);
    assert_eq!(fetched.payload, serde_json::json!({"retries": 2}));
}

#[tokio::test]
async fn fake_default_execute_reports_one_row() {
    let adapter = FakeAdapter::postgres();
    adapter.script(
        "INSERT INTO \"t\" (\"name\") VALUES ($1) RETURNING \"id\"",
        FakeOutcome::scalar(9i64),
    );
    let ctx = context(&adapter, "Host=db").await;
    let gateway = TableGateway::<SampleUser>::new(ctx).unwrap();

    let mut user = SampleUser {
        id: None,
        name: "bob".into(),
    };
    assert!(gateway.create(&mut user, None).await.unwrap());
    assert_eq!(gateway.delete(&Value::Int(9), None).await.unwrap(), 1);
}

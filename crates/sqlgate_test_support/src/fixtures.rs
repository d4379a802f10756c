use sqlgate_core::{
    AuditRole, ColumnMeta, DbError, DbType, Entity, FromValue, TableSchema, Value,
};

pub fn column(name: impl Into<String>, type_name: impl Into<String>) -> ColumnMeta {
    ColumnMeta {
        name: name.into(),
        type_name: type_name.into(),
        nullable: true,
    }
}

fn set_opt_i64(target: &mut Option<i64>, value: Value) -> Result<(), DbError> {
    *target = Option::<i64>::from_value(value)?;
    Ok(())
}

fn set_string(target: &mut String, value: Value) -> Result<(), DbError> {
    *target = String::from_value(value)?;
    Ok(())
}

/// Minimal entity with a server-generated id: table `t`, columns
/// `id`, `name`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleUser {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for SampleUser {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("t")
            .column("id", DbType::Int64, |c| c.id())
            .column("name", DbType::Text, |c| c)
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "id" => self.id.into(),
            "name" => self.name.clone().into(),
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "id" => set_opt_i64(&mut self.id, value),
            "name" => set_string(&mut self.name, value),
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

/// Schema-qualified variant of [`SampleUser`] (`dbo.t`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DboUser {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for DboUser {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("t")
            .schema("dbo")
            .column("id", DbType::Int64, |c| c.id())
            .column("name", DbType::Text, |c| c)
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "id" => self.id.into(),
            "name" => self.name.clone().into(),
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "id" => set_opt_i64(&mut self.id, value),
            "name" => set_string(&mut self.name, value),
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

/// Upper-case mapping with a named sequence, the Oracle convention.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleUser {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for OracleUser {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("T")
            .column("ID", DbType::Int64, |c| c.id().sequence("t_seq"))
            .column("NAME", DbType::Text, |c| c)
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "ID" => self.id.into(),
            "NAME" => self.name.clone().into(),
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "ID" => set_opt_i64(&mut self.id, value),
            "NAME" => set_string(&mut self.name, value),
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

/// Business-keyed account with a version column, for upsert and
/// optimistic-concurrency scenarios.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountRow {
    pub username: String,
    pub email: String,
    pub version: i64,
}

impl Entity for AccountRow {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("accounts")
            .column("username", DbType::Text, |c| c.primary_key(0))
            .column("email", DbType::Text, |c| c)
            .column("version", DbType::Int64, |c| c.version())
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "username" => self.username.clone().into(),
            "email" => self.email.clone().into(),
            "version" => {
                if self.version == 0 {
                    Value::Null
                } else {
                    Value::Int(self.version)
                }
            }
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "username" => set_string(&mut self.username, value),
            "email" => set_string(&mut self.email, value),
            "version" => {
                self.version = Option::<i64>::from_value(value)?.unwrap_or(0);
                Ok(())
            }
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

/// Work item state stored by variant name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Done,
}

impl TaskState {
    pub fn as_name(self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Running => "Running",
            TaskState::Done => "Done",
        }
    }

    /// Case-sensitive, mirroring how the column round-trips.
    pub fn from_name(name: &str) -> Result<Self, DbError> {
        match name {
            "Pending" => Ok(TaskState::Pending),
            "Running" => Ok(TaskState::Running),
            "Done" => Ok(TaskState::Done),
            other => Err(DbError::invalid_value(format!(
                "unknown task state {other:?}"
            ))),
        }
    }
}

/// Entity with an enum-as-name column and a JSON column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRow {
    pub id: Option<i64>,
    pub state: TaskState,
    pub payload: serde_json::Value,
}

impl Entity for TaskRow {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("tasks")
            .column("id", DbType::Int64, |c| c.id())
            .column("state", DbType::Text, |c| c.enum_as_name())
            .column("payload", DbType::Json, |c| c.json())
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "id" => self.id.into(),
            "state" => Value::Text(self.state.as_name().to_string()),
            "payload" => match serde_json::to_string(&self.payload) {
                Ok(text) => Value::Json(text),
                Err(_) => Value::Null,
            },
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "id" => set_opt_i64(&mut self.id, value),
            "state" => {
                let name = String::from_value(value)?;
                self.state = TaskState::from_name(&name)?;
                Ok(())
            }
            "payload" => {
                let text = String::from_value(value)?;
                self.payload = serde_json::from_str(&text)
                    .map_err(|e| DbError::invalid_value(format!("malformed json payload: {e}")))?;
                Ok(())
            }
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

/// Fully-audited entity: id, payload, version, and all four audit columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditedDocument {
    pub id: Option<i64>,
    pub title: String,
    pub version: i64,
    pub created_by: Option<String>,
    pub created_on: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_by: Option<String>,
    pub updated_on: Option<chrono::DateTime<chrono::Utc>>,
}

impl Entity for AuditedDocument {
    fn table_schema() -> Result<TableSchema, DbError> {
        TableSchema::builder("documents")
            .column("id", DbType::Int64, |c| c.id())
            .column("title", DbType::Text, |c| c)
            .column("version", DbType::Int64, |c| c.version())
            .column("created_by", DbType::Text, |c| c.audit(AuditRole::CreatedBy))
            .column("created_on", DbType::DateTime, |c| c.audit(AuditRole::CreatedOn))
            .column("updated_by", DbType::Text, |c| c.audit(AuditRole::UpdatedBy))
            .column("updated_on", DbType::DateTime, |c| c.audit(AuditRole::UpdatedOn))
            .build()
    }

    fn get(&self, column: &str) -> Value {
        match column {
            "id" => self.id.into(),
            "title" => self.title.clone().into(),
            "version" => {
                if self.version == 0 {
                    Value::Null
                } else {
                    Value::Int(self.version)
                }
            }
            "created_by" => self.created_by.clone().into(),
            "created_on" => self.created_on.into(),
            "updated_by" => self.updated_by.clone().into(),
            "updated_on" => self.updated_on.into(),
            _ => Value::Null,
        }
    }

    fn set(&mut self, column: &str, value: Value) -> Result<(), DbError> {
        match column {
            "id" => set_opt_i64(&mut self.id, value),
            "title" => set_string(&mut self.title, value),
            "version" => {
                self.version = Option::<i64>::from_value(value)?.unwrap_or(0);
                Ok(())
            }
            "created_by" => {
                self.created_by = Option::<String>::from_value(value)?;
                Ok(())
            }
            "created_on" => {
                self.created_on = Option::<chrono::DateTime<chrono::Utc>>::from_value(value)?;
                Ok(())
            }
            "updated_by" => {
                self.updated_by = Option::<String>::from_value(value)?;
                Ok(())
            }
            "updated_on" => {
                self.updated_on = Option::<chrono::DateTime<chrono::Utc>>::from_value(value)?;
                Ok(())
            }
            other => Err(DbError::invalid_value(format!("unmapped column {other:?}"))),
        }
    }
}

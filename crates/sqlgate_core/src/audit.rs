use chrono::{DateTime, Utc};

use crate::value::Value;

/// Resolved audit context for one write: who and when.
#[derive(Debug, Clone)]
pub struct AuditValues {
    pub user_id: Value,
    pub utc_now: DateTime<Utc>,
}

/// Supplies the audit user and clock for gateway writes.
///
/// Implementations typically read the ambient request principal; the
/// default resolver stamps a fixed system identity.
pub trait AuditValueResolver: Send + Sync {
    fn resolve(&self) -> AuditValues;
}

/// Fixed-identity resolver using the wall clock.
pub struct SystemAuditResolver {
    user_id: Value,
}

impl SystemAuditResolver {
    pub fn new(user_id: impl Into<Value>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

impl Default for SystemAuditResolver {
    fn default() -> Self {
        Self {
            user_id: Value::Text("system".to_string()),
        }
    }
}

impl AuditValueResolver for SystemAuditResolver {
    fn resolve(&self) -> AuditValues {
        AuditValues {
            user_id: self.user_id.clone(),
            utc_now: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_resolver_stamps_identity() {
        let resolver = SystemAuditResolver::new("svc-batch");
        let values = resolver.resolve();
        assert_eq!(values.user_id, Value::Text("svc-batch".into()));
    }
}

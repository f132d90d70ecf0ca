//! Teaching capture capability (principal only — gated by role level in
//! the catalog).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::brain::memory::MemoryContext;
use crate::capability::{CapabilityHandler, Envelope, HandlerError, HandlerResult};
use crate::store::Db;

/// Record a value statement for later verification.
pub struct TeachingRecordHandler {
    db: Arc<Db>,
}

impl TeachingRecordHandler {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CapabilityHandler for TeachingRecordHandler {
    async fn run(
        &self,
        params: &Value,
        envelope: &Envelope,
        _context: &MemoryContext,
    ) -> Result<HandlerResult, HandlerError> {
        let statement = params
            .get("statement")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerError::ParameterInvalid("statement".to_owned()))?;
        let category = params
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("general");

        let tenant = self.db.tenant(envelope.tenant_id);
        let id = tenant
            .insert_teaching(envelope.user_id, statement, category, 5, envelope.now)
            .await
            .map_err(|e| HandlerError::UpstreamUnavailable(e.to_string()))?;

        Ok(HandlerResult::message(
            "方針として記録しました。検証のうえ、今後の判断に反映します。",
        )
        .with_data(json!({"teaching_id": id.to_string()})))
    }
}

use super::BatchHandler;
use crate::database::ProxyDatabase;
use crate::error::EngineResult;
use async_trait::async_trait;

/// Answers "does this proxy still have an owner" for many proxies at once
pub struct OwnershipVerifier {
    db: ProxyDatabase,
}

impl OwnershipVerifier {
    pub fn new(db: ProxyDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchHandler for OwnershipVerifier {
    type Request = i64;
    type Response = bool;

    fn name(&self) -> &'static str {
        "ownership-verifier"
    }

    async fn handle(&self, batch: &[i64]) -> EngineResult<Vec<bool>> {
        let mut ids = batch.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let owned = self.db.owned_proxies(&ids).await?;
        Ok(batch.iter().map(|id| owned.contains(id)).collect())
    }
}

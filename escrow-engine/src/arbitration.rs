//! Dispute arbitration - admin capability checks for resolving disputes

use crate::{
    error::EscrowError,
    escrow_engine::EscrowEngine,
    models::{ResolveAction, Transaction, TransactionId, UserId},
    EscrowResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Source of truth for administrative capability
#[async_trait::async_trait]
pub trait AdminRegistry: Send + Sync {
    async fn is_admin(&self, user_id: UserId) -> bool;
}

/// Fixed set of admin user ids, usually loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticAdminRegistry {
    admins: HashSet<UserId>,
}

impl StaticAdminRegistry {
    pub fn new<I: IntoIterator<Item = UserId>>(admins: I) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl AdminRegistry for StaticAdminRegistry {
    async fn is_admin(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id)
    }
}

/// Proof that a user passed the admin check. Only this module hands
/// these out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminIdentity {
    user_id: UserId,
}

impl AdminIdentity {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[cfg(test)]
    pub(crate) fn new_unchecked(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Resolves disputed transactions on behalf of admins
pub struct DisputeArbiter {
    engine: Arc<EscrowEngine>,
    registry: Arc<dyn AdminRegistry>,
}

impl DisputeArbiter {
    pub fn new(engine: Arc<EscrowEngine>, registry: Arc<dyn AdminRegistry>) -> Self {
        Self { engine, registry }
    }

    /// Check admin capability for `user_id`
    pub async fn authenticate(&self, user_id: UserId) -> EscrowResult<AdminIdentity> {
        if self.registry.is_admin(user_id).await {
            Ok(AdminIdentity { user_id })
        } else {
            warn!(user_id = %user_id, "non-admin attempted dispute resolution");
            Err(EscrowError::authorization("Admin access required"))
        }
    }

    /// Resolve a disputed transaction. The action must be exactly
    /// `release` or `refund`; it is validated before anything else.
    pub async fn resolve(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
        action: &str,
    ) -> EscrowResult<Transaction> {
        let action: ResolveAction = action.parse()?;
        let admin = self.authenticate(user_id).await?;
        self.engine.resolve(transaction_id, &admin, action).await
    }
}

use bursar_core::{TenantId, UserId};
use bursar_infra::OperationContext;

/// Tenant context for a request.
///
/// This is immutable and must be present for all ledger routes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// The staff member the upstream gateway authenticated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActorContext {
    user_id: UserId,
}

impl ActorContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}

/// Service context for one request, stamped with the current time.
pub fn operation(tenant: TenantContext, actor: ActorContext) -> OperationContext {
    OperationContext::new(tenant.tenant_id(), actor.user_id())
}

use std::sync::Arc;

use rolegate_contracts::RoleRequest;

use crate::collaborators::MembershipService;
use crate::error::ConversationError;

pub struct ActionExecutor {
    membership: Arc<dyn MembershipService>,
}

impl ActionExecutor {
    pub fn new(membership: Arc<dyn MembershipService>) -> Self {
        Self { membership }
    }

    pub async fn apply_approve(&self, request: &RoleRequest) -> Result<(), ConversationError> {
        tracing::info!(
            project = %request.project_name,
            user = %request.user_name,
            role = %request.role_name,
            "approving request"
        );
        self.membership
            .apply_approve(
                &request.project_name,
                &request.user_name,
                &request.role_name,
            )
            .await
    }

    pub async fn apply_deny(
        &self,
        request: &RoleRequest,
        reason: &str,
    ) -> Result<(), ConversationError> {
        tracing::info!(
            project = %request.project_name,
            user = %request.user_name,
            role = %request.role_name,
            "denying request"
        );
        self.membership
            .apply_deny(
                &request.project_name,
                &request.user_name,
                &request.role_name,
                reason,
            )
            .await
    }
}

use async_trait::async_trait;
use rolegate_contracts::{OutboundMessage, PolicyDocument};
use url::Url;

use crate::error::ConversationError;

#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_policy(&self, project_name: &str) -> Result<PolicyDocument, ConversationError>;
}

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, url: &Url) -> Result<String, ConversationError>;
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_message(&self, message: &OutboundMessage) -> Result<String, ConversationError>;
}

#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn apply_approve(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
    ) -> Result<(), ConversationError>;

    async fn apply_deny(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
        reason: &str,
    ) -> Result<(), ConversationError>;
}

#[async_trait]
pub trait OwnerNotifier: Send + Sync {
    async fn notify_owner(
        &self,
        project_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ConversationError>;
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rolegate_contracts::OutboundMessage;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::collaborators::{DocumentLoader, MailTransport, MembershipService, OwnerNotifier};
use crate::error::ConversationError;

fn client_with_timeout(timeout_ms: u64) -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| e.to_string())
}

pub struct HttpDocumentLoader {
    client: Client,
}

impl HttpDocumentLoader {
    pub fn new(timeout_ms: u64) -> Result<Self, String> {
        Ok(Self {
            client: client_with_timeout(timeout_ms)?,
        })
    }
}

#[async_trait]
impl DocumentLoader for HttpDocumentLoader {
    async fn load(&self, url: &Url) -> Result<String, ConversationError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ConversationError::Transport(format!("GET {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ConversationError::Transport(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ConversationError::Transport(format!("GET {url} body read failed: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct RelayReceipt {
    message_id: String,
}

pub struct HttpMailRelay {
    client: Client,
    endpoint: String,
}

impl HttpMailRelay {
    pub fn new(endpoint: &str, timeout_ms: u64) -> Result<Self, String> {
        Ok(Self {
            client: client_with_timeout(timeout_ms)?,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailRelay {
    async fn send_message(&self, message: &OutboundMessage) -> Result<String, ConversationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| ConversationError::Transport(format!("mail relay unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(ConversationError::Transport(format!(
                "mail relay returned {}",
                response.status()
            )));
        }
        let receipt: RelayReceipt = response.json().await.map_err(|e| {
            ConversationError::Transport(format!("mail relay receipt unreadable: {e}"))
        })?;
        if receipt.message_id.trim().is_empty() {
            return Err(ConversationError::Transport(
                "mail relay returned an empty message id".to_string(),
            ));
        }
        Ok(receipt.message_id)
    }
}

pub struct HttpMembershipService {
    client: Client,
    endpoint: String,
}

impl HttpMembershipService {
    pub fn new(endpoint: &str, timeout_ms: u64) -> Result<Self, String> {
        Ok(Self {
            client: client_with_timeout(timeout_ms)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), ConversationError> {
        let url = format!("{}{path}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConversationError::Service(format!("POST {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ConversationError::Service(format!(
                "POST {url} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipService for HttpMembershipService {
    async fn apply_approve(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
    ) -> Result<(), ConversationError> {
        self.post(
            "/v1/grants",
            json!({"project_name": project_name, "user_name": user_name, "role": role}),
        )
        .await
    }

    async fn apply_deny(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
        reason: &str,
    ) -> Result<(), ConversationError> {
        self.post(
            "/v1/declines",
            json!({
                "project_name": project_name,
                "user_name": user_name,
                "role": role,
                "reason": reason,
            }),
        )
        .await
    }
}

pub struct MailOwnerNotifier {
    mail: Arc<dyn MailTransport>,
    owner_address: String,
}

impl MailOwnerNotifier {
    pub fn new(mail: Arc<dyn MailTransport>, owner_address: &str) -> Self {
        Self {
            mail,
            owner_address: owner_address.to_string(),
        }
    }
}

#[async_trait]
impl OwnerNotifier for MailOwnerNotifier {
    async fn notify_owner(
        &self,
        project_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ConversationError> {
        let message = OutboundMessage {
            to: owner_address(&self.owner_address, project_name),
            subject: subject.to_string(),
            body: body.to_string(),
            in_reply_to: None,
        };
        self.mail.send_message(&message).await.map(|_| ())
    }
}

pub fn owner_address(template: &str, project_name: &str) -> String {
    template.replace("${project}", project_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl MailTransport for Outbox {
        async fn send_message(
            &self,
            message: &OutboundMessage,
        ) -> Result<String, ConversationError> {
            let mut sent = self.sent.lock().await;
            sent.push(message.clone());
            Ok(format!("<{}@outbox>", sent.len()))
        }
    }

    #[tokio::test]
    async fn owner_notifications_go_to_the_project_owner() {
        let outbox = Arc::new(Outbox::default());
        let notifier = MailOwnerNotifier::new(outbox.clone(), "${project}-owner@dev.java.net");
        notifier
            .notify_owner("glassfish", "failed", "policy missing")
            .await
            .unwrap();
        let sent = outbox.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "glassfish-owner@dev.java.net");
        assert_eq!(sent[0].subject, "failed");
        assert_eq!(sent[0].body, "policy missing");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RoleRequest {
    pub project_name: String,
    pub role_name: String,
    pub user_name: String,
    pub source_message_id: String,
}

impl RoleRequest {
    pub fn title(&self) -> String {
        format!(
            "{} role request from {} to {}",
            self.role_name, self.user_name, self.project_name
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Deny,
    Talk,
}

impl RuleAction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(RuleAction::Approve),
            "deny" => Some(RuleAction::Deny),
            "talk" => Some(RuleAction::Talk),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub roles: Vec<String>,
    pub action: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDocument {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplyEvent {
    pub reply_message_id: String,
    pub in_reply_to: String,
    pub from_address: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCommand {
    Approve,
    Deny,
    Unrecognized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approved,
    Denied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Init,
    Evaluating,
    AwaitingReply,
    Approved,
    Denied,
    Expired,
    Aborted,
}

impl ConversationState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (ConversationState::Init, ConversationState::Evaluating)
                | (ConversationState::Init, ConversationState::Aborted)
                | (ConversationState::Evaluating, ConversationState::Approved)
                | (ConversationState::Evaluating, ConversationState::Denied)
                | (ConversationState::Evaluating, ConversationState::AwaitingReply)
                | (ConversationState::Evaluating, ConversationState::Aborted)
                | (ConversationState::AwaitingReply, ConversationState::Approved)
                | (ConversationState::AwaitingReply, ConversationState::Denied)
                | (ConversationState::AwaitingReply, ConversationState::Expired)
                | (ConversationState::AwaitingReply, ConversationState::Aborted)
                | (ConversationState::Approved, ConversationState::Aborted)
                | (ConversationState::Denied, ConversationState::Aborted)
        )
    }

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            ConversationState::Approved
                | ConversationState::Denied
                | ConversationState::Expired
                | ConversationState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::Init => "init",
            ConversationState::Evaluating => "evaluating",
            ConversationState::AwaitingReply => "awaiting_reply",
            ConversationState::Approved => "approved",
            ConversationState::Denied => "denied",
            ConversationState::Expired => "expired",
            ConversationState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationFailure {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub conversation_id: String,
    pub title: String,
    pub request: RoleRequest,
    pub state: ConversationState,
    #[serde(default)]
    pub pending_message_id: Option<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub processed_reply_ids: BTreeSet<String>,
    #[serde(default)]
    pub failure: Option<ConversationFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(conversation_id: String, request: RoleRequest, now: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            title: request.title(),
            request,
            state: ConversationState::Init,
            pending_message_id: None,
            deadline: None,
            outcome: None,
            processed_reply_ids: BTreeSet::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            decided_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundMail {
    pub message_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyDisposition {
    Uncorrelated,
    Duplicate,
    Closed,
    Late,
    Unrecognized,
    Approved,
    Denied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyReceipt {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub disposition: ReplyDisposition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

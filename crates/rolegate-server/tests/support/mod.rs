#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rolegate_config::{
    Audit, Config, Conversation as ConversationSection, Mail, Membership, Policy, Server, Store,
};
use rolegate_contracts::{OutboundMessage, PolicyDocument, ReplyEvent, RoleRequest, Rule};
use rolegate_kernel::MatchMode;
use rolegate_server::audit::AuditJsonl;
use rolegate_server::collaborators::{
    MailTransport, MembershipService, OwnerNotifier, PolicySource,
};
use rolegate_server::store::StoreBackend;
use rolegate_server::{Clock, Collaborators, ConversationEngine, ConversationError, EngineSettings};
use tokio::sync::Mutex;

pub const OWNER_TEMPLATE: &str = "${project}-owner@dev.java.net";
pub const NO_RESPONSE: &str = "nobody answered";

pub fn temp_path(prefix: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("{prefix}-{nanos}.{ext}"))
        .to_string_lossy()
        .to_string()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct StaticPolicy {
    documents: std::sync::Mutex<HashMap<String, PolicyDocument>>,
    pub fetches: Mutex<usize>,
}

impl StaticPolicy {
    pub fn set(&self, project: &str, rules: Vec<Rule>) {
        self.documents
            .lock()
            .unwrap()
            .insert(project.to_string(), PolicyDocument { rules });
    }
}

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn fetch_policy(&self, project_name: &str) -> Result<PolicyDocument, ConversationError> {
        *self.fetches.lock().await += 1;
        self.documents
            .lock()
            .unwrap()
            .get(project_name)
            .cloned()
            .ok_or_else(|| {
                ConversationError::Transport(format!("no policy file for {project_name}"))
            })
    }
}

#[derive(Default)]
pub struct Outbox {
    pub sent: Mutex<Vec<OutboundMessage>>,
    pub fail: AtomicBool,
}

impl Outbox {
    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for Outbox {
    async fn send_message(&self, message: &OutboundMessage) -> Result<String, ConversationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConversationError::Transport("relay down".to_string()));
        }
        let mut sent = self.sent.lock().await;
        sent.push(message.clone());
        Ok(format!("<out-{}@rolegate.test>", sent.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipCall {
    Approve {
        project: String,
        user: String,
        role: String,
    },
    Deny {
        project: String,
        user: String,
        role: String,
        reason: String,
    },
}

#[derive(Default)]
pub struct RecordingMembership {
    pub calls: Mutex<Vec<MembershipCall>>,
    pub fail: AtomicBool,
}

impl RecordingMembership {
    pub async fn calls(&self) -> Vec<MembershipCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl MembershipService for RecordingMembership {
    async fn apply_approve(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
    ) -> Result<(), ConversationError> {
        self.calls.lock().await.push(MembershipCall::Approve {
            project: project_name.to_string(),
            user: user_name.to_string(),
            role: role.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConversationError::Service("grant rejected".to_string()));
        }
        Ok(())
    }

    async fn apply_deny(
        &self,
        project_name: &str,
        user_name: &str,
        role: &str,
        reason: &str,
    ) -> Result<(), ConversationError> {
        self.calls.lock().await.push(MembershipCall::Deny {
            project: project_name.to_string(),
            user: user_name.to_string(),
            role: role.to_string(),
            reason: reason.to_string(),
        });
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConversationError::Service("decline rejected".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notes: Mutex<Vec<(String, String, String)>>,
}

impl RecordingNotifier {
    pub async fn notes(&self) -> Vec<(String, String, String)> {
        self.notes.lock().await.clone()
    }
}

#[async_trait]
impl OwnerNotifier for RecordingNotifier {
    async fn notify_owner(
        &self,
        project_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), ConversationError> {
        self.notes.lock().await.push((
            project_name.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

pub struct Fakes {
    pub policy: Arc<StaticPolicy>,
    pub outbox: Arc<Outbox>,
    pub membership: Arc<RecordingMembership>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(StaticPolicy::default()),
            outbox: Arc::new(Outbox::default()),
            membership: Arc::new(RecordingMembership::default()),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(ManualClock::at(t0())),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            policy: self.policy.clone(),
            mail: self.outbox.clone(),
            membership: self.membership.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        }
    }
}

pub fn settings(match_mode: MatchMode) -> EngineSettings {
    EngineSettings {
        reply_timeout: chrono::Duration::hours(1),
        match_mode,
        no_response_message: NO_RESPONSE.to_string(),
        owner_address: OWNER_TEMPLATE.to_string(),
    }
}

pub async fn engine_with(
    fakes: &Fakes,
    settings: EngineSettings,
    store: StoreBackend,
    audit_path: &str,
) -> ConversationEngine {
    let audit = Arc::new(AuditJsonl::new(audit_path).await.unwrap());
    ConversationEngine::new(settings, store, audit, fakes.collaborators())
}

pub async fn memory_engine(fakes: &Fakes) -> ConversationEngine {
    engine_with(
        fakes,
        settings(MatchMode::Line),
        StoreBackend::memory(),
        &temp_path("rolegate-audit", "jsonl"),
    )
    .await
}

pub fn request(source_message_id: &str) -> RoleRequest {
    RoleRequest {
        project_name: "glassfish".to_string(),
        role_name: "Observer".to_string(),
        user_name: "alice".to_string(),
        source_message_id: source_message_id.to_string(),
    }
}

pub fn rule(roles: &[&str], action: &str, body: &str) -> Rule {
    Rule {
        roles: roles.iter().map(|r| r.to_string()).collect(),
        action: action.to_string(),
        body: body.to_string(),
    }
}

pub fn reply(
    reply_message_id: &str,
    in_reply_to: &str,
    body: &str,
    received_at: DateTime<Utc>,
) -> ReplyEvent {
    ReplyEvent {
        reply_message_id: reply_message_id.to_string(),
        in_reply_to: in_reply_to.to_string(),
        from_address: "owner@glassfish.dev.java.net".to_string(),
        body: body.to_string(),
        received_at,
    }
}

pub fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        policy: Policy {
            url_template: "http://127.0.0.1:9/${project}/role-approval.policy".to_string(),
            max_redirects: 5,
            timeout_ms: 1000,
        },
        conversation: ConversationSection {
            reply_timeout_ms: 3_600_000,
            reply_match: "line".to_string(),
            no_response_message: NO_RESPONSE.to_string(),
        },
        mail: Mail {
            relay_endpoint: "http://127.0.0.1:9/v1/messages".to_string(),
            timeout_ms: 1000,
            owner_address: OWNER_TEMPLATE.to_string(),
        },
        membership: Membership {
            endpoint: "http://127.0.0.1:9".to_string(),
            timeout_ms: 1000,
        },
        audit: Audit {
            jsonl_path: temp_path("rolegate-audit", "jsonl"),
        },
    }
}

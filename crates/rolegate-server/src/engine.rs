use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rolegate_config::Config;
use rolegate_contracts::{
    Conversation, ConversationFailure, ConversationState, OutboundMessage, Outcome, ReplyCommand,
    ReplyDisposition, ReplyEvent, ReplyReceipt, RoleRequest,
};
use rolegate_kernel::{
    classify_reply, compose_clarification, confirmation_text, evaluate, stable_conversation_id,
    MatchMode, TemplateVars, Verdict,
};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::AbortHandle;

use crate::audit::{AuditJsonl, AuditRecord};
use crate::collaborators::{MailTransport, MembershipService, OwnerNotifier, PolicySource};
use crate::error::ConversationError;
use crate::executor::ActionExecutor;
use crate::http::owner_address;
use crate::store::StoreBackend;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct Collaborators {
    pub policy: Arc<dyn PolicySource>,
    pub mail: Arc<dyn MailTransport>,
    pub membership: Arc<dyn MembershipService>,
    pub notifier: Arc<dyn OwnerNotifier>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub reply_timeout: chrono::Duration,
    pub match_mode: MatchMode,
    pub no_response_message: String,
    pub owner_address: String,
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let reply_timeout = i64::try_from(cfg.conversation.reply_timeout_ms)
            .ok()
            .and_then(chrono::Duration::try_milliseconds)
            .ok_or_else(|| {
                format!(
                    "conversation.reply_timeout_ms={} is out of range",
                    cfg.conversation.reply_timeout_ms
                )
            })?;
        Ok(Self {
            reply_timeout,
            match_mode: MatchMode::from_name(&cfg.conversation.reply_match)
                .unwrap_or(MatchMode::Line),
            no_response_message: cfg.conversation.no_response_message.clone(),
            owner_address: cfg.mail.owner_address.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryDisposition {
    Unknown,
    NotAwaiting,
    NotYetDue,
    Denied,
    Expired,
    Failed,
}

#[derive(Clone)]
pub struct ConversationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    settings: EngineSettings,
    store: Mutex<StoreBackend>,
    audit: Arc<AuditJsonl>,
    policy: Arc<dyn PolicySource>,
    mail: Arc<dyn MailTransport>,
    notifier: Arc<dyn OwnerNotifier>,
    executor: ActionExecutor,
    clock: Arc<dyn Clock>,
    locks: Arc<std::sync::Mutex<LockMap>>,
    timers: Mutex<HashMap<String, AbortHandle>>,
    expiry_tx: mpsc::UnboundedSender<String>,
}

impl ConversationEngine {
    pub fn new(
        settings: EngineSettings,
        store: StoreBackend,
        audit: Arc<AuditJsonl>,
        collaborators: Collaborators,
    ) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            settings,
            store: Mutex::new(store),
            audit,
            policy: collaborators.policy,
            mail: collaborators.mail,
            notifier: collaborators.notifier,
            executor: ActionExecutor::new(collaborators.membership),
            clock: collaborators.clock,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            timers: Mutex::new(HashMap::new()),
            expiry_tx,
        });
        tokio::spawn(dispatch_expiries(Arc::downgrade(&inner), expiry_rx));
        Self { inner }
    }

    pub async fn conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, ConversationError> {
        self.load(conversation_id).await
    }

    pub async fn start(&self, request: RoleRequest) -> Result<Conversation, ConversationError> {
        let conversation_id = stable_conversation_id(&request.source_message_id);
        let _guard = self.lock_conversation(&conversation_id).await;

        if let Some(existing) = self.load(&conversation_id).await? {
            tracing::info!(
                conversation_id = %conversation_id,
                state = %existing.state,
                "role request already has a conversation"
            );
            self.record(AuditRecord::new(
                &conversation_id,
                "start",
                "idempotency_hit",
                existing.state.as_str(),
            ))
            .await;
            return Ok(existing);
        }

        let mut conv = Conversation::new(conversation_id.clone(), request, self.now());
        self.persist(&mut conv).await?;
        tracing::info!(conversation_id = %conversation_id, title = %conv.title, "started a conversation");
        self.record(AuditRecord::new(&conversation_id, "start", "ok", "created"))
            .await;

        set_state(&mut conv, ConversationState::Evaluating);
        self.persist(&mut conv).await?;

        match self.evaluate_and_act(&mut conv).await {
            Ok(()) => {}
            Err(ConversationError::Store(e)) => return Err(ConversationError::Store(e)),
            Err(err) => self.abort(&mut conv, err).await?,
        }
        Ok(conv)
    }

    pub async fn deliver_reply(&self, reply: ReplyEvent) -> Result<ReplyReceipt, ConversationError> {
        let found = {
            let store = self.inner.store.lock().await;
            store
                .find_by_pending_message(&reply.in_reply_to)
                .map_err(ConversationError::Store)?
        };
        let Some(conversation_id) = found else {
            tracing::info!(
                reply_message_id = %reply.reply_message_id,
                in_reply_to = %reply.in_reply_to,
                "reply does not correlate to any conversation"
            );
            return Ok(receipt(None, ReplyDisposition::Uncorrelated));
        };

        let _guard = self.lock_conversation(&conversation_id).await;
        let Some(mut conv) = self.load(&conversation_id).await? else {
            return Ok(receipt(None, ReplyDisposition::Uncorrelated));
        };

        let disposition = if conv.processed_reply_ids.contains(&reply.reply_message_id) {
            ReplyDisposition::Duplicate
        } else if conv.state != ConversationState::AwaitingReply {
            ReplyDisposition::Closed
        } else if conv.deadline.is_some_and(|d| reply.received_at > d) {
            ReplyDisposition::Late
        } else {
            self.handle_reply(&mut conv, &reply).await?
        };

        if matches!(
            disposition,
            ReplyDisposition::Duplicate | ReplyDisposition::Closed | ReplyDisposition::Late
        ) {
            tracing::info!(
                conversation_id = %conversation_id,
                reply_message_id = %reply.reply_message_id,
                disposition = ?disposition,
                "reply ignored"
            );
            self.record(
                AuditRecord::new(&conversation_id, "reply", "ignored", disposition_name(disposition))
                    .with_detail(reply.reply_message_id.clone()),
            )
            .await;
        }
        Ok(receipt(Some(conversation_id), disposition))
    }

    pub async fn expire(&self, conversation_id: &str) -> Result<ExpiryDisposition, ConversationError> {
        let _guard = self.lock_conversation(conversation_id).await;
        let Some(mut conv) = self.load(conversation_id).await? else {
            return Ok(ExpiryDisposition::Unknown);
        };
        if conv.state != ConversationState::AwaitingReply {
            self.inner.timers.lock().await.remove(conversation_id);
            return Ok(ExpiryDisposition::NotAwaiting);
        }

        let now = self.now();
        if let Some(deadline) = conv.deadline {
            if now < deadline {
                self.arm_deadline(conversation_id, deadline).await;
                return Ok(ExpiryDisposition::NotYetDue);
            }
        }
        self.inner.timers.lock().await.remove(conversation_id);

        if conv.processed_reply_ids.is_empty() {
            tracing::info!(conversation_id = %conversation_id, "no response before the deadline, denying the request");
            let reason = self.inner.settings.no_response_message.clone();
            return match self
                .decide(&mut conv, Outcome::Denied, Some(reason), "no_response")
                .await
            {
                Ok(()) => Ok(ExpiryDisposition::Denied),
                Err(ConversationError::Store(e)) => Err(ConversationError::Store(e)),
                Err(err) => {
                    self.abort(&mut conv, err).await?;
                    Ok(ExpiryDisposition::Failed)
                }
            };
        }

        // Replies arrived but none of them decided anything: leave the request
        // alone rather than deny someone the owner was already talking to.
        set_state(&mut conv, ConversationState::Expired);
        self.persist(&mut conv).await?;
        tracing::info!(
            conversation_id = %conversation_id,
            replies = conv.processed_reply_ids.len(),
            "deadline passed without a resolving reply, exiting"
        );
        self.record(AuditRecord::new(
            conversation_id,
            "deadline",
            "expired",
            "timeout_without_resolution",
        ))
        .await;
        Ok(ExpiryDisposition::Expired)
    }

    pub async fn recover(&self) -> Result<usize, ConversationError> {
        let open = {
            let store = self.inner.store.lock().await;
            store.list_open().map_err(ConversationError::Store)?
        };

        let mut resumed = 0usize;
        for stale in open {
            let conversation_id = stale.conversation_id;
            let _guard = self.lock_conversation(&conversation_id).await;
            let Some(mut conv) = self.load(&conversation_id).await? else {
                continue;
            };
            match conv.state {
                ConversationState::AwaitingReply => {
                    let deadline = conv.deadline.unwrap_or_else(|| self.now());
                    self.arm_deadline(&conversation_id, deadline).await;
                    tracing::info!(
                        conversation_id = %conversation_id,
                        deadline = %deadline.to_rfc3339(),
                        "resumed waiting for a reply"
                    );
                    resumed += 1;
                }
                ConversationState::Init | ConversationState::Evaluating => {
                    // The clarification message may or may not have gone out;
                    // starting over could send it twice.
                    let err = ConversationError::Interrupted(format!(
                        "process stopped while the conversation was {}",
                        conv.state
                    ));
                    self.abort(&mut conv, err).await?;
                }
                _ => {}
            }
        }
        Ok(resumed)
    }

    async fn evaluate_and_act(&self, conv: &mut Conversation) -> Result<(), ConversationError> {
        tracing::info!(conversation_id = %conv.conversation_id, "determining the rule");
        let policy = self
            .inner
            .policy
            .fetch_policy(&conv.request.project_name)
            .await?;
        let verdict = evaluate(
            &policy,
            &conv.request.role_name,
            &TemplateVars::from_request(&conv.request),
        )?;

        match verdict {
            Verdict::Approve => {
                self.decide(conv, Outcome::Approved, None, "policy_approve")
                    .await
            }
            Verdict::Deny { reason } => {
                self.decide(conv, Outcome::Denied, Some(reason), "policy_deny")
                    .await
            }
            Verdict::Talk { body } => self.open_dialogue(conv, &body).await,
        }
    }

    async fn open_dialogue(&self, conv: &mut Conversation, body: &str) -> Result<(), ConversationError> {
        let to = owner_address(&self.inner.settings.owner_address, &conv.request.project_name);
        let message = compose_clarification(body, &to, &conv.title);
        let timeout = self.inner.settings.reply_timeout;
        let deadline = self.now().checked_add_signed(timeout).ok_or_else(|| {
            ConversationError::Policy(format!(
                "reply timeout of {}ms puts the deadline out of range",
                timeout.num_milliseconds()
            ))
        })?;
        let message_id = self.inner.mail.send_message(&message).await?;

        conv.pending_message_id = Some(message_id.clone());
        conv.deadline = Some(deadline);
        set_state(conv, ConversationState::AwaitingReply);
        self.persist(conv).await?;

        tracing::info!(
            conversation_id = %conv.conversation_id,
            message_id = %message_id,
            to = %message.to,
            deadline = %deadline.to_rfc3339(),
            "clarification sent, waiting for a reply"
        );
        self.record(
            AuditRecord::new(&conv.conversation_id, "evaluate", "ok", "talk")
                .with_detail(message_id),
        )
        .await;
        self.arm_deadline(&conv.conversation_id, deadline).await;
        Ok(())
    }

    async fn handle_reply(
        &self,
        conv: &mut Conversation,
        reply: &ReplyEvent,
    ) -> Result<ReplyDisposition, ConversationError> {
        let command = classify_reply(&reply.body, self.inner.settings.match_mode);
        conv.processed_reply_ids
            .insert(reply.reply_message_id.clone());

        let (outcome, reason, reason_code) = match command {
            ReplyCommand::Unrecognized => {
                self.persist(conv).await?;
                tracing::info!(
                    conversation_id = %conv.conversation_id,
                    reply_message_id = %reply.reply_message_id,
                    from = %reply.from_address,
                    "reply carries no command, still waiting"
                );
                self.record(
                    AuditRecord::new(&conv.conversation_id, "reply", "ok", "unrecognized")
                        .with_detail(reply.reply_message_id.clone()),
                )
                .await;
                return Ok(ReplyDisposition::Unrecognized);
            }
            ReplyCommand::Approve => (Outcome::Approved, None, "reply_approve"),
            ReplyCommand::Deny => (Outcome::Denied, Some(reply.body.clone()), "reply_deny"),
        };

        tracing::info!(
            conversation_id = %conv.conversation_id,
            from = %reply.from_address,
            command = ?command,
            "deciding based on e-mail"
        );
        match self.decide(conv, outcome, reason, reason_code).await {
            Ok(()) => {
                self.confirm(conv, reply, command).await;
                Ok(match outcome {
                    Outcome::Approved => ReplyDisposition::Approved,
                    Outcome::Denied => ReplyDisposition::Denied,
                })
            }
            Err(ConversationError::Store(e)) => Err(ConversationError::Store(e)),
            Err(err) => {
                self.abort(conv, err).await?;
                Ok(ReplyDisposition::Failed)
            }
        }
    }

    async fn decide(
        &self,
        conv: &mut Conversation,
        outcome: Outcome,
        reason: Option<String>,
        reason_code: &str,
    ) -> Result<(), ConversationError> {
        if let Some(existing) = conv.outcome {
            tracing::warn!(
                conversation_id = %conv.conversation_id,
                existing = ?existing,
                "outcome already committed, not deciding again"
            );
            return Ok(());
        }
        conv.outcome = Some(outcome);
        conv.decided_at = Some(self.now());
        set_state(
            conv,
            match outcome {
                Outcome::Approved => ConversationState::Approved,
                Outcome::Denied => ConversationState::Denied,
            },
        );
        self.persist(conv).await?;
        self.cancel_deadline(&conv.conversation_id).await;
        self.record(AuditRecord::new(
            &conv.conversation_id,
            "decide",
            conv.state.as_str(),
            reason_code,
        ))
        .await;

        match outcome {
            Outcome::Approved => self.inner.executor.apply_approve(&conv.request).await,
            Outcome::Denied => {
                self.inner
                    .executor
                    .apply_deny(&conv.request, reason.as_deref().unwrap_or_default())
                    .await
            }
        }
    }

    async fn abort(&self, conv: &mut Conversation, err: ConversationError) -> Result<(), ConversationError> {
        tracing::error!(
            conversation_id = %conv.conversation_id,
            kind = err.kind(),
            error = %err,
            "conversation aborted"
        );
        conv.failure = Some(ConversationFailure {
            kind: err.kind().to_string(),
            detail: err.detail().to_string(),
        });
        set_state(conv, ConversationState::Aborted);
        self.persist(conv).await?;
        self.cancel_deadline(&conv.conversation_id).await;
        self.record(
            AuditRecord::new(&conv.conversation_id, "abort", "failed", err.kind())
                .with_detail(err.detail().to_string()),
        )
        .await;
        self.notify_failure(conv, &err).await;
        Ok(())
    }

    async fn notify_failure(&self, conv: &Conversation, err: &ConversationError) {
        let subject = format!("Failed to process the {}", conv.title);
        let mut body = format!("The {} could not be processed.\n\n{err}\n", conv.title);
        match conv.outcome {
            Some(outcome) => body.push_str(&format!(
                "\nThe request was {} but the membership service did not accept the change.\n",
                match outcome {
                    Outcome::Approved => "approved",
                    Outcome::Denied => "denied",
                }
            )),
            None => body.push_str("\nNo action was taken on the request.\n"),
        }
        if let Err(e) = self
            .inner
            .notifier
            .notify_owner(&conv.request.project_name, &subject, &body)
            .await
        {
            tracing::warn!(
                conversation_id = %conv.conversation_id,
                error = %e,
                "failed to notify the project owner"
            );
        }
    }

    async fn confirm(&self, conv: &Conversation, reply: &ReplyEvent, command: ReplyCommand) {
        let Some(text) = confirmation_text(command, &reply.from_address) else {
            return;
        };
        let message = OutboundMessage {
            to: reply.from_address.clone(),
            subject: format!("Re: {}", conv.title),
            body: text,
            in_reply_to: Some(reply.reply_message_id.clone()),
        };
        if let Err(e) = self.inner.mail.send_message(&message).await {
            tracing::warn!(
                conversation_id = %conv.conversation_id,
                error = %e,
                "failed to send the confirmation reply"
            );
        }
    }

    async fn arm_deadline(&self, conversation_id: &str, deadline: DateTime<Utc>) {
        let delay = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        let tx = self.inner.expiry_tx.clone();
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        let previous = self
            .inner
            .timers
            .lock()
            .await
            .insert(conversation_id.to_string(), handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn cancel_deadline(&self, conversation_id: &str) {
        if let Some(handle) = self.inner.timers.lock().await.remove(conversation_id) {
            handle.abort();
        }
    }

    async fn lock_conversation(&self, conversation_id: &str) -> ConversationLock {
        let lock = {
            let mut locks = self
                .inner
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(conversation_id.to_string())
                .or_default()
                .clone()
        };
        ConversationLock {
            conversation_id: conversation_id.to_string(),
            locks: self.inner.locks.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>, ConversationError> {
        let store = self.inner.store.lock().await;
        store
            .get_conversation(conversation_id)
            .map_err(ConversationError::Store)
    }

    async fn persist(&self, conv: &mut Conversation) -> Result<(), ConversationError> {
        conv.updated_at = self.now();
        let mut store = self.inner.store.lock().await;
        store
            .save_conversation(conv)
            .map_err(ConversationError::Store)
    }

    async fn record(&self, rec: AuditRecord) {
        self.inner.audit.append(rec).await;
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

// Holds one conversation's lock; the map entry goes away with the last holder.
struct ConversationLock {
    conversation_id: String,
    locks: Arc<std::sync::Mutex<LockMap>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in our guard; anything more is a waiter.
        let idle = locks
            .get(&self.conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            locks.remove(&self.conversation_id);
        }
    }
}

async fn dispatch_expiries(engine: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(conversation_id) = rx.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = ConversationEngine { inner };
        tokio::spawn(async move {
            if let Err(e) = engine.expire(&conversation_id).await {
                tracing::error!(conversation_id = %conversation_id, error = %e, "deadline handling failed");
            }
        });
    }
}

fn set_state(conv: &mut Conversation, next: ConversationState) {
    debug_assert!(
        conv.state.can_transition_to(next),
        "illegal transition {} -> {}",
        conv.state,
        next
    );
    conv.state = next;
}

fn receipt(conversation_id: Option<String>, disposition: ReplyDisposition) -> ReplyReceipt {
    ReplyReceipt {
        conversation_id,
        disposition,
    }
}

fn disposition_name(disposition: ReplyDisposition) -> &'static str {
    match disposition {
        ReplyDisposition::Uncorrelated => "uncorrelated",
        ReplyDisposition::Duplicate => "duplicate",
        ReplyDisposition::Closed => "closed",
        ReplyDisposition::Late => "late",
        ReplyDisposition::Unrecognized => "unrecognized",
        ReplyDisposition::Approved => "approved",
        ReplyDisposition::Denied => "denied",
        ReplyDisposition::Failed => "failed",
    }
}

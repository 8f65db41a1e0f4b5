pub mod mail;
pub mod policy;
pub mod reply;
pub mod template;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use mail::{compose_clarification, parse_role_request};
pub use policy::{evaluate, parse_policy_xml, policy_url, resolve_location, PolicyRoot, Verdict};
pub use reply::{classify_reply, confirmation_text, MatchMode};
pub use template::{render, TemplateVars};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("policy error: {0}")]
    Policy(String),
    #[error("invalid location: {0}")]
    Location(String),
}

pub fn stable_conversation_id(source_message_id: &str) -> String {
    hash_id("conv", &[source_message_id])
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

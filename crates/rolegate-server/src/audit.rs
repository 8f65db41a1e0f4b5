use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditRecord {
    audit_id: String,
    conversation_id: String,
    stage: String,
    result: String,
    reason_code: String,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl AuditRecord {
    pub fn new(conversation_id: &str, stage: &str, result: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            conversation_id: conversation_id.to_string(),
            stage: stage.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            detail: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // Hash of the record as written with an empty record_hash.
    fn seal(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.record_hash.clear();
        Ok(hash_hex(serde_json::to_string(&unsealed)?.as_bytes()))
    }
}

impl AuditJsonl {
    pub async fn new(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    pub async fn append(&self, mut rec: AuditRecord) {
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        match rec.seal() {
            Ok(hash) => rec.record_hash = hash,
            Err(e) => {
                tracing::warn!(error = %e, "audit record serialization failed");
                return;
            }
        }

        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "audit record serialization failed");
                return;
            }
        };

        use tokio::io::AsyncWriteExt;
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => *last_hash = Some(rec.record_hash),
            Err(e) => tracing::warn!(error = %e, "audit append failed"),
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    format!("{:x}", Sha256::digest(input))
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut last_hash: Option<String> = None;
    let mut verified = 0usize;

    let records = text
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line))
        .filter(|(_, line)| !line.trim().is_empty());
    for (line_no, line) in records {
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {line_no}: unreadable audit record: {e}"))?;
        if verified > 0 && rec.prev_hash != last_hash {
            return Err(format!(
                "line {line_no}: chain broken, prev_hash {:?} does not follow {:?}",
                rec.prev_hash, last_hash
            ));
        }
        let sealed = rec
            .seal()
            .map_err(|e| format!("line {line_no}: cannot recompute hash: {e}"))?;
        if sealed != rec.record_hash {
            return Err(format!(
                "line {line_no}: record {} was altered after it was written",
                rec.audit_id
            ));
        }
        last_hash = Some(rec.record_hash);
        verified += 1;
    }

    Ok(format!("audit chain verified: {verified} records"))
}

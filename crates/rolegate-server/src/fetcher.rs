use std::sync::Arc;

use async_trait::async_trait;
use rolegate_contracts::PolicyDocument;
use rolegate_kernel::{parse_policy_xml, policy_url, resolve_location, PolicyRoot};

use crate::collaborators::{DocumentLoader, PolicySource};
use crate::error::ConversationError;

pub struct PolicyFetcher {
    loader: Arc<dyn DocumentLoader>,
    url_template: String,
    max_redirects: usize,
}

impl PolicyFetcher {
    pub fn new(loader: Arc<dyn DocumentLoader>, url_template: &str, max_redirects: usize) -> Self {
        Self {
            loader,
            url_template: url_template.to_string(),
            max_redirects,
        }
    }
}

#[async_trait]
impl PolicySource for PolicyFetcher {
    async fn fetch_policy(&self, project_name: &str) -> Result<PolicyDocument, ConversationError> {
        let mut url = policy_url(&self.url_template, project_name)?;
        let mut hops = 0usize;
        loop {
            tracing::info!(project = project_name, %url, "fetching policy file");
            let text = self.loader.load(&url).await?;
            match parse_policy_xml(&text)? {
                PolicyRoot::Document(doc) => return Ok(doc),
                PolicyRoot::Redirect(location) => {
                    if hops >= self.max_redirects {
                        return Err(ConversationError::Transport(format!(
                            "policy redirect chain longer than {} hops at {url}",
                            self.max_redirects
                        )));
                    }
                    hops += 1;
                    url = resolve_location(&url, &location)?;
                    tracing::info!(project = project_name, %url, hops, "policy redirected");
                }
            }
        }
    }
}

//! Web search handler, adapted from the teacher's `WebSearchTool` (Brave
//! Search API). Unlike the teacher's companion `WebFetchTool`, this handler
//! only searches — it returns result titles/URLs/snippets and does not
//! fetch and extract page text.

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::{Capability, IndexedListContext, IndexedListKind};

pub struct WebHandler {
    client: Client,
    api_key: String,
    max_results: u32,
}

impl WebHandler {
    pub fn new(api_key: String, max_results: u32) -> Self {
        Self {
            client: Client::builder().timeout(std::time::Duration::from_secs(15)).build().unwrap_or_else(|_| Client::new()),
            api_key,
            max_results,
        }
    }
}

#[derive(Deserialize)]
struct BraveSearchResponse {
    web: Option<BraveWebResults>,
}

#[derive(Deserialize)]
struct BraveWebResults {
    results: Vec<BraveWebResult>,
}

#[derive(Deserialize)]
struct BraveWebResult {
    title: String,
    url: String,
    description: Option<String>,
}

#[async_trait::async_trait]
impl HandlerAction for WebHandler {
    fn route(&self) -> &str {
        "web"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        if self.api_key.is_empty() {
            return Err(ExecutionError::Permanent("web search is not configured (missing API key)".into()));
        }

        debug!(query = %ctx.text, "performing web search");

        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("Accept", "application/json")
            .header("Accept-Encoding", "gzip")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", ctx.text.as_str()), ("count", &self.max_results.to_string())])
            .send()
            .await
            .map_err(|e| ExecutionError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.is_server_error() {
                ExecutionError::Transient(format!("search api error ({status})"))
            } else {
                ExecutionError::Permanent(format!("search api error ({status})"))
            });
        }

        let data: BraveSearchResponse = response.json().await.map_err(|e| ExecutionError::Transient(e.to_string()))?;
        let results = data.web.map(|w| w.results).unwrap_or_default();

        if results.is_empty() {
            return Ok(ExecutionResult { reply_text: Some("No encontré resultados.".into()), ..Default::default() });
        }

        let reply = results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("{}. {}\n   {}\n   {}", i + 1, r.title, r.url, r.description.as_deref().unwrap_or("")))
            .collect::<Vec<_>>()
            .join("\n\n");

        let items_json = serde_json::to_value(results.iter().map(|r| (r.title.clone(), r.url.clone())).collect::<Vec<_>>())
            .unwrap_or(serde_json::Value::Null);

        Ok(ExecutionResult {
            reply_text: Some(reply),
            indexed_list_update: Some(IndexedListContext { chat_id: ctx.chat_id, kind: IndexedListKind::WebResults, items_json, created_at_ms: 0 }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_is_permanent_not_transient() {
        let handler = WebHandler::new(String::new(), 5);
        assert_eq!(handler.route(), "web");
    }
}

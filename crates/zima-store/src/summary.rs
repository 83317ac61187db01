//! Compaction summaries.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use zima_core::{Message, Role};

const FIRST_REQUEST_MAX_CHARS: usize = 200;

/// Produces the text that replaces a compacted message prefix.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Deterministic digest built from the messages themselves. Also the
/// fallback when another summarizer fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DigestSummarizer;

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        Ok(digest(messages))
    }
}

pub fn digest(messages: &[Message]) -> String {
    let mut roles: BTreeMap<&str, usize> = BTreeMap::new();
    let mut tools: BTreeMap<String, usize> = BTreeMap::new();
    let mut files: Vec<String> = Vec::new();
    let mut failed_results = 0usize;
    let mut first_request: Option<&str> = None;

    for msg in messages {
        *roles.entry(msg.role.as_str()).or_default() += 1;
        if first_request.is_none() && msg.role == Role::User && !msg.content.trim().is_empty() {
            first_request = Some(msg.content.trim());
        }
        for call in &msg.tool_calls {
            *tools.entry(call.name.clone()).or_default() += 1;
            for key in ["file_path", "path", "output_path"] {
                if let Some(path) = call.arguments.get(key).and_then(|v| v.as_str()) {
                    files.push(path.to_string());
                }
            }
        }
        failed_results += msg.tool_results.iter().filter(|r| r.is_error).count();
    }
    files.sort();
    files.dedup();

    let role_counts: Vec<String> = roles.iter().map(|(r, n)| format!("{r}: {n}")).collect();
    let mut summary = format!(
        "Summary of {} earlier messages ({})\n",
        messages.len(),
        role_counts.join(", ")
    );
    if let Some(request) = first_request {
        summary.push_str(&format!(
            "First request: {}\n",
            truncate(request, FIRST_REQUEST_MAX_CHARS)
        ));
    }
    if !tools.is_empty() {
        let used: Vec<String> = tools
            .iter()
            .map(|(name, n)| if *n > 1 { format!("{name} ({n})") } else { name.clone() })
            .collect();
        summary.push_str(&format!("Tools used: {}\n", used.join(", ")));
    }
    if !files.is_empty() {
        summary.push_str(&format!("Files touched: {}\n", files.join(", ")));
    }
    if failed_results > 0 {
        summary.push_str(&format!("Failed tool results: {failed_results}\n"));
    }
    summary
}

fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let cut: String = single_line.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use zima_core::{ToolCallRecord, ToolResultRecord};

    #[test]
    fn digest_lists_roles_tools_and_files() {
        let messages = vec![
            Message::user("Create an excel file with product data"),
            Message::assistant("Creating it now").with_tool_call(ToolCallRecord {
                id: "c1".to_string(),
                name: "create_excel".to_string(),
                arguments: json!({"file_path": "products.xlsx"}),
            }),
            Message::assistant("Writing a copy").with_tool_call(ToolCallRecord {
                id: "c2".to_string(),
                name: "create_excel".to_string(),
                arguments: json!({"file_path": "products_v2.xlsx"}),
            }),
            Message::user("thanks"),
        ];
        let text = digest(&messages);
        assert!(text.starts_with("Summary of 4 earlier messages (assistant: 2, user: 2)"));
        assert!(!text.contains("Failed tool results"));
        assert!(text.contains("First request: Create an excel file with product data"));
        assert!(text.contains("Tools used: create_excel (2)"));
        assert!(text.contains("Files touched: products.xlsx, products_v2.xlsx"));
    }

    #[test]
    fn digest_counts_failed_tool_results() {
        let result = |call_id: &str, is_error: bool| ToolResultRecord {
            call_id: call_id.to_string(),
            output: "out".to_string(),
            is_error,
        };
        let messages = vec![
            Message::assistant("")
                .with_tool_result(result("c1", true))
                .with_tool_result(result("c2", false)),
            Message::assistant("").with_tool_result(result("c3", true)),
        ];
        assert!(digest(&messages).contains("Failed tool results: 2"));
    }

    #[test]
    fn first_request_is_truncated() {
        let long = "x".repeat(500);
        let text = digest(&[Message::user(long)]);
        let line = text.lines().nth(1).expect("first request line");
        assert_eq!(line.len(), "First request: ".len() + FIRST_REQUEST_MAX_CHARS + 3);
    }
}

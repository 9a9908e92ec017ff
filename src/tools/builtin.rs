use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::{Value, json};

use super::ResultProcessingMode;
use super::platform::{PlatformFunction, PlatformTool};

/// Reports the current time. Result goes back to the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockTool;

#[async_trait]
impl PlatformTool for ClockTool {
    fn id(&self) -> &str {
        "clock"
    }

    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current date and time."
    }

    fn functions(&self) -> Vec<PlatformFunction> {
        vec![PlatformFunction::new(
            "currentTime",
            "Get the current date and time, optionally shifted to a UTC offset.",
            json!({
                "type": "object",
                "properties": {
                    "utcOffsetMinutes": {
                        "type": "integer",
                        "description": "Offset from UTC in minutes (e.g. 120 for UTC+2). Defaults to 0."
                    }
                }
            }),
        )]
    }

    async fn call(&self, function_id: &str, args: Value) -> anyhow::Result<Value> {
        if function_id != "currentTime" {
            anyhow::bail!("clock has no function '{function_id}'");
        }

        // Gateway query arguments arrive as strings.
        let minutes = match &args["utcOffsetMinutes"] {
            Value::Null => 0,
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| anyhow::anyhow!("utcOffsetMinutes must be an integer"))?,
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("utcOffsetMinutes must be an integer: {e}"))?,
            other => anyhow::bail!("utcOffsetMinutes must be an integer, got {other}"),
        };

        let offset = i32::try_from(minutes * 60)
            .ok()
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| anyhow::anyhow!("utcOffsetMinutes out of range: {minutes}"))?;

        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "iso8601": now.to_rfc3339(),
            "unixSeconds": now.timestamp(),
            "utcOffsetMinutes": minutes,
        }))
    }
}

/// Renders rows as a Markdown table shown directly to the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownTableTool;

#[async_trait]
impl PlatformTool for MarkdownTableTool {
    fn id(&self) -> &str {
        "markdown"
    }

    fn name(&self) -> &str {
        "markdown"
    }

    fn description(&self) -> &str {
        "Markdown rendering helpers."
    }

    fn functions(&self) -> Vec<PlatformFunction> {
        vec![
            PlatformFunction::new(
                "renderTable",
                "Render tabular data as a Markdown table and show it to the user.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "columns": { "type": "array", "items": { "type": "string" } },
                        "rows": {
                            "type": "array",
                            "items": { "type": "array", "items": {} }
                        }
                    },
                    "required": ["columns", "rows"]
                }),
            )
            .with_mode(ResultProcessingMode::RenderMarkdown),
        ]
    }

    async fn call(&self, function_id: &str, args: Value) -> anyhow::Result<Value> {
        if function_id != "renderTable" {
            anyhow::bail!("markdown has no function '{function_id}'");
        }

        let columns: Vec<String> = args["columns"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Missing columns"))?
            .iter()
            .map(cell)
            .collect();
        if columns.is_empty() {
            anyhow::bail!("columns must not be empty");
        }
        let rows = args["rows"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Missing rows"))?;

        let mut out = String::new();
        if let Some(title) = args["title"].as_str().filter(|t| !t.is_empty()) {
            out.push_str("### ");
            out.push_str(title);
            out.push_str("\n\n");
        }
        out.push_str(&table_line(&columns));
        out.push_str(&table_line(&vec!["---".to_string(); columns.len()]));
        for row in rows {
            let mut cells: Vec<String> = match row {
                Value::Array(items) => items.iter().map(cell).collect(),
                other => vec![cell(other)],
            };
            cells.resize(columns.len(), String::new());
            out.push_str(&table_line(&cells));
        }

        Ok(Value::String(out))
    }
}

fn cell(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.replace('|', "\\|").replace('\n', " ")
}

fn table_line(cells: &[String]) -> String {
    format!("| {} |\n", cells.join(" | "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_accepts_string_offset() {
        let result = ClockTool
            .call("currentTime", json!({"utcOffsetMinutes": "120"}))
            .await
            .unwrap();
        assert_eq!(result["utcOffsetMinutes"], 120);
        assert!(result["iso8601"].as_str().unwrap().ends_with("+02:00"));
    }

    #[tokio::test]
    async fn test_clock_rejects_bad_offset() {
        assert!(
            ClockTool
                .call("currentTime", json!({"utcOffsetMinutes": 100_000}))
                .await
                .is_err()
        );
        assert!(ClockTool.call("other", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_render_table() {
        let result = MarkdownTableTool
            .call(
                "renderTable",
                json!({
                    "title": "Users",
                    "columns": ["id", "name"],
                    "rows": [[1, "a|b"], [2]]
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            result.as_str().unwrap(),
            "### Users\n\n| id | name |\n| --- | --- |\n| 1 | a\\|b |\n| 2 |  |\n"
        );
    }
}

//! Console event capture
//!
//! Converts CDP `Runtime.consoleAPICalled` events into compact records with
//! a bounded args preview. Redaction applies unless show-full-console is set.

use chromiumoxide_cdp::cdp::js_protocol::runtime::{
    ConsoleApiCalledType, EventConsoleApiCalled, RemoteObject,
};
use serde::Serialize;

use super::redact::redact_text;

const ARGS_PREVIEW_MAX: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleCategory {
    Log,
    Warning,
    Error,
    Debug,
    Trace,
    Assert,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleEvent {
    pub level: String,
    pub category: ConsoleCategory,
    pub text: String,
    pub args_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
}

/// Build a [`ConsoleEvent`] from the raw CDP event.
pub fn console_event_from_cdp(event: &EventConsoleApiCalled, show_full: bool) -> ConsoleEvent {
    let category = match event.r#type {
        ConsoleApiCalledType::Log | ConsoleApiCalledType::Info => ConsoleCategory::Log,
        ConsoleApiCalledType::Warning => ConsoleCategory::Warning,
        ConsoleApiCalledType::Error => ConsoleCategory::Error,
        ConsoleApiCalledType::Debug => ConsoleCategory::Debug,
        ConsoleApiCalledType::Trace => ConsoleCategory::Trace,
        ConsoleApiCalledType::Assert => ConsoleCategory::Assert,
        _ => ConsoleCategory::Other,
    };

    let raw_text = event.args.first().map(preview_remote_object).unwrap_or_default();
    let raw_preview = {
        let joined =
            event.args.iter().map(preview_remote_object).collect::<Vec<_>>().join(" ");
        truncate_chars(&joined, ARGS_PREVIEW_MAX)
    };

    let (text, args_preview) = if show_full {
        (raw_text, raw_preview)
    } else {
        (redact_text(&raw_text), redact_text(&raw_preview))
    };

    let top_frame = event.stack_trace.as_ref().and_then(|st| st.call_frames.first());

    ConsoleEvent {
        level: format!("{:?}", event.r#type).to_lowercase(),
        category,
        text,
        args_preview,
        source: top_frame.map(|f| f.url.clone()).filter(|u| !u.is_empty()),
        line: top_frame.map(|f| f.line_number),
        column: top_frame.map(|f| f.column_number),
    }
}

fn preview_remote_object(obj: &RemoteObject) -> String {
    if let Some(value) = &obj.value {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    } else if let Some(description) = &obj.description {
        description.clone()
    } else {
        format!("[{:?}]", obj.r#type).to_lowercase()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_safe() {
        let long = "x".repeat(500);
        assert_eq!(truncate_chars(&long, 240).len(), 240);
        let short = "hello";
        assert_eq!(truncate_chars(short, 240), "hello");
    }
}

//! Page exception capture
//!
//! Records `Runtime.exceptionThrown` events as-is; the driver already owns
//! what detail is exposed, so no redaction is applied here.

use chromiumoxide_cdp::cdp::js_protocol::runtime::EventExceptionThrown;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ExceptionEvent {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

pub fn exception_event_from_cdp(event: &EventExceptionThrown) -> ExceptionEvent {
    let details = &event.exception_details;

    let name = details
        .exception
        .as_ref()
        .and_then(|e| e.class_name.clone())
        .unwrap_or_else(|| "Error".to_string());

    let message = details
        .exception
        .as_ref()
        .and_then(|e| e.description.clone())
        .unwrap_or_else(|| details.text.clone());

    let stack = details.stack_trace.as_ref().map(|st| {
        st.call_frames
            .iter()
            .map(|f| {
                format!(
                    "    at {} ({}:{}:{})",
                    if f.function_name.is_empty() { "<anonymous>" } else { &f.function_name },
                    f.url,
                    f.line_number,
                    f.column_number
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    });

    ExceptionEvent { name, message, stack }
}

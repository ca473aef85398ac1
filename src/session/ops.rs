//! Target-scoped operations
//!
//! Every operation here runs inside the scheduler's per-target critical
//! section: same-target calls are strictly FIFO, cross-target calls run in
//! parallel under the governor cap. Navigation-grade operations double as
//! blocker verifiers and reconcile the FSM from fresh evidence.

use chromiumoxide::{Element, Page};
use chromiumoxide_cdp::cdp::browser_protocol::dom::{GetDocumentParams, Node};
use chromiumoxide_cdp::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide_cdp::cdp::browser_protocol::page::CaptureScreenshotParams;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{OpOutcome, Session, SessionBroker, SessionMode};
use crate::blocker::{EvidenceSource, NavEvidence, ReconcileRecord, target_key};
use crate::error::{BrokerError, DriverErrorKind, Result, classify_driver_error};
use crate::ids::{SessionId, TargetId};
use crate::refs::RefEntry;
use crate::request_id::RequestId;
use crate::targets::TargetInfo;
use crate::trackers::NetworkPhase;

/// One retry after this pause when an extension frame detaches mid-call.
const DETACHED_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Recent-network window consulted when building blocker evidence.
const EVIDENCE_WINDOW: usize = 100;

const DEFAULT_OP_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GotoResult {
    pub requested_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResult {
    pub text: String,
    pub ref_count: usize,
    pub truncated: bool,
}

impl SessionBroker {
    /// Open a new tab. In extension mode where tab creation is denied, the
    /// active tab is reused instead of failing.
    pub async fn new_target(
        &self,
        session_id: SessionId,
        url: Option<String>,
        name: Option<String>,
    ) -> Result<OpOutcome<TargetId>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let open_url = url.unwrap_or_else(|| "about:blank".to_string());
        let created = {
            let guard = session.browser.lock().await;
            let browser = guard.as_ref().ok_or(BrokerError::SessionTerminated)?;
            browser.new_page(open_url.as_str()).await
        };

        let target = match created {
            Ok(page) => {
                let target = session.targets.register(page.clone(), name)?;
                super::listeners::attach_page_listeners(&session, target, &page).await;
                session.targets.set_active(target)?;
                target
            }
            Err(e) => {
                let message = e.to_string();
                if session.mode == SessionMode::ExtensionRelay
                    && classify_driver_error(&message)
                        == DriverErrorKind::TargetCreationNotAllowed
                {
                    debug!(session = %session_id, "target creation denied, reusing active tab");
                    session.targets.require_active()?
                } else {
                    return Err(crate::error::translate_driver_error(message));
                }
            }
        };

        Ok(OpOutcome {
            value: target,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// List targets, reconciling with the driver's page list first.
    pub async fn list_targets(
        &self,
        session_id: SessionId,
        include_urls: bool,
    ) -> Result<OpOutcome<Vec<TargetInfo>>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let driver_pages = {
            let guard = session.browser.lock().await;
            let browser = guard.as_ref().ok_or(BrokerError::SessionTerminated)?;
            browser
                .pages()
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?
        };
        for dropped in session.targets.sync(driver_pages) {
            session.refs.clear_target(dropped);
        }

        let value = session.targets.list(include_urls).await;
        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// Make a target active, by id or name.
    pub async fn use_target(
        &self,
        session_id: SessionId,
        selector: &str,
    ) -> Result<OpOutcome<TargetId>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let target = selector
            .parse::<TargetId>()
            .ok()
            .filter(|t| session.targets.contains(*t))
            .or_else(|| session.targets.resolve_name(selector))
            .ok_or_else(|| {
                BrokerError::InvalidInput(format!("no target matches '{selector}'"))
            })?;

        session.targets.set_active(target)?;
        if let Ok(page) = session.targets.page(target) {
            // Best effort: bring the tab to front.
            let _ = page.activate().await;
        }

        Ok(OpOutcome {
            value: target,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    pub fn set_target_name(
        &self,
        session_id: SessionId,
        target: TargetId,
        name: Option<String>,
    ) -> Result<()> {
        let session = self.session(session_id)?;
        match name {
            Some(name) => session.targets.set_name(target, name),
            None => session.targets.remove_name(target),
        }
    }

    pub fn list_named_targets(&self, session_id: SessionId) -> Result<Vec<(String, TargetId)>> {
        Ok(self.session(session_id)?.targets.list_named())
    }

    /// Close a target; the active pointer moves to the first remaining tab.
    pub async fn close_target(
        &self,
        session_id: SessionId,
        target: TargetId,
    ) -> Result<OpOutcome<()>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let page = session.targets.remove(target)?;
        session.refs.clear_target(target);
        if let Err(e) = page.close().await {
            debug!(%target, error = %e, "page close reported an error");
        }

        Ok(OpOutcome {
            value: (),
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// Navigate the target and classify the landing page.
    pub async fn goto(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        url: String,
        timeout_ms: u64,
    ) -> Result<OpOutcome<GotoResult>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();
        let timeout_ms = effective_timeout(timeout_ms);

        session.blocker.lock().begin_verifier();

        let session_for_exec = Arc::clone(&session);
        let url_for_exec = url.clone();
        let result = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                if session_for_exec.mode == SessionMode::ExtensionRelay {
                    ensure_frame_ready(&page, timeout_ms).await?;
                }

                let navigate = async {
                    run_with_detached_retry(&session_for_exec, || async {
                        page.goto(url_for_exec.as_str())
                            .await
                            .map(|_| ())
                            .map_err(|e| crate::error::translate_driver_error(e.to_string()))
                    })
                    .await?;
                    let _ = page.wait_for_navigation().await;
                    Ok::<_, BrokerError>(())
                };
                match tokio::time::timeout(Duration::from_millis(timeout_ms), navigate).await {
                    Ok(result) => result?,
                    Err(_) => return Err(BrokerError::Timeout(timeout_ms)),
                }

                session_for_exec.refs.clear_target(target);

                let final_url = page.url().await.ok().flatten();
                let title = page.get_title().await.ok().flatten();
                Ok(GotoResult { requested_url: url_for_exec, final_url, title })
            })
            .await;

        match result {
            Ok(value) => {
                let blocker = self.reconcile_navigation(
                    &session,
                    target,
                    &value.requested_url,
                    value.final_url.as_deref(),
                    value.title.as_deref(),
                    true,
                );
                Ok(OpOutcome {
                    value,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    request_id,
                    blocker,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for the target's pending navigation to settle. Verifier-grade.
    pub async fn wait_for_load(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        timeout_ms: u64,
    ) -> Result<OpOutcome<GotoResult>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();
        let timeout_ms = effective_timeout(timeout_ms);

        session.blocker.lock().begin_verifier();

        let session_for_exec = Arc::clone(&session);
        let result = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                let wait = page.wait_for_navigation();
                if tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await.is_err() {
                    return Err(BrokerError::Timeout(timeout_ms));
                }
                let final_url = page.url().await.ok().flatten();
                let title = page.get_title().await.ok().flatten();
                Ok(GotoResult {
                    requested_url: final_url.clone().unwrap_or_default(),
                    final_url,
                    title,
                })
            })
            .await;

        match result {
            Ok(value) => {
                let blocker = self.reconcile_navigation(
                    &session,
                    target,
                    &value.requested_url,
                    value.final_url.as_deref(),
                    value.title.as_deref(),
                    true,
                );
                Ok(OpOutcome {
                    value,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    request_id,
                    blocker,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until a ref from an earlier snapshot resolves to a live element.
    /// Success is verification-grade.
    pub async fn wait_for_ref(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        timeout_ms: u64,
    ) -> Result<OpOutcome<()>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();
        let timeout_ms = effective_timeout(timeout_ms);

        session.blocker.lock().begin_verifier();

        let session_for_exec = Arc::clone(&session);
        let ref_for_exec = ref_id.clone();
        let result = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let entry = session_for_exec.refs.resolve(target, &ref_for_exec)?;
                let page = session_for_exec.targets.page(target)?;
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                loop {
                    if page.find_element(entry.selector.as_str()).await.is_ok() {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(BrokerError::Timeout(timeout_ms));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await;

        match result {
            Ok(()) => {
                let final_url = match session.targets.page(target) {
                    Ok(page) => page.url().await.ok().flatten(),
                    Err(_) => None,
                };
                let blocker = self.reconcile_navigation(
                    &session,
                    target,
                    final_url.as_deref().unwrap_or(""),
                    final_url.as_deref(),
                    None,
                    true,
                );
                Ok(OpOutcome {
                    value: (),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    request_id,
                    blocker,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Capture a DOM snapshot and install fresh refs for the target.
    pub async fn snapshot(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
    ) -> Result<OpOutcome<SnapshotResult>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let max_nodes = session.config.snapshot.max_nodes;
        let max_chars = session.config.snapshot.max_chars;

        let session_for_exec = Arc::clone(&session);
        let value = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                let doc = page
                    .execute(GetDocumentParams { depth: Some(-1), pierce: Some(false) })
                    .await
                    .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;

                let mut builder = SnapshotBuilder::new(max_nodes, max_chars);
                builder.walk(&doc.root, 0, "", 0);
                let (text, refs, truncated) = builder.finish();
                let ref_count = refs.len();
                session_for_exec.refs.install_snapshot(target, refs);
                Ok(SnapshotResult { text, ref_count, truncated })
            })
            .await?;

        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// Screenshot the target viewport as JPEG.
    pub async fn screenshot(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
    ) -> Result<OpOutcome<Vec<u8>>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let session_for_exec = Arc::clone(&session);
        let value = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                page.screenshot(CaptureScreenshotParams::default())
                    .await
                    .map_err(|e| crate::error::translate_driver_error(e.to_string()))
            })
            .await?;

        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    pub async fn click(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, |element| async move {
            element
                .click()
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    pub async fn hover(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_page_element(session_id, target, ref_id, |page, element| async move {
            let point = element
                .clickable_point()
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            let params = DispatchMouseEventParams::builder()
                .r#type(DispatchMouseEventType::MouseMoved)
                .x(point.x)
                .y(point.y)
                .build()
                .map_err(BrokerError::InvalidInput)?;
            page.execute(params)
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    pub async fn press(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        key: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, move |element| async move {
            element
                .focus()
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            element
                .press_key(key.as_str())
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    pub async fn type_text(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        text: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, move |element| async move {
            element
                .click()
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            element
                .type_str(text.as_str())
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    pub async fn check(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<()>> {
        self.set_checked(session_id, target, ref_id, true).await
    }

    pub async fn uncheck(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<()>> {
        self.set_checked(session_id, target, ref_id, false).await
    }

    async fn set_checked(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        checked: bool,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, move |element| async move {
            let js = format!(
                "function() {{ this.checked = {checked}; this.dispatchEvent(new Event('change', {{bubbles: true}})); }}"
            );
            element
                .call_js_fn(js.as_str(), false)
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    /// Select an option value on a `<select>` element.
    pub async fn select(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        option_value: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, move |element| async move {
            let value = serde_json::to_string(&option_value)
                .map_err(|e| BrokerError::InvalidInput(e.to_string()))?;
            let js = format!(
                "function() {{ this.value = {value}; this.dispatchEvent(new Event('change', {{bubbles: true}})); }}"
            );
            element
                .call_js_fn(js.as_str(), false)
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    /// Scroll the viewport by a pixel delta.
    pub async fn scroll(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        dx: i64,
        dy: i64,
    ) -> Result<OpOutcome<()>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let session_for_exec = Arc::clone(&session);
        self.scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                page.evaluate(format!("window.scrollBy({dx}, {dy})"))
                    .await
                    .map(|_| ())
                    .map_err(|e| crate::error::translate_driver_error(e.to_string()))
            })
            .await?;

        Ok(OpOutcome {
            value: (),
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    pub async fn scroll_into_view(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<()>> {
        self.with_ref_element(session_id, target, ref_id, |element| async move {
            element
                .scroll_into_view()
                .await
                .map(|_| ())
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))
        })
        .await
    }

    pub async fn dom_get_text(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<Option<String>>> {
        self.with_ref_element(session_id, target, ref_id, |element| async move {
            let returns = element
                .call_js_fn("function() { return this.innerText; }", false)
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            Ok(returns.result.value.as_ref().and_then(|v| v.as_str().map(|s| s.to_string())))
        })
        .await
    }

    pub async fn dom_get_html(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<Option<String>>> {
        self.with_ref_element(session_id, target, ref_id, |element| async move {
            let returns = element
                .call_js_fn("function() { return this.outerHTML; }", false)
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            Ok(returns.result.value.as_ref().and_then(|v| v.as_str().map(|s| s.to_string())))
        })
        .await
    }

    pub async fn dom_get_attributes(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
    ) -> Result<OpOutcome<HashMap<String, String>>> {
        self.with_ref_element(session_id, target, ref_id, |element| async move {
            let js = "function() { const out = {}; for (const a of this.attributes) { out[a.name] = a.value; } return JSON.stringify(out); }";
            let returns = element
                .call_js_fn(js, false)
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
            let raw = returns
                .result
                .value
                .as_ref()
                .and_then(|v| v.as_str())
                .unwrap_or("{}")
                .to_string();
            serde_json::from_str(&raw)
                .map_err(|e| BrokerError::Driver(format!("bad attribute payload: {e}")))
        })
        .await
    }

    /// Capture the raw DOM tree of the target as a serializable structure.
    ///
    /// This is the delegation surface for page/component cloning: the
    /// React/CSS emitters consume this capture downstream.
    pub async fn dom_capture(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
    ) -> Result<OpOutcome<serde_json::Value>> {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let max_nodes = session.config.export.max_nodes;
        let session_for_exec = Arc::clone(&session);
        let value = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let page = session_for_exec.targets.page(target)?;
                let doc = page
                    .execute(GetDocumentParams { depth: Some(-1), pierce: Some(false) })
                    .await
                    .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
                Ok(capture_node(&doc.root, &mut 0, max_nodes))
            })
            .await?;

        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// Shared scaffold: resolve ref, enter the critical section, run `f`
    /// against the element with one detached-frame retry.
    async fn with_ref_element<T, F, Fut>(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        f: F,
    ) -> Result<OpOutcome<T>>
    where
        F: FnOnce(Element) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send,
        T: Send + 'static,
    {
        self.with_ref_page_element(session_id, target, ref_id, move |_page, element| {
            f(element)
        })
        .await
    }

    async fn with_ref_page_element<T, F, Fut>(
        &self,
        session_id: SessionId,
        target: Option<TargetId>,
        ref_id: String,
        f: F,
    ) -> Result<OpOutcome<T>>
    where
        F: FnOnce(Page, Element) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T>> + Send,
        T: Send + 'static,
    {
        let session = self.session(session_id)?;
        let target = resolve_target(&session, target)?;
        let request_id = RequestId::new();
        let started = Instant::now();

        let session_for_exec = Arc::clone(&session);
        let value = self
            .scheduler()
            .run_target_scoped(session_id, target, 0, move || async move {
                let entry = session_for_exec.refs.resolve(target, &ref_id)?;
                let page = session_for_exec.targets.page(target)?;
                run_with_detached_retry(&session_for_exec, move || {
                    let page = page.clone();
                    let entry = entry.clone();
                    let f = f.clone();
                    async move {
                        let element = find_ref_element(&page, &entry).await?;
                        f(page, element).await
                    }
                })
                .await
            })
            .await?;

        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// Build evidence from the landing state plus recent network traffic
    /// and reconcile the blocker FSM.
    fn reconcile_navigation(
        &self,
        session: &Arc<Session>,
        target: TargetId,
        url: &str,
        final_url: Option<&str>,
        title: Option<&str>,
        verifier: bool,
    ) -> Option<crate::blocker::BlockerMeta> {
        let mut evidence = NavEvidence::navigation(url);
        evidence.final_url = final_url.map(|s| s.to_string());
        evidence.title = title.map(|s| s.to_string());
        evidence.prompt_guard_enabled =
            session.config.security.prompt_injection_guard.enabled;

        let recent = session.network.poll(
            session.network.latest_seq().saturating_sub(EVIDENCE_WINDOW as u64),
            EVIDENCE_WINDOW,
        );
        let mut hosts = Vec::new();
        for event in &recent.events {
            if let Some(host) = &event.payload.host
                && !hosts.contains(host)
            {
                hosts.push(host.clone());
            }
            if event.payload.phase == NetworkPhase::Response
                && event.payload.resource_type.as_deref() == Some("document")
                && evidence.status.is_none()
            {
                evidence.status = event.payload.status;
            }
        }
        evidence.network_hosts = hosts;

        let patterns = session.fingerprint.lock().tier2.config().challenge_patterns.clone();
        evidence.matched_patterns = recent
            .events
            .iter()
            .filter_map(|e| {
                let url_lower = e.payload.url.to_ascii_lowercase();
                patterns.iter().find(|p| url_lower.contains(&p.to_ascii_lowercase())).cloned()
            })
            .collect();
        evidence.matched_patterns.dedup();

        let key = target_key(&target.to_string(), evidence.hostname().as_deref());
        let record = ReconcileRecord {
            evidence: Some(evidence),
            verifier,
            source: EvidenceSource::Navigation,
        };
        let mut fsm = session.blocker.lock();
        fsm.reconcile(&record, key.as_deref());
        fsm.meta_with_resolution()
    }
}

fn resolve_target(session: &Arc<Session>, target: Option<TargetId>) -> Result<TargetId> {
    match target {
        Some(target) if session.targets.contains(target) => Ok(target),
        Some(target) => Err(BrokerError::InvalidInput(format!("unknown target {target}"))),
        None => session.targets.require_active(),
    }
}

fn effective_timeout(timeout_ms: u64) -> u64 {
    if timeout_ms == 0 { DEFAULT_OP_TIMEOUT_MS } else { timeout_ms }
}

async fn find_ref_element(page: &Page, entry: &RefEntry) -> Result<Element> {
    page.find_element(entry.selector.as_str()).await.map_err(|e| {
        let message = e.to_string();
        if message.contains("Could not find node")
            || message.contains("no node found")
            || message.contains("does not exist")
        {
            BrokerError::UnknownRef(entry.selector.clone())
        } else {
            crate::error::translate_driver_error(message)
        }
    })
}

/// Run `f`, retrying once after a short pause when an extension frame
/// detaches underneath it. Non-extension sessions surface immediately.
async fn run_with_detached_retry<T, F, Fut>(session: &Arc<Session>, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Err(BrokerError::DetachedFrame(message))
            if session.mode == SessionMode::ExtensionRelay =>
        {
            debug!(error = %message, "frame detached, retrying once");
            tokio::time::sleep(DETACHED_RETRY_DELAY).await;
            f().await
        }
        other => other,
    }
}

/// Poll until the page's main frame answers, treating detached-frame
/// errors as retryable. Extension tabs attach asynchronously.
async fn ensure_frame_ready(page: &Page, timeout_ms: u64) -> Result<()> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match page.url().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let message = e.to_string();
                if classify_driver_error(&message) != DriverErrorKind::DetachedFrame {
                    return Err(crate::error::translate_driver_error(message));
                }
                if Instant::now() >= deadline {
                    return Err(BrokerError::ExtensionTargetReadyTimeout(timeout_ms));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

// =============================================================================
// Snapshot construction over the CDP DOM tree
// =============================================================================

const ELEMENT_NODE: i64 = 1;
const TEXT_NODE: i64 = 3;

const INTERESTING_TAGS: [&str; 16] = [
    "a", "button", "input", "select", "textarea", "form", "img", "h1", "h2", "h3", "h4", "h5",
    "h6", "label", "summary", "option",
];

struct SnapshotBuilder {
    max_nodes: usize,
    max_chars: usize,
    lines: Vec<String>,
    refs: HashMap<String, RefEntry>,
    next_ref: usize,
    chars: usize,
    truncated: bool,
}

impl SnapshotBuilder {
    fn new(max_nodes: usize, max_chars: usize) -> Self {
        Self {
            max_nodes,
            max_chars,
            lines: Vec::new(),
            refs: HashMap::new(),
            next_ref: 1,
            chars: 0,
            truncated: false,
        }
    }

    fn walk(&mut self, node: &Node, depth: usize, parent_path: &str, nth_of_type: usize) {
        if self.refs.len() >= self.max_nodes || self.chars >= self.max_chars {
            self.truncated = true;
            return;
        }

        if node.node_type == ELEMENT_NODE {
            let tag = node.node_name.to_ascii_lowercase();
            let attrs = attribute_map(node);
            let path = selector_for(&tag, &attrs, parent_path, nth_of_type);

            if INTERESTING_TAGS.contains(&tag.as_str()) || attrs.contains_key("role") {
                let ref_id = format!("e{}", self.next_ref);
                self.next_ref += 1;
                let line = render_line(depth, &ref_id, &tag, &attrs, node);
                self.chars += line.len();
                self.lines.push(line);
                self.refs.insert(
                    ref_id,
                    RefEntry {
                        selector: path.clone(),
                        backend_node_id: *node.backend_node_id.inner(),
                    },
                );
            }

            self.walk_children(node, depth + 1, &path);
        } else {
            self.walk_children(node, depth, parent_path);
        }
    }

    fn walk_children(&mut self, node: &Node, depth: usize, parent_path: &str) {
        let Some(children) = &node.children else {
            return;
        };
        let mut tag_counts: HashMap<String, usize> = HashMap::new();
        for child in children {
            let nth = if child.node_type == ELEMENT_NODE {
                let tag = child.node_name.to_ascii_lowercase();
                let count = tag_counts.entry(tag).or_insert(0);
                *count += 1;
                *count
            } else {
                0
            };
            self.walk(child, depth, parent_path, nth);
        }
    }

    fn finish(self) -> (String, HashMap<String, RefEntry>, bool) {
        (self.lines.join("\n"), self.refs, self.truncated)
    }
}

fn attribute_map(node: &Node) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(flat) = &node.attributes {
        for pair in flat.chunks(2) {
            if let [key, value] = pair {
                map.insert(key.clone(), value.clone());
            }
        }
    }
    map
}

fn selector_for(
    tag: &str,
    attrs: &HashMap<String, String>,
    parent_path: &str,
    nth_of_type: usize,
) -> String {
    // An id anchors the path and keeps selectors short and stable.
    if let Some(id) = attrs.get("id")
        && !id.is_empty()
        && !id.contains(char::is_whitespace)
    {
        return format!("#{id}");
    }
    let positional = if nth_of_type > 1 {
        format!("{tag}:nth-of-type({nth_of_type})")
    } else {
        tag.to_string()
    };
    if parent_path.is_empty() {
        positional
    } else {
        format!("{parent_path} > {positional}")
    }
}

fn render_line(
    depth: usize,
    ref_id: &str,
    tag: &str,
    attrs: &HashMap<String, String>,
    node: &Node,
) -> String {
    let mut parts = vec![format!("{}- {tag} [{ref_id}]", "  ".repeat(depth.min(12)))];
    for key in ["id", "name", "type", "href", "placeholder", "aria-label", "alt", "value"] {
        if let Some(value) = attrs.get(key) {
            let mut shown = value.clone();
            if shown.len() > 80 {
                shown.truncate(80);
            }
            parts.push(format!("{key}={shown}"));
        }
    }
    let text = direct_text(node);
    if !text.is_empty() {
        let mut shown = text;
        if shown.len() > 120 {
            shown.truncate(120);
        }
        parts.push(format!("\"{shown}\""));
    }
    parts.join(" ")
}

fn direct_text(node: &Node) -> String {
    let mut out = String::new();
    if let Some(children) = &node.children {
        for child in children {
            if child.node_type == TEXT_NODE {
                let trimmed = child.node_value.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
            }
        }
    }
    out
}

fn capture_node(node: &Node, count: &mut usize, max_nodes: usize) -> serde_json::Value {
    if *count >= max_nodes {
        return serde_json::Value::Null;
    }
    *count += 1;

    let children: Vec<serde_json::Value> = node
        .children
        .as_ref()
        .map(|kids| {
            kids.iter()
                .map(|k| capture_node(k, count, max_nodes))
                .filter(|v| !v.is_null())
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "tag": node.node_name.to_ascii_lowercase(),
        "nodeType": node.node_type,
        "backendNodeId": node.backend_node_id.inner(),
        "attributes": attribute_map(node),
        "text": if node.node_type == TEXT_NODE { Some(node.node_value.clone()) } else { None },
        "children": children,
    })
}

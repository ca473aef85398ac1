//! Per-page event listener wiring
//!
//! Each registered page gets listener tasks forwarding console, network,
//! and exception events into the session trackers, plus a frame-navigation
//! listener that invalidates snapshot refs when the top frame moves.
//! Listener tasks are collected on the session so disconnect can abort them
//! first, before anything else is torn down.

use chromiumoxide::Page;
use chromiumoxide_cdp::cdp::browser_protocol::network::{
    EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide_cdp::cdp::browser_protocol::page::EventFrameNavigated;
use chromiumoxide_cdp::cdp::js_protocol::runtime::{EventConsoleApiCalled, EventExceptionThrown};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Session;
use crate::fingerprint::SignalSource;
use crate::ids::TargetId;
use crate::request_id::RequestId;
use crate::trackers::{
    console_event_from_cdp, exception_event_from_cdp, request_event_from_cdp,
    response_event_from_cdp,
};

/// Attach all trackers and the ref-invalidation listener to one page.
pub(crate) async fn attach_page_listeners(session: &Arc<Session>, target: TargetId, page: &Page) {
    let mut tasks = Vec::with_capacity(4);

    let show_full_console = session.config.devtools.show_full_console;
    let show_full_urls = session.config.devtools.show_full_urls;

    match page.event_listener::<EventConsoleApiCalled>().await {
        Ok(mut events) => {
            let console = Arc::clone(&session.console);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    console.push(console_event_from_cdp(event.as_ref(), show_full_console));
                }
            }));
        }
        Err(e) => warn!(%target, error = %e, "could not attach console listener"),
    }

    match page.event_listener::<EventExceptionThrown>().await {
        Ok(mut events) => {
            let exceptions = Arc::clone(&session.exceptions);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    exceptions.push(exception_event_from_cdp(event.as_ref()));
                }
            }));
        }
        Err(e) => warn!(%target, error = %e, "could not attach exception listener"),
    }

    match page.event_listener::<EventRequestWillBeSent>().await {
        Ok(mut events) => {
            let network = Arc::clone(&session.network);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    network.push(request_event_from_cdp(event.as_ref(), show_full_urls));
                }
            }));
        }
        Err(e) => warn!(%target, error = %e, "could not attach request listener"),
    }

    match page.event_listener::<EventResponseReceived>().await {
        Ok(mut events) => {
            let network = Arc::clone(&session.network);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    network.push(response_event_from_cdp(event.as_ref(), show_full_urls));
                }
            }));
        }
        Err(e) => warn!(%target, error = %e, "could not attach response listener"),
    }

    // Top-frame navigation clears the target's snapshot refs. Child frame
    // navigations (parent id present) leave them intact.
    match page.event_listener::<EventFrameNavigated>().await {
        Ok(mut events) => {
            let session_weak = Arc::downgrade(session);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if event.frame.parent_id.is_none()
                        && let Some(session) = session_weak.upgrade()
                    {
                        debug!(%target, url = %event.frame.url, "top frame navigated, clearing refs");
                        session.refs.clear_target(target);
                    }
                }
            }));
        }
        Err(e) => warn!(%target, error = %e, "could not attach frame listener"),
    }

    session.listener_tasks.lock().extend(tasks);
}

/// Install the continuous fingerprint signal: every new network event is
/// applied through the shared watermarked apply function.
pub(crate) fn attach_network_signal(session: &Arc<Session>) {
    let session_weak = Arc::downgrade(session);
    let session_id = session.id;
    let request_id = RequestId::new();
    let subscription = session.network.subscribe(move |event| {
        if let Some(session) = session_weak.upgrade() {
            session.fingerprint.lock().apply_network_events(
                std::slice::from_ref(event),
                SignalSource::Continuous,
                &request_id,
                session_id,
            );
        }
    });
    *session.network_signal.lock() = Some(subscription);
}

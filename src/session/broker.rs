//! Session lifecycle
//!
//! Launch, connect, relay pairing, teardown. Teardown is ordered and
//! error-aggregating: every step runs, failures are collected, session
//! state is removed regardless, and the caller gets one error at the end.

use chromiumoxide::{Browser, Page};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::listeners::{attach_network_signal, attach_page_listeners};
use super::{Session, SessionMode};
use crate::blocker::BlockerFsm;
use crate::browser_profile::{
    cleanup_stale_lock, create_ephemeral_profile, is_singleton_lock_stale,
    persistent_profile_dir, remove_profile_dir,
};
use crate::browser_setup::{LaunchSpec, connect_browser, launch_browser};
use crate::config::BrokerConfig;
use crate::endpoint::validate_cdp_endpoint;
use crate::error::{BrokerError, Result, translate_driver_error};
use crate::fingerprint::FingerprintState;
use crate::governor::{GovernorState, HostSampler, ModeVariant};
use crate::ids::SessionId;
use crate::refs::RefStore;
use crate::relay::{OpsClient, OpsEventKind, RelayPath, resolve_relay_endpoint};
use crate::scheduler::TargetScheduler;
use crate::targets::TargetRegistry;
use crate::trackers::EventTracker;

/// How long an extension session waits for its first page to appear.
const EXTENSION_PAGE_WAIT: Duration = Duration::from_secs(8);
const EXTENSION_PAGE_POLL: Duration = Duration::from_millis(250);

/// Race window for closing a non-managed browser on disconnect.
const CLOSE_BROWSER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct LaunchOpts {
    pub profile: Option<String>,
    pub headless: Option<bool>,
    pub persist_profile: Option<bool>,
    pub chrome_path: Option<std::path::PathBuf>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectOpts {
    /// CDP endpoint: ws(s) debugger URL or http(s) base exposing
    /// `/json/version`.
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct RelayConnectOpts {
    /// HTTP base URL of the local relay.
    pub base_url: String,
    /// Use the legacy `/cdp` passthrough instead of the ops protocol for
    /// page control.
    pub legacy_cdp: bool,
}

/// The broker: owns all sessions and the shared scheduler.
pub struct SessionBroker {
    config: BrokerConfig,
    sessions: dashmap::DashMap<SessionId, Arc<Session>>,
    scheduler: TargetScheduler,
}

impl SessionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config, sessions: dashmap::DashMap::new(), scheduler: TargetScheduler::new() }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &TargetScheduler {
        &self.scheduler
    }

    pub(crate) fn session(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BrokerError::InvalidSession(id.to_string()))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Launch a managed browser and open a session over it.
    pub async fn launch(&self, opts: LaunchOpts) -> Result<SessionId> {
        let headless = opts.headless.unwrap_or(self.config.headless);
        let persist = opts.persist_profile.unwrap_or(self.config.persist_profile);
        let profile_name = opts.profile.clone().or_else(|| self.config.profile.clone());

        let (profile_dir, owns_profile_dir) = if persist || profile_name.is_some() {
            let name = profile_name.as_deref().unwrap_or("default");
            let dir = persistent_profile_dir(name)
                .map_err(|e| BrokerError::InvalidInput(e.to_string()))?;
            // A crashed browser can leave its singleton lock behind; only a
            // live pid keeps the profile off-limits.
            if is_singleton_lock_stale(&dir)
                && let Err(e) = cleanup_stale_lock(&dir)
            {
                warn!(error = %e, "could not clean stale profile lock");
            }
            (dir, false)
        } else {
            let profile = create_ephemeral_profile()
                .map_err(|e| BrokerError::Driver(e.to_string()))?;
            (profile.into_path(), true)
        };

        let mut flags = self.config.flags.clone();
        flags.extend(opts.flags.iter().cloned());

        let spec = LaunchSpec {
            headless,
            chrome_path: opts.chrome_path.clone().or_else(|| self.config.chrome_path.clone()),
            user_data_dir: profile_dir.clone(),
            extra_flags: flags.clone(),
        };

        let (browser, handler_task) = match launch_browser(spec).await {
            Ok(pair) => pair,
            Err(e) => {
                let original = translate_driver_error(e.to_string());
                if owns_profile_dir {
                    if let Err(cleanup) = remove_profile_dir(&profile_dir).await {
                        return Err(BrokerError::CleanupFailed {
                            errors: vec![original.to_string(), cleanup.to_string()],
                        });
                    }
                }
                return Err(original);
            }
        };

        let variant = if headless {
            ModeVariant::ManagedHeadless
        } else {
            ModeVariant::ManagedHeaded
        };

        let session = match self
            .build_session(
                SessionMode::Managed,
                false,
                browser,
                handler_task,
                Some(profile_dir.clone()),
                owns_profile_dir,
                None,
                &flags,
                variant,
            )
            .await
        {
            Ok(session) => session,
            Err(original) => {
                if owns_profile_dir
                    && let Err(cleanup) = remove_profile_dir(&profile_dir).await
                {
                    return Err(BrokerError::CleanupFailed {
                        errors: vec![original.to_string(), cleanup.to_string()],
                    });
                }
                return Err(original);
            }
        };
        info!(session = %session.id, mode = "managed", headless, "session launched");
        Ok(session.id)
    }

    /// Attach to an already-running browser over a validated CDP endpoint.
    pub async fn connect(&self, opts: ConnectOpts) -> Result<SessionId> {
        let allow_non_local = self.config.security.allow_non_local_cdp;
        let endpoint = validate_cdp_endpoint(&opts.endpoint, allow_non_local)?;

        let ws_url = if matches!(endpoint.scheme(), "http" | "https") {
            let resolved = fetch_ws_debugger_url(endpoint.as_str()).await?;
            // The URL the browser hands back gets the same scrutiny.
            validate_cdp_endpoint(&resolved, allow_non_local)?.to_string()
        } else {
            endpoint.to_string()
        };

        let started = Instant::now();
        let (browser, handler_task) = connect_browser(&ws_url)
            .await
            .map_err(|e| translate_driver_error(e.to_string()))?;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "connected over CDP");

        let variant = if self.config.headless {
            ModeVariant::CdpConnectHeadless
        } else {
            ModeVariant::CdpConnectHeaded
        };

        let session = self
            .build_session(
                SessionMode::CdpConnect,
                false,
                browser,
                handler_task,
                None,
                false,
                None,
                &self.config.flags.clone(),
                variant,
            )
            .await?;
        info!(session = %session.id, mode = "cdp-connect", "session connected");
        Ok(session.id)
    }

    /// Connect through the extension relay.
    ///
    /// Page control always rides the relay's legacy `/cdp` passthrough so
    /// the driver surface stays uniform; the richer `/ops` channel is
    /// paired alongside for lease ownership and lifecycle events unless
    /// `legacy_cdp` asks for the CDP-only path.
    pub async fn connect_relay(&self, opts: RelayConnectOpts) -> Result<SessionId> {
        let cdp_endpoint = resolve_relay_endpoint(&opts.base_url, RelayPath::Cdp).await?;
        validate_cdp_endpoint(cdp_endpoint.url.as_str(), false)?;

        let started = Instant::now();
        let (browser, handler_task) = connect_browser(cdp_endpoint.url.as_str())
            .await
            .map_err(|e| match crate::error::classify_driver_error(&e.to_string()) {
                crate::error::DriverErrorKind::Unauthorized => BrokerError::RelayUnauthorized,
                _ => translate_driver_error(e.to_string()),
            })?;
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected to relay cdp path"
        );

        let ops_client = if opts.legacy_cdp {
            None
        } else {
            let ops_endpoint = resolve_relay_endpoint(&opts.base_url, RelayPath::Ops).await?;
            let (client, events) = OpsClient::connect(&ops_endpoint.url).await?;
            Some((Arc::new(client), events))
        };

        let variant = if opts.legacy_cdp {
            ModeVariant::ExtensionLegacyCdpHeaded
        } else {
            ModeVariant::ExtensionOpsHeaded
        };

        let (ops_client, ops_events) = match ops_client {
            Some((client, events)) => (Some(client), Some(events)),
            None => (None, None),
        };

        let session = self
            .build_session(
                SessionMode::ExtensionRelay,
                opts.legacy_cdp,
                browser,
                handler_task,
                None,
                false,
                ops_client,
                &self.config.flags.clone(),
                variant,
            )
            .await?;

        if let Some(mut events) = ops_events {
            let scheduler = self.scheduler.clone();
            let session_id = session.id;
            let task = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event.kind {
                        OpsEventKind::TabClosed => {
                            debug!(session = %session_id, "relay reported tab closed");
                            scheduler.note_lifecycle_signals(session_id, 1, 0);
                        }
                        OpsEventKind::SessionClosed | OpsEventKind::SessionExpired => {
                            warn!(session = %session_id, kind = ?event.kind, "relay session ended upstream");
                        }
                    }
                }
            });
            *session.ops_event_task.lock() = Some(task);
        }

        info!(session = %session.id, mode = "extension-relay", legacy = opts.legacy_cdp, "session connected via relay");
        Ok(session.id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_session(
        &self,
        mode: SessionMode,
        extension_legacy_cdp: bool,
        browser: Browser,
        handler_task: tokio::task::JoinHandle<()>,
        profile_dir: Option<std::path::PathBuf>,
        owns_profile_dir: bool,
        ops_client: Option<Arc<OpsClient>>,
        launch_flags: &[String],
        variant: ModeVariant,
    ) -> Result<Arc<Session>> {
        let id = SessionId::new();
        let trackers = &self.config.trackers;

        // Until the Session owns them, a failure here must release the
        // browser and its handler task before surfacing.
        let pages = match gather_initial_pages(&browser, mode).await {
            Ok(pages) => pages,
            Err(e) => {
                shutdown_browser(browser, handler_task).await;
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            id,
            mode,
            extension_legacy_cdp,
            config: self.config.clone(),
            browser: Mutex::new(Some(browser)),
            handler_task: PlMutex::new(Some(handler_task)),
            targets: TargetRegistry::new(),
            refs: RefStore::new(),
            console: Arc::new(EventTracker::new("console", trackers.console_capacity)),
            network: Arc::new(EventTracker::new("network", trackers.network_capacity)),
            exceptions: Arc::new(EventTracker::new("exception", trackers.exception_capacity)),
            blocker: PlMutex::new(BlockerFsm::new(
                self.config.blocker_detection_threshold,
                self.config.blocker_resolution_timeout_ms,
            )),
            fingerprint: PlMutex::new(FingerprintState::initialize(
                &self.config.fingerprint,
                launch_flags,
            )),
            profile_dir,
            owns_profile_dir,
            listener_tasks: PlMutex::new(Vec::new()),
            network_signal: PlMutex::new(None),
            ops_client,
            ops_event_task: PlMutex::new(None),
        });

        // Prefer a stable http(s) tab as the initial active target.
        let mut first_http: Option<usize> = None;
        for (index, page) in pages.iter().enumerate() {
            if first_http.is_none()
                && let Ok(Some(url)) = page.url().await
                && url.starts_with("http")
            {
                first_http = Some(index);
            }
        }

        let mut registered = Vec::new();
        for page in pages {
            let target = session.targets.register(page.clone(), None)?;
            attach_page_listeners(&session, target, &page).await;
            registered.push(target);
        }
        if let Some(index) = first_http
            && let Some(target) = registered.get(index)
        {
            session.targets.set_active(*target)?;
        }

        attach_network_signal(&session);

        let governor = GovernorState::new(variant, &self.config.parallelism);
        let sampler = HostSampler::new(self.config.parallelism.rss_budget_mb);
        self.scheduler.register_session(
            id,
            governor,
            self.config.parallelism.clone(),
            Some(Box::new(sampler)),
        );

        self.sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Disconnect a session.
    ///
    /// Cleanup order: page listeners, network signal, browser/context,
    /// tracker detach, profile dir. Errors are collected, state is removed
    /// regardless, and one error (direct or aggregated) surfaces at the end.
    pub async fn disconnect(&self, id: SessionId, close_browser: bool) -> Result<()> {
        let session = self.session(id)?;

        // Barrier first: reject waiters, stop admissions.
        self.scheduler.clear_session(id);

        let mut errors: Vec<String> = Vec::new();

        // 1. Per-page listeners.
        for task in session.listener_tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(task) = session.ops_event_task.lock().take() {
            task.abort();
        }

        // 2. Network-signal subscription.
        session.network_signal.lock().take();

        // 3. Browser / context close.
        let owned_browser = session.browser.lock().await.take();
        if let Some(mut browser) = owned_browser {
            let should_close = close_browser || session.mode == SessionMode::Managed;
            if should_close {
                if session.mode == SessionMode::Managed {
                    if let Err(e) = browser.close().await {
                        errors.push(format!("browser close: {e}"));
                    }
                    if let Err(e) = browser.wait().await {
                        errors.push(format!("browser wait: {e}"));
                    }
                } else {
                    // Remote browsers get a bounded close; a hung remote end
                    // must not wedge disconnect.
                    let close_fut = async {
                        let close_result = browser.close().await;
                        let _ = browser.wait().await;
                        close_result
                    };
                    match tokio::time::timeout(CLOSE_BROWSER_TIMEOUT, close_fut).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => errors.push(format!("browser close: {e}")),
                        Err(_) => {
                            warn!(session = %id, "browser close timed out, detaching");
                        }
                    }
                }
            }
        }
        if let Some(client) = &session.ops_client {
            client.close().await;
        }
        if let Some(task) = session.handler_task.lock().take() {
            task.abort();
        }

        // 4. Tracker detach: refs and names die with the session; nothing
        // polls these rings after removal.
        session.refs.clear_all();

        // 5. Profile dir removal for ephemeral sessions.
        if session.owns_profile_dir
            && let Some(dir) = &session.profile_dir
            && let Err(e) = remove_profile_dir(dir).await
        {
            errors.push(format!("profile removal: {e}"));
        }

        // State removal happens before any error is raised.
        self.sessions.remove(&id);
        info!(session = %id, errors = errors.len(), "session disconnected");

        match errors.len() {
            0 => Ok(()),
            1 => Err(BrokerError::Driver(errors.remove(0))),
            _ => Err(BrokerError::CleanupFailed { errors }),
        }
    }

    /// Disconnect every session, closing browsers, swallowing failures.
    pub async fn close_all(&self) {
        for id in self.session_ids() {
            if let Err(e) = self.disconnect(id, true).await {
                warn!(session = %id, error = %e, "ignoring disconnect failure during close_all");
            }
        }
    }

    /// Health probe: driver version round-trip.
    pub async fn ping(&self, id: SessionId) -> Result<String> {
        let session = self.session(id)?;
        let guard = session.browser.lock().await;
        let browser =
            guard.as_ref().ok_or(BrokerError::SessionTerminated)?;
        let version = browser
            .version()
            .await
            .map_err(|e| translate_driver_error(e.to_string()))?;
        Ok(version.product)
    }

    /// Explicit blocker verification failure (caller gave up or the
    /// environment cannot complete verification).
    pub fn mark_verification_failure(&self, id: SessionId, env_limited: bool) -> Result<()> {
        let session = self.session(id)?;
        session.blocker.lock().mark_verification_failure(env_limited);
        Ok(())
    }

    /// Operator override clearing any live blocker.
    pub fn clear_blocker(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        session.blocker.lock().clear_blocker();
        Ok(())
    }
}

#[cfg(test)]
impl SessionBroker {
    /// Register a hand-built session, bypassing the driver connect path.
    pub(crate) fn insert_session_for_tests(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }
}

async fn list_pages(browser: &Browser) -> Result<Vec<Page>> {
    browser.pages().await.map_err(|e| translate_driver_error(e.to_string()))
}

async fn gather_initial_pages(browser: &Browser, mode: SessionMode) -> Result<Vec<Page>> {
    let pages = list_pages(browser).await?;
    if !pages.is_empty() {
        return Ok(pages);
    }
    if mode == SessionMode::ExtensionRelay {
        wait_for_extension_page(browser).await
    } else {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| translate_driver_error(e.to_string()))?;
        Ok(vec![page])
    }
}

/// Best-effort release of a browser that never made it into a session.
async fn shutdown_browser(mut browser: Browser, handler_task: tokio::task::JoinHandle<()>) {
    if let Err(e) = browser.close().await {
        debug!(error = %e, "browser close during failed setup");
    }
    let _ = browser.wait().await;
    handler_task.abort();
}

async fn fetch_ws_debugger_url(base: &str) -> Result<String> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct VersionInfo {
        web_socket_debugger_url: String,
    }

    let url = format!("{}/json/version", base.trim_end_matches('/'));
    let info: VersionInfo = reqwest::get(&url)
        .await
        .map_err(|e| BrokerError::Driver(format!("could not reach {url}: {e}")))?
        .json()
        .await
        .map_err(|e| BrokerError::Driver(format!("invalid /json/version response: {e}")))?;
    Ok(info.web_socket_debugger_url)
}

async fn wait_for_extension_page(browser: &Browser) -> Result<Vec<Page>> {
    let deadline = Instant::now() + EXTENSION_PAGE_WAIT;
    loop {
        let pages = list_pages(browser).await?;
        if !pages.is_empty() {
            return Ok(pages);
        }
        if Instant::now() >= deadline {
            return Err(BrokerError::ExtensionTargetReadyTimeout(
                EXTENSION_PAGE_WAIT.as_millis() as u64,
            ));
        }
        tokio::time::sleep(EXTENSION_PAGE_POLL).await;
    }
}

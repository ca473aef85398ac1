//! Cookie validation and import
//!
//! Validation is a pure pass over the input records; nothing touches the
//! driver until every record has been judged. Strict mode refuses the whole
//! batch on any rejection, leaving the driver untouched.

use chromiumoxide_cdp::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, TimeSinceEpoch,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use super::{OpOutcome, SessionBroker};
use crate::error::{BrokerError, Result};
use crate::ids::SessionId;
use crate::request_id::RequestId;

static COOKIE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s;=]+$").expect("cookie name pattern compiles"));

/// Caller-supplied cookie record.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
    pub same_site: Option<String>,
    pub expires: Option<f64>,
}

/// A record that failed validation, with its input position.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRejection {
    pub index: usize,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieImportReport {
    pub imported: usize,
    pub rejected: Vec<CookieRejection>,
}

/// Validated, normalized cookie: carries either `url` or `(domain, path)`,
/// never both.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCookie {
    pub name: String,
    pub value: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    pub expires: Option<f64>,
}

/// Validate one record. Returns the normalized cookie or a rejection reason.
pub fn validate_cookie(record: &CookieRecord) -> std::result::Result<NormalizedCookie, String> {
    if record.name.is_empty() || !COOKIE_NAME.is_match(&record.name) {
        return Err(format!("invalid cookie name '{}'", record.name));
    }
    if record.value.contains(['\r', '\n', ';']) {
        return Err("cookie value contains CR/LF or ';'".to_string());
    }

    if record.url.is_none() && record.domain.is_none() {
        return Err("cookie requires url or domain".to_string());
    }

    if let Some(raw_url) = &record.url {
        let parsed =
            Url::parse(raw_url).map_err(|e| format!("invalid cookie url '{raw_url}': {e}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("cookie url must be http(s), got '{}'", parsed.scheme()));
        }
    }

    if let Some(domain) = &record.domain {
        if domain.contains("..") {
            return Err(format!("invalid cookie domain '{domain}'"));
        }
        if domain.is_empty() {
            return Err("cookie domain is empty".to_string());
        }
    }

    if let Some(path) = &record.path
        && !path.starts_with('/')
    {
        return Err(format!("cookie path '{path}' must start with '/'"));
    }

    if let Some(expires) = record.expires
        && (!expires.is_finite() || expires < -1.0)
    {
        return Err(format!("cookie expires {expires} must be finite and >= -1"));
    }

    let same_site = match record.same_site.as_deref() {
        None => None,
        Some(s) if s.eq_ignore_ascii_case("strict") => Some("Strict".to_string()),
        Some(s) if s.eq_ignore_ascii_case("lax") => Some("Lax".to_string()),
        Some(s) if s.eq_ignore_ascii_case("none") => Some("None".to_string()),
        Some(other) => return Err(format!("invalid sameSite '{other}'")),
    };

    let secure = record.secure.unwrap_or(false);
    if same_site.as_deref() == Some("None") && !secure {
        return Err("sameSite=None requires secure=true".to_string());
    }

    // Domain wins over url when both are present; the normalized cookie
    // never carries both.
    let (url, domain, path) = if let Some(domain) = &record.domain {
        (
            None,
            Some(domain.trim_start_matches('.').to_ascii_lowercase()),
            Some(record.path.clone().unwrap_or_else(|| "/".to_string())),
        )
    } else {
        (record.url.clone(), None, None)
    };

    Ok(NormalizedCookie {
        name: record.name.clone(),
        value: record.value.clone(),
        url,
        domain,
        path,
        secure,
        http_only: record.http_only.unwrap_or(false),
        same_site,
        expires: record.expires,
    })
}

fn to_cookie_param(cookie: &NormalizedCookie) -> CookieParam {
    let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
    param.url = cookie.url.clone();
    param.domain = cookie.domain.clone();
    param.path = cookie.path.clone();
    param.secure = Some(cookie.secure);
    param.http_only = Some(cookie.http_only);
    param.same_site = cookie.same_site.as_deref().map(|s| match s {
        "Strict" => CookieSameSite::Strict,
        "None" => CookieSameSite::None,
        _ => CookieSameSite::Lax,
    });
    param.expires = cookie.expires.map(TimeSinceEpoch::new);
    param
}

/// Readable view of a driver cookie.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieInfo {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub expires: f64,
}

impl SessionBroker {
    /// Import cookies into the session's browser.
    ///
    /// `strict` fails the whole call if any record is rejected, with zero
    /// driver side effects.
    pub async fn cookie_import(
        &self,
        session_id: SessionId,
        records: Vec<CookieRecord>,
        strict: bool,
    ) -> Result<OpOutcome<CookieImportReport>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = std::time::Instant::now();

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match validate_cookie(record) {
                Ok(normalized) => accepted.push(normalized),
                Err(reason) => {
                    rejected.push(CookieRejection { index, name: record.name.clone(), reason })
                }
            }
        }

        if strict && !rejected.is_empty() {
            info!(
                session = %session_id,
                request_id = %request_id,
                rejected = rejected.len(),
                "strict cookie import aborted"
            );
            let reasons: Vec<String> =
                rejected.iter().map(|r| format!("#{} {}: {}", r.index, r.name, r.reason)).collect();
            return Err(BrokerError::InvalidInput(format!(
                "cookie import rejected {} record(s): {}",
                rejected.len(),
                reasons.join("; ")
            )));
        }

        let imported = accepted.len();
        if !accepted.is_empty() {
            let params: Vec<CookieParam> = accepted.iter().map(to_cookie_param).collect();
            let target = session.targets.require_active()?;
            let page = session.targets.page(target)?;
            page.set_cookies(params)
                .await
                .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;
        }

        info!(
            session = %session_id,
            request_id = %request_id,
            imported,
            rejected = rejected.len(),
            "cookie import finished"
        );

        Ok(OpOutcome {
            value: CookieImportReport { imported, rejected },
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }

    /// List cookies visible to the active target.
    pub async fn cookie_list(
        &self,
        session_id: SessionId,
    ) -> Result<OpOutcome<Vec<CookieInfo>>> {
        let session = self.session(session_id)?;
        let request_id = RequestId::new();
        let started = std::time::Instant::now();

        let target = session.targets.require_active()?;
        let page = session.targets.page(target)?;
        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| crate::error::translate_driver_error(e.to_string()))?;

        let value = cookies
            .into_iter()
            .map(|c| CookieInfo {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
                expires: c.expires,
            })
            .collect();

        Ok(OpOutcome {
            value,
            elapsed_ms: started.elapsed().as_millis() as u64,
            request_id,
            blocker: session.blocker_meta(),
        })
    }
}

//! Cookie validation: the mixed-validity batch and normalization rules.

use tabmux::CookieRecord;
use tabmux::session::validate_cookie;

fn base_valid() -> CookieRecord {
    CookieRecord {
        name: "session".to_string(),
        value: "ok".to_string(),
        url: Some("https://example.com/path".to_string()),
        domain: Some("EXAMPLE.COM".to_string()),
        path: Some("/app".to_string()),
        secure: Some(true),
        same_site: Some("Lax".to_string()),
        expires: Some(123.0),
        ..Default::default()
    }
}

#[test]
fn mixed_batch_accepts_one_rejects_thirteen() {
    let mut records = vec![base_valid()];
    records.extend([
        CookieRecord { name: String::new(), ..base_valid() },
        CookieRecord { name: "has space".into(), ..base_valid() },
        CookieRecord { name: "has;semi".into(), ..base_valid() },
        CookieRecord { name: "has=eq".into(), ..base_valid() },
        CookieRecord { value: "line\nbreak".into(), ..base_valid() },
        CookieRecord { value: "semi;colon".into(), ..base_valid() },
        CookieRecord { url: None, domain: None, ..base_valid() },
        CookieRecord { url: Some("ftp://example.com/".into()), domain: None, ..base_valid() },
        CookieRecord { url: Some("garbage".into()), domain: None, ..base_valid() },
        CookieRecord { domain: Some("bad..domain".into()), ..base_valid() },
        CookieRecord { path: Some("relative".into()), ..base_valid() },
        CookieRecord { expires: Some(f64::NAN), ..base_valid() },
        CookieRecord { same_site: Some("None".into()), secure: Some(false), ..base_valid() },
    ]);
    assert_eq!(records.len(), 14);

    let mut imported = 0;
    let mut rejected = 0;
    for record in &records {
        match validate_cookie(record) {
            Ok(_) => imported += 1,
            Err(_) => rejected += 1,
        }
    }
    assert_eq!(imported, 1);
    assert_eq!(rejected, 13);
    assert_eq!(imported + rejected, records.len());
}

#[test]
fn normalization_prefers_domain_and_lowercases_it() {
    let cookie = validate_cookie(&base_valid()).expect("base record validates");
    // Never both: domain+path win, url is dropped.
    assert_eq!(cookie.url, None);
    assert_eq!(cookie.domain.as_deref(), Some("example.com"));
    assert_eq!(cookie.path.as_deref(), Some("/app"));
    assert!(cookie.secure);
    assert_eq!(cookie.same_site.as_deref(), Some("Lax"));
    assert_eq!(cookie.expires, Some(123.0));
}

#[test]
fn domain_only_record_defaults_path() {
    let record = CookieRecord { url: None, path: None, ..base_valid() };
    let cookie = validate_cookie(&record).expect("domain-only record validates");
    assert_eq!(cookie.path.as_deref(), Some("/"));
}

#[test]
fn url_only_record_carries_url_not_domain() {
    let record = CookieRecord { domain: None, path: None, ..base_valid() };
    let cookie = validate_cookie(&record).expect("url-only record validates");
    assert_eq!(cookie.url.as_deref(), Some("https://example.com/path"));
    assert_eq!(cookie.domain, None);
    assert_eq!(cookie.path, None);
}

#[test]
fn leading_dot_domains_are_normalized() {
    let record = CookieRecord { domain: Some(".Example.Com".into()), ..base_valid() };
    let cookie = validate_cookie(&record).expect("dotted domain validates");
    assert_eq!(cookie.domain.as_deref(), Some("example.com"));
}

#[test]
fn expires_minus_one_means_session_cookie() {
    let record = CookieRecord { expires: Some(-1.0), ..base_valid() };
    assert!(validate_cookie(&record).is_ok());
}

#[test]
fn samesite_none_with_secure_passes() {
    let record = CookieRecord {
        same_site: Some("none".into()),
        secure: Some(true),
        ..base_valid()
    };
    let cookie = validate_cookie(&record).expect("secure samesite=none validates");
    assert_eq!(cookie.same_site.as_deref(), Some("None"));
}

//! Cookie header helpers
//!
//! Every auth cookie is `HttpOnly; SameSite=Lax; Path=/`, plus `Secure`
//! when configured.

use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};

/// First value of the named cookie across all `Cookie` headers
pub fn get_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

/// `Set-Cookie` value for a cookie that lives until `expires_at`
pub fn build_cookie(
    name: &str,
    value: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    secure: bool,
) -> String {
    let max_age = (expires_at - now).num_seconds().max(0);
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}; Expires={}",
        name,
        value,
        max_age,
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the named cookie
pub fn clear_cookie(name: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
        name
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Append `Set-Cookie` headers, skipping any value that is not a valid
/// header.
///
/// A cookie the response already sets is left alone, so a handler's cookie
/// wins over one added by an outer middleware.
pub fn append_set_cookies(headers: &mut HeaderMap, cookies: &[String]) {
    for cookie in cookies {
        let name = cookie_name(cookie);
        let already_set = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|existing| cookie_name(existing) == name);
        if already_set {
            tracing::debug!(cookie = name, "Keeping Set-Cookie from inner handler");
            continue;
        }

        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Dropping invalid Set-Cookie value"),
        }
    }
}

fn cookie_name(set_cookie: &str) -> &str {
    set_cookie
        .split_once('=')
        .map_or(set_cookie, |(name, _)| name)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_get_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; sess=abc.def"));
        headers.append(header::COOKIE, HeaderValue::from_static("auth=x.y.z"));

        assert_eq!(get_cookie(&headers, "sess"), Some("abc.def"));
        assert_eq!(get_cookie(&headers, "auth"), Some("x.y.z"));
        assert_eq!(get_cookie(&headers, "ses"), None);
        assert_eq!(get_cookie(&HeaderMap::new(), "sess"), None);
    }

    #[test]
    fn test_build_cookie_attributes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let cookie = build_cookie("sess", "v", now + Duration::hours(2), now, false);

        assert!(cookie.starts_with("sess=v; Path=/; HttpOnly; SameSite=Lax"));
        assert!(cookie.contains("Max-Age=7200"));
        assert!(cookie.contains("Expires=Sun, 01 Mar 2026 14:00:00 GMT"));
        assert!(!cookie.contains("Secure"));

        let secure = build_cookie("sess", "v", now - Duration::hours(1), now, true);
        assert!(secure.contains("Max-Age=0"));
        assert!(secure.ends_with("; Secure"));
    }

    #[test]
    fn test_clear_cookie() {
        let cookie = clear_cookie("auth", false);
        assert!(cookie.starts_with("auth=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[test]
    fn test_append_keeps_existing_cookie() {
        let mut headers = HeaderMap::new();
        append_set_cookies(&mut headers, &[clear_cookie("sess", false)]);
        append_set_cookies(
            &mut headers,
            &["sess=new; Path=/".to_string(), "auth=x; Path=/".to_string()],
        );

        let values: Vec<&str> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert!(values[0].starts_with("sess=;"));
        assert_eq!(values[1], "auth=x; Path=/");
    }
}

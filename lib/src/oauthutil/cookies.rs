use axum::http::{HeaderMap, header};
use cookie::{Cookie, time::Duration};

pub const STATE_COOKIE: &str = "state";
pub const NONCE_COOKIE: &str = "nonce";

const MAX_AGE: Duration = Duration::hours(1);

/// An HTTP-only cookie scoped to `/` that lives for one hour.
pub fn flow_cookie(name: &str, value: &str, secure: bool) -> Cookie<'static> {
    Cookie::build((name.to_string(), value.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .max_age(MAX_AGE)
        .build()
}

/// Value of the first cookie named `name` across all `Cookie` headers.
pub fn find(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|raw| Cookie::parse(raw.trim()).ok())
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

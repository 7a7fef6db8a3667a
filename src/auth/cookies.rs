use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

use crate::config::CookieConfig;

pub const OAUTH_STATE_COOKIE: &str = "oauth_state";

/// HTTP-only cookie carrying the session token.
pub fn session_cookie(cfg: &CookieConfig, token: String, ttl: Duration) -> Cookie<'static> {
    Cookie::build((cfg.name.clone(), token))
        .path("/")
        .http_only(true)
        .secure(cfg.secure)
        .same_site(if cfg.secure { SameSite::None } else { SameSite::Lax })
        .max_age(ttl)
        .build()
}

/// Short-lived cookie binding an OAuth round trip to the browser that started it.
pub fn oauth_state_cookie(cfg: &CookieConfig, state: String) -> Cookie<'static> {
    Cookie::build((OAUTH_STATE_COOKIE, state))
        .path("/api/auth/google")
        .http_only(true)
        .secure(cfg.secure)
        .same_site(SameSite::Lax)
        .max_age(Duration::minutes(10))
        .build()
}

/// Expired cookie overwriting `name` in the browser; path must match the one used when setting.
///
/// Added to a jar rather than passed to `CookieJar::remove`, which only emits a removal for
/// cookies the request itself carried.
pub fn removal(name: String, path: &'static str) -> Cookie<'static> {
    let mut cookie = Cookie::build((name, "")).path(path).http_only(true).build();
    cookie.make_removal();
    cookie
}

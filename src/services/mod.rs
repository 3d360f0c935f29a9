//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the chat state machines and persistence concerns so
//! route handlers can stay focused on protocol translation and auth
//! plumbing. Room actors (`room`) compose the smaller pieces: membership
//! caches, typing state, delivery rules, and the store seam.

pub mod delivery;
pub mod membership;
pub mod presence;
pub mod registry;
pub mod room;
pub mod store;
pub mod typing;

/// Parse an env var, falling back to `default` when unset or malformed.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Sleep until `deadline`, or forever when there is none. Used as a
/// `select!` arm for optional timer wheels (typing expiry, presence grace).
pub(crate) async fn sleep_until_opt(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

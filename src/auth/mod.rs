use crate::state::AppState;
use axum::Router;

pub mod authenticators;
pub mod claims;
pub mod cookies;
mod dto;
pub mod extractors;
pub mod google;
pub mod handlers;
pub mod memory;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod resolver;
pub mod session;

pub fn router() -> Router<AppState> {
    Router::new().merge(handlers::auth_routes())
}

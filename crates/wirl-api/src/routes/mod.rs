pub mod health;
pub mod runs;
pub mod templates;
pub mod triggers;

use axum::Router;

use crate::state::AppState;

pub fn all(state: AppState) -> Router {
    Router::new()
        .merge(health::routes(state.clone()))
        .merge(templates::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(triggers::routes(state))
}

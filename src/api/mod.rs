pub mod addons;
pub mod builds;
pub mod deployments;
pub mod helpers;
pub mod projects;
pub mod releases;
pub mod services;

use axum::Router;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(projects::router())
        .merge(services::router())
        .merge(releases::router())
        .merge(deployments::router())
        .merge(addons::router())
        .merge(builds::router())
}

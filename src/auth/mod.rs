use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::state::AppState;

pub mod dto;
pub mod extractors;
pub mod handlers;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod reset;
pub mod tokens;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/signup", post(handlers::signup))
        .route("/users/login", post(handlers::login))
        .route("/users/logout", get(handlers::logout))
        .route("/users/forgot-password", post(handlers::forgot_password))
        .route(
            "/users/reset-password/:token",
            patch(handlers::reset_password),
        )
        .route("/users/update-password", patch(handlers::update_password))
        .route(
            "/users/me",
            get(handlers::me)
                .patch(handlers::update_me)
                .delete(handlers::deactivate_me),
        )
        // protect + restrict_to(admin) compose inside the handler chain.
        .route("/users", get(handlers::list_users))
}

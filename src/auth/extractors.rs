use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::auth::repo_types::{Principal, Role};
use crate::auth::tokens::TokenError;
use crate::error::ApiError;
use crate::state::AppState;

/// Session-token cookie name. Tokens are accepted from the Authorization
/// header first, then from this cookie.
pub const SESSION_COOKIE: &str = "jwt";

/// Route guard: verifies the bearer token, re-checks that the subject still
/// exists, and rejects tokens issued before the last password change. On
/// success the live principal is handed to the handler.
#[derive(Debug)]
pub struct CurrentUser(pub Principal);

fn token_from_parts(parts: &Parts) -> Option<String> {
    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    parts
        .headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_cookie_value)
}

fn session_cookie_value(raw_cookies: &str) -> Option<String> {
    raw_cookies
        .split(';')
        .map(str::trim)
        .find_map(|pair| {
            pair.strip_prefix(SESSION_COOKIE)
                .and_then(|rest| rest.strip_prefix('='))
        })
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or_else(|| {
            ApiError::Unauthenticated(
                "You are not logged in! Please log in to get access.".into(),
            )
        })?;

        let claims = state.keys.verify(&token).map_err(|e| {
            ApiError::Unauthenticated(
                match e {
                    TokenError::Expired => "Your token has expired! Please log in again.",
                    TokenError::Invalid => "Invalid token. Please log in again!",
                }
                .into(),
            )
        })?;

        // Token validity alone is not enough: the subject must still exist
        // (and be active), and the token must postdate the last credential
        // change.
        let principal = state.store.find_by_id(claims.sub).await?.ok_or_else(|| {
            ApiError::Unauthenticated(
                "The user belonging to this token does no longer exist.".into(),
            )
        })?;

        if principal.changed_password_after(claims.iat) {
            return Err(ApiError::Unauthenticated(
                "User recently changed password! Please log in again.".into(),
            ));
        }

        Ok(CurrentUser(principal))
    }
}

/// Role gate as a pure predicate over the attached principal; routes compose
/// it explicitly after `CurrentUser`.
pub fn restrict_to(
    allowed: &'static [Role],
) -> impl Fn(&Principal) -> Result<(), ApiError> + Clone + Send + Sync + 'static {
    move |principal| {
        if allowed.contains(&principal.role) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(
                "You do not have permission to perform this action.".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::NewPrincipal;
    use crate::auth::tokens::Claims;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    async fn seeded_state() -> (AppState, Principal) {
        let state = AppState::fake();
        let principal = state
            .store
            .create(NewPrincipal {
                name: "Ann".into(),
                email: "ann@example.com".into(),
                password_hash: "hash".into(),
                role: Role::User,
            })
            .await
            .unwrap()
            .unwrap();
        (state, principal)
    }

    fn parts_with_auth(value: Option<(&str, String)>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some((name, v)) = value {
            builder = builder.header(name, v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    /// Sign claims with the fake config secret, bypassing TokenKeys so tests
    /// can fabricate arbitrary issuance times.
    fn sign_raw(sub: Uuid, iat: OffsetDateTime, ttl: Duration) -> String {
        let claims = Claims {
            sub,
            iat: iat.unix_timestamp() as usize,
            exp: (iat + ttl).unix_timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let (state, _) = seeded_state().await;
        let mut parts = parts_with_auth(None);
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn bearer_header_attaches_principal() {
        let (state, principal) = seeded_state().await;
        let token = state.keys.issue(principal.id).unwrap();
        let mut parts = parts_with_auth(Some(("authorization", format!("Bearer {token}"))));
        let CurrentUser(attached) = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .expect("protect should pass");
        assert_eq!(attached.id, principal.id);
    }

    #[tokio::test]
    async fn session_cookie_is_accepted_as_fallback() {
        let (state, principal) = seeded_state().await;
        let token = state.keys.issue(principal.id).unwrap();
        let mut parts = parts_with_auth(Some(("cookie", format!("other=1; jwt={token}"))));
        let CurrentUser(attached) = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .expect("protect should pass");
        assert_eq!(attached.id, principal.id);
    }

    #[tokio::test]
    async fn garbage_token_is_unauthenticated() {
        let (state, _) = seeded_state().await;
        let mut parts = parts_with_auth(Some(("authorization", "Bearer nonsense".into())));
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn token_for_deleted_subject_is_rejected() {
        let (state, principal) = seeded_state().await;
        let token = state.keys.issue(principal.id).unwrap();
        state.store.deactivate(principal.id).await.unwrap();
        let mut parts = parts_with_auth(Some(("authorization", format!("Bearer {token}"))));
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn token_predating_password_change_is_rejected() {
        let (state, principal) = seeded_state().await;
        let old = sign_raw(
            principal.id,
            OffsetDateTime::now_utc() - Duration::minutes(10),
            Duration::hours(1),
        );
        state
            .store
            .update_password(principal.id, "new-hash", OffsetDateTime::now_utc())
            .await
            .unwrap();
        let mut parts = parts_with_auth(Some(("authorization", format!("Bearer {old}"))));
        let err = CurrentUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn restrict_to_gates_by_role() {
        let (_, principal) = seeded_state().await;
        let admins_only = restrict_to(&[Role::Admin]);
        assert!(matches!(
            admins_only(&principal),
            Err(ApiError::Forbidden(_))
        ));
        let mut admin = principal.clone();
        admin.role = Role::Admin;
        assert!(admins_only(&admin).is_ok());

        let staff = restrict_to(&[Role::Admin, Role::LeadGuide]);
        let mut lead = principal.clone();
        lead.role = Role::LeadGuide;
        assert!(staff(&lead).is_ok());
    }
}

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use crate::auth::dto::{
    AuthResponse, ForgotPasswordRequest, LoginRequest, MessageResponse, PublicUser,
    ResetPasswordRequest, SignupRequest, UpdateMeRequest, UpdatePasswordRequest, UserData,
    UserResponse, UsersData, UsersResponse,
};
use crate::auth::extractors::{restrict_to, CurrentUser, SESSION_COOKIE};
use crate::auth::password::{hash_password, verify_password};
use crate::auth::repo_types::{NewPrincipal, Principal, Role};
use crate::auth::reset::{hash_reset_token, ResetToken};
use crate::error::ApiError;
use crate::state::AppState;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn validate_new_password(password: &str, confirm: &str) -> Result<(), ApiError> {
    if password.len() < 8 {
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }
    if password != confirm {
        return Err(ApiError::Validation("Passwords do not match!".into()));
    }
    Ok(())
}

fn session_cookie(token: &str, max_age_secs: u64, secure: bool) -> String {
    format!(
        "{SESSION_COOKIE}={token}; Path=/; Max-Age={max_age_secs}; HttpOnly; SameSite=Lax{}",
        if secure { "; Secure" } else { "" }
    )
}

/// Issue a fresh token for `principal` and return it both in the body and as
/// the httpOnly session cookie.
fn send_token(
    state: &AppState,
    principal: &Principal,
    status: StatusCode,
) -> Result<Response, ApiError> {
    let token = state.keys.issue(principal.id)?;
    let cookie = session_cookie(
        &token,
        state.keys.ttl().as_secs(),
        state.config.jwt.cookie_secure,
    );
    let body = AuthResponse {
        status: "success".into(),
        token,
        data: UserData {
            user: principal.into(),
        },
    };
    Ok((status, [(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

#[instrument(skip(state, payload))]
pub async fn signup(
    State(state): State<AppState>,
    Json(mut payload): Json<SignupRequest>,
) -> Result<Response, ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if payload.name.trim().is_empty() {
        return Err(ApiError::Validation("Please tell us your name".into()));
    }
    if !is_valid_email(&payload.email) {
        return Err(ApiError::Validation("Please provide a valid email".into()));
    }
    validate_new_password(&payload.password, &payload.password_confirm)?;

    // Whatever the client asked for, new accounts start as plain users.
    if payload.role.is_some() {
        warn!(email = %payload.email, "client-supplied role ignored at signup");
    }

    let password_hash = hash_password(&payload.password)?;
    let principal = state
        .store
        .create(NewPrincipal {
            name: payload.name.trim().to_string(),
            email: payload.email.clone(),
            password_hash,
            role: Role::User,
        })
        .await?
        .ok_or_else(|| ApiError::Conflict("Email already registered".into()))?;

    info!(user_id = %principal.id, email = %principal.email, "user signed up");
    send_token(&state, &principal, StatusCode::CREATED)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    payload.email = payload.email.trim().to_lowercase();

    if payload.email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::Validation(
            "Please provide email and password".into(),
        ));
    }

    // One generic failure for "no such account" and "wrong password" so the
    // response cannot be used to probe for registered emails.
    let candidate = state.store.find_active_by_email(&payload.email).await?;
    let password_ok = match &candidate {
        Some(p) => verify_password(&payload.password, &p.password_hash)?,
        None => false,
    };
    let Some(principal) = candidate.filter(|_| password_ok) else {
        warn!(email = %payload.email, "failed login");
        return Err(ApiError::Unauthenticated(
            "Incorrect email or password".into(),
        ));
    };

    info!(user_id = %principal.id, "user logged in");
    send_token(&state, &principal, StatusCode::OK)
}

/// Stateless logout: overwrites the client cookie; nothing is invalidated
/// server-side.
pub async fn logout() -> Response {
    let cookie = format!("{SESSION_COOKIE}=loggedout; Path=/; Max-Age=10; HttpOnly");
    let body = MessageResponse {
        status: "success".into(),
        message: None,
    };
    (StatusCode::OK, [(header::SET_COOKIE, cookie)], Json(body)).into_response()
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let email = payload.email.trim().to_lowercase();

    // Deliberate product behavior: this 404 reveals whether the email is
    // registered. Do not "fix" it silently.
    let principal = state
        .store
        .find_active_by_email(&email)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound("There is no user with this email address.".into())
        })?;

    let reset = ResetToken::generate();
    let ttl_minutes = state.config.reset_ttl_minutes;
    let expires_at = OffsetDateTime::now_utc() + Duration::minutes(ttl_minutes);
    state
        .store
        .set_reset_token(principal.id, &reset.hash, expires_at)
        .await?;

    let reset_url = format!(
        "{}/api/v1/users/reset-password/{}",
        state.config.public_base_url, reset.raw
    );
    let subject = format!("Your password reset token (valid for {ttl_minutes} minutes)");
    let message = format!(
        "Forgot your password? Submit a PATCH request with your new password \
         and passwordConfirm to:\n{reset_url}\nIf you didn't forget your password, \
         please ignore this email."
    );

    if let Err(e) = state.mailer.send(&principal.email, &subject, &message).await {
        // Logged before the rollback: if clearing fails too, the live token
        // nobody was told about still shows up in the logs.
        error!(user_id = %principal.id, error = %e, "reset mail delivery failed");
        state.store.clear_reset_token(principal.id).await?;
        return Err(ApiError::Delivery(e));
    }

    info!(user_id = %principal.id, "password reset token dispatched");
    Ok(Json(MessageResponse {
        status: "success".into(),
        message: Some("Token sent to email!".into()),
    }))
}

#[instrument(skip(state, payload, raw_token))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(raw_token): Path<String>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Response, ApiError> {
    validate_new_password(&payload.password, &payload.password_confirm)?;

    let password_hash = hash_password(&payload.password)?;
    // Backdated one second so the fresh token issued below, with a
    // same-second iat, survives the invalidation check.
    let changed_at = OffsetDateTime::now_utc() - Duration::seconds(1);

    let principal = state
        .store
        .consume_reset_token(&hash_reset_token(&raw_token), &password_hash, changed_at)
        .await?
        .ok_or(ApiError::InvalidOrExpiredToken)?;

    info!(user_id = %principal.id, "password reset completed");
    send_token(&state, &principal, StatusCode::OK)
}

#[instrument(skip(state, user, payload))]
pub async fn update_password(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<UpdatePasswordRequest>,
) -> Result<Response, ApiError> {
    if !verify_password(&payload.password_current, &user.password_hash)? {
        return Err(ApiError::Unauthenticated(
            "Your current password is wrong.".into(),
        ));
    }
    validate_new_password(&payload.password, &payload.password_confirm)?;

    let password_hash = hash_password(&payload.password)?;
    let changed_at = OffsetDateTime::now_utc() - Duration::seconds(1);
    state
        .store
        .update_password(user.id, &password_hash, changed_at)
        .await?;

    info!(user_id = %user.id, "password updated");
    let refreshed = Principal {
        password_hash,
        password_changed_at: Some(changed_at),
        ..user
    };
    send_token(&state, &refreshed, StatusCode::OK)
}

#[instrument(skip(state, user, payload))]
pub async fn update_me(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<UpdateMeRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    // Password changes go through the route that re-checks the current
    // password; accepting them here would bypass that check.
    if payload.password.is_some() || payload.password_confirm.is_some() {
        return Err(ApiError::Validation(
            "This route is not for password updates. Please use /update-password.".into(),
        ));
    }

    let name = match payload.name {
        Some(n) => {
            let n = n.trim().to_string();
            if n.is_empty() {
                return Err(ApiError::Validation("Please tell us your name".into()));
            }
            Some(n)
        }
        None => None,
    };
    let email = match payload.email {
        Some(e) => {
            let e = e.trim().to_lowercase();
            if !is_valid_email(&e) {
                return Err(ApiError::Validation("Please provide a valid email".into()));
            }
            Some(e)
        }
        None => None,
    };

    let updated = state
        .store
        .update_profile(user.id, name.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| ApiError::Conflict("Email already registered".into()))?;

    info!(user_id = %updated.id, "profile updated");
    Ok(Json(UserResponse {
        status: "success".into(),
        data: UserData {
            user: PublicUser::from(&updated),
        },
    }))
}

pub async fn me(CurrentUser(user): CurrentUser) -> Json<UserResponse> {
    Json(UserResponse {
        status: "success".into(),
        data: UserData {
            user: PublicUser::from(&user),
        },
    })
}

#[instrument(skip(state, user))]
pub async fn deactivate_me(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<StatusCode, ApiError> {
    state.store.deactivate(user.id).await?;
    info!(user_id = %user.id, "account deactivated");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, user))]
pub async fn list_users(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<UsersResponse>, ApiError> {
    restrict_to(&[Role::Admin])(&user)?;

    let users: Vec<PublicUser> = state
        .store
        .list_active()
        .await?
        .iter()
        .map(PublicUser::from)
        .collect();
    Ok(Json(UsersResponse {
        status: "success".into(),
        results: users.len(),
        data: UsersData { users },
    }))
}

use std::future::Future;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, HeaderMap, Method, Request},
    middleware::Next,
    response::{AppendHeaders, IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::JwtConfig;
use crate::db::{self, models::Role, models::User};
use crate::error::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::routes::ValidJson;
use crate::AppState;

pub const AUTH_COOKIE_NAME: &str = "auth_token";

// Claims for our JWT
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub email: String,
    pub name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "User role {} is not authorized to access this route",
                self.role
            )))
        }
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let token = extract_token_from_headers(&parts.headers);
        let jwt = state.config.jwt.clone();
        async move {
            let token = token.ok_or_else(|| ApiError::Unauthorized("Missing auth token".to_string()))?;
            let claims = validate_token_str(&jwt, &token).map_err(|e| {
                tracing::debug!("Token error: {}", e);
                ApiError::Unauthorized("Invalid token".to_string())
            })?;

            Ok(AuthenticatedUser {
                id: claims.sub,
                email: claims.email,
                name: claims.name,
                role: claims.role,
            })
        }
    }
}

fn validation_for(jwt: &JwtConfig) -> Validation {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    if let Some(issuer) = &jwt.issuer {
        validation.set_issuer(&[issuer.as_str()]);
    }
    match &jwt.audience {
        Some(audience) => validation.set_audience(&[audience.as_str()]),
        None => validation.validate_aud = false,
    }
    validation
}

pub fn create_token(jwt: &JwtConfig, user: &User) -> anyhow::Result<String> {
    let expiration = Utc::now()
        .checked_add_signed(Duration::hours(jwt.ttl_hours))
        .ok_or_else(|| anyhow::anyhow!("token expiry overflow"))?
        .timestamp();

    let claims = Claims {
        sub: user.id.clone(),
        exp: expiration as usize,
        email: user.email.clone(),
        name: user.full_name.clone(),
        role: user.role,
        iss: jwt.issuer.clone(),
        aud: jwt.audience.clone(),
    };

    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(jwt.secret.as_bytes()))?;
    Ok(token)
}

pub fn validate_token_str(jwt: &JwtConfig, token: &str) -> anyhow::Result<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt.secret.as_bytes()),
        &validation_for(jwt),
    )?;
    Ok(data.claims)
}

/// Bearer header first, then the auth cookie.
pub fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    if let Some(cookie_header) = headers.get(header::COOKIE).and_then(|h| h.to_str().ok()) {
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some((k, v)) = cookie.split_once('=') {
                if k == AUTH_COOKIE_NAME && !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

fn build_auth_cookie(token: &str, jwt: &JwtConfig, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        AUTH_COOKIE_NAME,
        token,
        jwt.ttl_hours * 3600
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn clear_auth_cookie(secure: bool) -> String {
    let mut cookie = format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", AUTH_COOKIE_NAME);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Routes reachable without a token: sign-up/in and the public donation browse.
pub fn is_public_route(method: &Method, path: &str) -> bool {
    let Some(rest) = path.strip_prefix("/api/") else {
        return true;
    };
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    match segments.as_slice() {
        ["auth", "register" | "login" | "logout"] => *method == Method::POST,
        ["donations"] | ["donations", _] => {
            *method == Method::GET && segments.get(1).map_or(true, |id| *id != "my")
        }
        _ => false,
    }
}

/// Rejects unauthenticated calls to protected API routes before they reach a handler.
pub async fn require_auth(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS || is_public_route(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    if let Some(token) = extract_token_from_headers(req.headers()) {
        if validate_token_str(&state.config.jwt, &token).is_ok() {
            return next.run(req).await;
        }
    }

    ApiError::Unauthorized("Not authorized, please log in".to_string()).into_response()
}

pub async fn hash_password(password: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))
    })
    .await?
}

pub async fn verify_password(password: String, hash: String) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash).map_err(|e| anyhow::anyhow!("stored hash unreadable: {}", e))?;
        Ok(Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
    })
    .await?
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    #[validate(length(min = 1, max = 120, message = "Full name is required"))]
    pub full_name: String,
    pub role: Role,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email(message = "Please provide a valid email"))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Deserialize, Validate, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 120, message = "Full name cannot be empty"))]
    pub full_name: Option<String>,
    pub organization_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Serialize)]
pub struct AuthPayload {
    pub token: String,
    pub user: User,
}

fn session_response(
    state: &AppState,
    user: User,
    message: &str,
    created: bool,
) -> Result<impl IntoResponse, ApiError> {
    let token = create_token(&state.config.jwt, &user)?;
    let cookie = build_auth_cookie(&token, &state.config.jwt, state.config.production);
    let envelope = Envelope::with_message(AuthPayload { token, user }, message);
    let body = if created {
        ApiResponse::created(envelope)
    } else {
        ApiResponse::ok(envelope)
    };
    Ok((AppendHeaders([(header::SET_COOKIE, cookie)]), body))
}

pub async fn register(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.role == Role::Admin {
        return Err(ApiError::forbidden("Admin accounts cannot be self-registered"));
    }
    if req.full_name.trim().is_empty() {
        return Err(ApiError::bad_request("Full name is required"));
    }

    let password_hash = hash_password(req.password).await?;
    let new_user = db::NewUser {
        email: req.email,
        password_hash,
        full_name: req.full_name,
        role: req.role,
        organization_name: req.organization_name,
        phone: req.phone,
        address: req.address,
    };

    let Some(user) = db::create_user(&state.db, new_user, Utc::now()).await? else {
        return Err(ApiError::conflict("User already exists with this email"));
    };
    tracing::info!("Registered {} {}", user.role, user.id);

    session_response(&state, user, "User registered successfully", true)
}

pub async fn login(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let invalid = || ApiError::Unauthorized("Invalid credentials".to_string());

    let user = db::find_user_by_email(&state.db, &req.email).await?.ok_or_else(invalid)?;
    if !verify_password(req.password, user.password_hash.clone()).await? {
        return Err(invalid());
    }

    session_response(&state, user, "Login successful", false)
}

pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    let cookie = clear_auth_cookie(state.config.production);
    (
        AppendHeaders([(header::SET_COOKIE, cookie)]),
        ApiResponse::ok(Envelope::message("Logged out successfully")),
    )
}

pub async fn me(State(state): State<AppState>, user: AuthenticatedUser) -> ApiResult<User> {
    let profile = db::get_user(&state.db, &user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;
    Ok(ApiResponse::ok(Envelope::data(profile)))
}

pub async fn update_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    ValidJson(req): ValidJson<UpdateProfileRequest>,
) -> ApiResult<User> {
    if req.full_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(ApiError::bad_request("Full name cannot be empty"));
    }
    let update = db::ProfileUpdate {
        full_name: req.full_name,
        organization_name: req.organization_name,
        phone: req.phone,
        address: req.address,
    };
    let profile = db::update_profile(&state.db, &user.id, update, Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found("User"))?;
    Ok(ApiResponse::ok(Envelope::with_message(profile, "Profile updated successfully")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn jwt() -> JwtConfig {
        crate::config::Config::for_tests().jwt
    }

    fn user(role: Role) -> User {
        let now = Utc::now();
        User {
            id: "user-1".into(),
            email: "asha@example.org".into(),
            password_hash: String::new(),
            full_name: "Asha Rao".into(),
            role,
            verified: false,
            impact_score: 0,
            organization_name: None,
            phone: None,
            address: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn token_round_trip_carries_role() {
        let token = create_token(&jwt(), &user(Role::Receiver)).unwrap();
        let claims = validate_token_str(&jwt(), &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, Role::Receiver);
        assert_eq!(claims.name, "Asha Rao");
    }

    #[test]
    fn token_with_wrong_secret_is_rejected() {
        let token = create_token(&jwt(), &user(Role::Donor)).unwrap();
        let mut other = jwt();
        other.secret = "another-secret".into();
        assert!(validate_token_str(&other, &token).is_err());
    }

    #[test]
    fn audience_is_enforced_when_configured() {
        let mut with_aud = jwt();
        with_aud.audience = Some("annsampark-web".into());
        let token = create_token(&with_aud, &user(Role::Donor)).unwrap();
        assert!(validate_token_str(&with_aud, &token).is_ok());

        let mut other_aud = with_aud.clone();
        other_aud.audience = Some("someone-else".into());
        assert!(validate_token_str(&other_aud, &token).is_err());
    }

    #[test]
    fn bearer_header_beats_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; auth_token=xyz"));
        assert_eq!(extract_token_from_headers(&headers).as_deref(), Some("abc"));

        headers.remove(header::AUTHORIZATION);
        assert_eq!(extract_token_from_headers(&headers).as_deref(), Some("xyz"));

        headers.remove(header::COOKIE);
        assert_eq!(extract_token_from_headers(&headers), None);
    }

    #[test]
    fn public_routes() {
        assert!(is_public_route(&Method::GET, "/api/donations"));
        assert!(is_public_route(&Method::GET, "/api/donations/abc"));
        assert!(is_public_route(&Method::POST, "/api/auth/login"));
        assert!(is_public_route(&Method::GET, "/health"));

        assert!(!is_public_route(&Method::POST, "/api/donations"));
        assert!(!is_public_route(&Method::GET, "/api/donations/my/donations"));
        assert!(!is_public_route(&Method::GET, "/api/donations/abc/requests"));
        assert!(!is_public_route(&Method::GET, "/api/notifications"));
        assert!(!is_public_route(&Method::GET, "/api/auth/me"));
    }

    #[test]
    fn role_gate() {
        let receiver = AuthenticatedUser {
            id: "r".into(),
            email: "r@x.org".into(),
            name: "R".into(),
            role: Role::Receiver,
        };
        assert!(receiver.require_role(&[Role::Receiver]).is_ok());
        let err = receiver.require_role(&[Role::Donor]).unwrap_err();
        assert_eq!(err.to_string(), "User role receiver is not authorized to access this route");
    }

    #[tokio::test]
    async fn password_hash_verifies() {
        let hash = hash_password("correct horse".into()).await.unwrap();
        assert_ne!(hash, "correct horse");
        assert!(verify_password("correct horse".into(), hash.clone()).await.unwrap());
        assert!(!verify_password("wrong horse".into(), hash).await.unwrap());
    }

    #[test]
    fn cookie_flags() {
        let cookie = build_auth_cookie("t", &jwt(), true);
        assert!(cookie.starts_with("auth_token=t;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.ends_with("; Secure"));
        assert!(clear_auth_cookie(false).contains("Max-Age=0"));
    }
}

//! Authentication gate: signed tokens, password hashing, and the request
//! middlewares that admit browser (cookie) and CLI (bearer header) clients.

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::api::SharedState;
use crate::errors::StoreError;

type HmacSha256 = Hmac<Sha256>;

pub const COOKIE_NAME: &str = "token";
pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token supplied")]
    MissingToken,

    #[error("token is malformed or has a bad signature")]
    InvalidToken,

    #[error("token has expired")]
    Expired,

    #[error("token subject no longer exists")]
    UnknownUser,

    #[error("failed to load user: {0}")]
    Store(#[source] StoreError),
}

/// Reduced authenticated-user view attached to request extensions.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
}

// ── Signed tokens ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub exp: i64,
}

fn sign(secret: &str, message: &str) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Mint a compact HS256 token carrying the `user_id` claim.
pub fn create_token(secret: &str, user_id: &str, ttl_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "user_id": user_id,
        "exp": chrono::Utc::now().timestamp() + ttl_secs,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{}.{}", header, payload);
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &signing_input));
    format!("{}.{}", signing_input, signature)
}

/// Verify signature and expiry, returning the claims.
pub fn validate_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    let mut parts = token.splitn(3, '.');
    let (Some(header), Some(payload), Some(signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken);
    };

    let signing_input = format!("{}.{}", header, payload);
    let expected = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| AuthError::InvalidToken)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::InvalidToken)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::InvalidToken)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp <= chrono::Utc::now().timestamp() {
        return Err(AuthError::Expired);
    }
    Ok(claims)
}

// ── Password hashing ──────────────────────────────────────────────────

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hash a password with a per-user random salt, stored as `salt$digest`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = hex_encode(&salt);
    format!("{}${}", salt, digest_with_salt(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    digest_with_salt(salt, password) == digest
}

fn digest_with_salt(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex_encode(&hasher.finalize())
}

// ── Token extraction & authentication ─────────────────────────────────

/// Pull the bearer token from `Authorization` first, falling back to the
/// `token` cookie. An empty value counts as no token.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some(token) = part.strip_prefix("token=") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

pub async fn authenticate(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<CurrentUser, AuthError> {
    let token = extract_token(headers).ok_or(AuthError::MissingToken)?;
    let claims = validate_token(&state.config.jwt_secret, &token)?;
    let user_id = claims.user_id;
    let user = state
        .db
        .call(move |db| db.get_user(&user_id))
        .await
        .map_err(|e| match e {
            StoreError::NotFound => AuthError::UnknownUser,
            other => AuthError::Store(other),
        })?;
    Ok(CurrentUser {
        id: user.id,
        email: user.email,
    })
}

// ── Gate middlewares ──────────────────────────────────────────────────

/// Hard gate for API routes: 401 on any authentication failure.
pub async fn auth_gate(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!("rejected request: {}", err);
            (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
        }
    }
}

/// Page gate: unauthenticated requests are redirected to `/`, keeping the
/// query string so a CLI handshake survives the round trip.
pub async fn require_auth(
    State(state): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Response {
    match authenticate(&state, req.headers()).await {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(_) => {
            let target = match req.uri().query() {
                Some(q) if q.contains("cli=true") => format!("/?{}", q),
                _ => "/".to_string(),
            };
            Redirect::to(&target).into_response()
        }
    }
}

/// Login/register gate: an already-authenticated CLI caller gets the
/// handshake page immediately; browsers are sent to the dashboard.
pub async fn require_guest(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    if authenticate(&state, req.headers()).await.is_err() {
        return next.run(req).await;
    }

    let query = AuthQuery::parse(req.uri().query().unwrap_or(""));
    if query.is_cli() {
        let Some(port) = query.port else {
            return (StatusCode::BAD_REQUEST, "missing or invalid port parameter")
                .into_response();
        };
        let token = extract_token(req.headers()).unwrap_or_default();
        return handshake_page(port, &token).into_response();
    }
    Redirect::to("/dashboard").into_response()
}

// ── CLI handshake query ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub cli: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl AuthQuery {
    pub fn is_cli(&self) -> bool {
        self.cli.as_deref() == Some("true")
    }

    fn parse(query: &str) -> Self {
        let mut out = AuthQuery::default();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("cli", v)) => out.cli = Some(v.to_string()),
                Some(("port", v)) => out.port = v.parse().ok(),
                _ => {}
            }
        }
        out
    }

    /// Query-string suffix to append to redirects so `cli`/`port` round-trip.
    fn redirect_suffix(&self) -> String {
        match (self.is_cli(), self.port) {
            (true, Some(port)) => format!("?cli=true&port={}", port),
            _ => String::new(),
        }
    }
}

/// Success page that posts the token to the CLI's local callback server.
fn handshake_page(port: u16, token: &str) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html>
<head><title>deeploy</title></head>
<body>
  <p>Authentication complete. You can close this window.</p>
  <form id="cli-callback" method="post" action="http://localhost:{port}/">
    <input type="hidden" name="token" value="{token}">
  </form>
  <script>document.getElementById("cli-callback").submit();</script>
</body>
</html>
"#
    ))
}

// ── Cookie contract ───────────────────────────────────────────────────

pub fn session_cookie(token: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict; Max-Age={}",
        COOKIE_NAME, token, TOKEN_TTL_SECS
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie(secure: bool) -> String {
    let mut cookie = format!("{}=; Path=/; HttpOnly; SameSite=Strict; Max-Age=-1", COOKIE_NAME);
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

// ── Routes ────────────────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router<SharedState> {
    let guest = Router::new()
        .route("/login", get(login_page))
        .route("/register", get(register_page))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_guest));

    let authed = Router::new()
        .route("/dashboard", get(dashboard_page))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(home_page))
        .route("/login", post(post_login))
        .route("/register", post(post_register))
        .route("/logout", get(logout))
        .merge(guest)
        .merge(authed)
}

#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, rename = "passwordConfirm")]
    pub password_confirm: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

async fn home_page() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html><head><title>deeploy</title></head>
<body>
  <h1>deeploy</h1>
  <p><a href="/login">Log in</a> or <a href="/register">register</a>.</p>
</body></html>
"#,
    )
}

fn auth_form_page(action: &str, title: &str, confirm_field: bool, query: &AuthQuery) -> Html<String> {
    let confirm = if confirm_field {
        r#"<input type="password" name="passwordConfirm" placeholder="confirm password">"#
    } else {
        ""
    };
    Html(format!(
        r#"<!doctype html>
<html><head><title>{title} - deeploy</title></head>
<body>
  <h1>{title}</h1>
  <form method="post" action="{action}{suffix}">
    <input type="email" name="email" placeholder="email">
    <input type="password" name="password" placeholder="password">
    {confirm}
    <button type="submit">{title}</button>
  </form>
</body></html>
"#,
        suffix = query.redirect_suffix(),
    ))
}

async fn login_page(Query(query): Query<AuthQuery>) -> Html<String> {
    auth_form_page("/login", "Log in", false, &query)
}

async fn register_page(Query(query): Query<AuthQuery>) -> Html<String> {
    auth_form_page("/register", "Register", true, &query)
}

async fn dashboard_page(
    axum::extract::Extension(user): axum::extract::Extension<CurrentUser>,
) -> Html<String> {
    Html(format!(
        r#"<!doctype html>
<html><head><title>dashboard - deeploy</title></head>
<body>
  <h1>Dashboard</h1>
  <p>Signed in as {}.</p>
  <p><a href="/logout">Log out</a></p>
</body></html>
"#,
        user.email
    ))
}

async fn post_register(
    State(state): State<SharedState>,
    Query(query): Query<AuthQuery>,
    Form(form): Form<RegisterForm>,
) -> Response {
    let mut email_err = "";
    let mut password_err = "";
    let mut confirm_err = "";
    if form.email.is_empty() || !form.email.contains('@') {
        email_err = "A valid email is required";
    }
    if form.password.is_empty() {
        password_err = "Password is required";
    }
    if form.password_confirm != form.password {
        confirm_err = "Passwords do not match";
    }
    if !email_err.is_empty() || !password_err.is_empty() || !confirm_err.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "email": email_err,
                "password": password_err,
                "passwordConfirm": confirm_err,
            })),
        )
            .into_response();
    }

    let email = form.email.clone();
    let password_hash = hash_password(&form.password);
    let user = match state
        .db
        .call(move |db| db.create_user(&email, &password_hash))
        .await
    {
        Ok(user) => user,
        Err(StoreError::DuplicateEmail) => {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"email": "Email is already in use"})),
            )
                .into_response();
        }
        Err(err) => {
            tracing::error!("failed to create user: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    auth_success(&state, &user.id, &query)
}

async fn post_login(
    State(state): State<SharedState>,
    Query(query): Query<AuthQuery>,
    Form(form): Form<LoginForm>,
) -> Response {
    if form.email.is_empty() || form.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "email": if form.email.is_empty() { "Email is required" } else { "" },
                "password": if form.password.is_empty() { "Password is required" } else { "" },
            })),
        )
            .into_response();
    }

    let email = form.email.clone();
    let user = match state.db.call(move |db| db.get_user_by_email(&email)).await {
        Ok(user) => user,
        Err(StoreError::NotFound) => {
            return (StatusCode::UNAUTHORIZED, "invalid email or password").into_response();
        }
        Err(err) => {
            tracing::error!("failed to load user: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    if !verify_password(&form.password, &user.password_hash) {
        return (StatusCode::UNAUTHORIZED, "invalid email or password").into_response();
    }

    auth_success(&state, &user.id, &query)
}

/// Set the session cookie and redirect: browsers land on the dashboard, CLI
/// logins bounce back to the login page, which renders the handshake.
fn auth_success(state: &SharedState, user_id: &str, query: &AuthQuery) -> Response {
    let token = create_token(&state.config.jwt_secret, user_id, TOKEN_TTL_SECS);
    let location = match (query.is_cli(), query.port) {
        (true, Some(port)) => format!("/login?cli=true&port={}", port),
        _ => "/dashboard".to_string(),
    };
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(
            header::SET_COOKIE,
            session_cookie(&token, !state.config.is_development()),
        )
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap()
}

async fn logout(State(state): State<SharedState>) -> Response {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(
            header::SET_COOKIE,
            clear_session_cookie(!state.config.is_development()),
        )
        .header(header::LOCATION, "/")
        .body(Body::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret";

    #[test]
    fn token_round_trips_user_id() {
        let token = create_token(SECRET, "user-42", TOKEN_TTL_SECS);
        let claims = validate_token(SECRET, &token).unwrap();
        assert_eq!(claims.user_id, "user-42");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let token = create_token(SECRET, "user-42", TOKEN_TTL_SECS);
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(matches!(
            validate_token(SECRET, &tampered),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_token(SECRET, "user-42", TOKEN_TTL_SECS);
        assert!(validate_token("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = create_token(SECRET, "user-42", -60);
        assert!(matches!(
            validate_token(SECRET, &token),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(validate_token(SECRET, "not-a-token").is_err());
        assert!(validate_token(SECRET, "a.b.c").is_err());
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer header-token"),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("token=cookie-token"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("header-token"));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; token=abc; lang=en"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn empty_token_means_no_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("token="));
        assert_eq!(extract_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_token(&headers), None);
    }

    #[test]
    fn password_hash_verifies_and_salts() {
        let first = hash_password("pw123");
        let second = hash_password("pw123");
        assert_ne!(first, second);
        assert!(verify_password("pw123", &first));
        assert!(verify_password("pw123", &second));
        assert!(!verify_password("other", &first));
    }

    #[test]
    fn session_cookie_matches_contract() {
        let cookie = session_cookie("abc", false);
        assert_eq!(
            cookie,
            "token=abc; Path=/; HttpOnly; SameSite=Strict; Max-Age=86400"
        );
        assert!(session_cookie("abc", true).ends_with("; Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        assert!(clear_session_cookie(false).contains("Max-Age=-1"));
    }

    #[test]
    fn handshake_page_embeds_port_and_token() {
        let page = handshake_page(4123, "tok-1").0;
        assert!(page.contains("http://localhost:4123/"));
        assert!(page.contains(r#"value="tok-1""#));
    }

    #[test]
    fn auth_query_parses_cli_and_port() {
        let q = AuthQuery::parse("cli=true&port=9000");
        assert!(q.is_cli());
        assert_eq!(q.port, Some(9000));
        assert_eq!(q.redirect_suffix(), "?cli=true&port=9000");

        let q = AuthQuery::parse("cli=false");
        assert!(!q.is_cli());
        assert_eq!(q.redirect_suffix(), "");
    }
}

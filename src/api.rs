use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::CurrentUser;
use crate::config::Config;
use crate::db::{DbHandle, PodUpdate};
use crate::deploy::{DEFAULT_LOG_LINES, Deployer};
use crate::errors::{DeployError, StoreError};
use crate::models::*;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: Config,
    pub deployer: Deployer,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct CreatePodRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_id: String,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub dockerfile_path: Option<String>,
    pub git_token_id: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdatePodRequest {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub dockerfile_path: Option<String>,
    pub git_token_id: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDomainRequest {
    #[serde(default)]
    pub domain: String,
    pub port: Option<i64>,
    pub ssl_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct CreateEnvVarRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize)]
pub struct CreateGitTokenRequest {
    #[serde(default)]
    pub name: String,
    pub provider: Option<String>,
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

/// HTTP-mapped error. Bodies are plain text, except field-level validation
/// failures which return a JSON object of field → message.
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Validation(serde_json::Value),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::Validation(fields) => {
                (StatusCode::BAD_REQUEST, Json(fields)).into_response()
            }
            ApiError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            StoreError::DuplicateEmail => ApiError::Conflict(err.to_string()),
            StoreError::Integrity(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::PodNotFound => ApiError::NotFound("pod not found".to_string()),
            DeployError::MissingRepoUrl | DeployError::NotRunning => {
                ApiError::BadRequest(err.to_string())
            }
            DeployError::Busy => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router(state: SharedState) -> Router<SharedState> {
    let protected = Router::new()
        .route("/api/projects", get(list_projects).post(create_project).put(update_project))
        .route("/api/projects/{id}", get(get_project).delete(delete_project))
        .route("/api/projects/{id}/pods", get(list_project_pods))
        .route("/api/pods", get(list_pods).post(create_pod).put(update_pod))
        .route("/api/pods/{id}", get(get_pod).delete(delete_pod))
        .route("/api/pods/{id}/deploy", post(deploy_pod))
        .route("/api/pods/{id}/stop", post(stop_pod))
        .route("/api/pods/{id}/restart", post(restart_pod))
        .route("/api/pods/{id}/logs", get(pod_logs))
        .route("/api/pods/{id}/domains", get(list_domains).post(create_domain))
        .route("/api/pods/{id}/domains/{domain_id}", delete(delete_domain))
        .route("/api/pods/{id}/domains/{domain_id}/primary", put(set_primary_domain))
        .route("/api/pods/{id}/env", get(list_env_vars).post(create_env_var))
        .route("/api/pods/{id}/env/{env_id}", delete(delete_env_var))
        .route("/api/git-tokens", get(list_git_tokens).post(create_git_token))
        .route("/api/git-tokens/{id}", delete(delete_git_token))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::auth::auth_gate,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
}

// ── Ownership helpers ─────────────────────────────────────────────────

async fn load_owned_project(
    state: &SharedState,
    user: &CurrentUser,
    project_id: &str,
) -> Result<Project, ApiError> {
    let id = project_id.to_string();
    let project = state.db.call(move |db| db.get_project(&id)).await?;
    if project.user_id != user.id {
        return Err(ApiError::NotFound("record not found".to_string()));
    }
    Ok(project)
}

async fn load_owned_pod(
    state: &SharedState,
    user: &CurrentUser,
    pod_id: &str,
) -> Result<Pod, ApiError> {
    let id = pod_id.to_string();
    let pod = state.db.call(move |db| db.get_pod(&id)).await?;
    if pod.user_id != user.id {
        return Err(ApiError::NotFound("record not found".to_string()));
    }
    Ok(pod)
}

async fn load_owned_git_token(
    state: &SharedState,
    user: &CurrentUser,
    token_id: &str,
) -> Result<GitToken, ApiError> {
    let id = token_id.to_string();
    let token = state.db.call(move |db| db.get_git_token(&id)).await?;
    if token.user_id != user.id {
        return Err(ApiError::NotFound("record not found".to_string()));
    }
    Ok(token)
}

// ── Health ────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "service": "deeploy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Projects ──────────────────────────────────────────────────────────

async fn create_project(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.is_empty() {
        return Err(ApiError::Validation(json!({"title": "Title is required"})));
    }
    let user_id = user.id.clone();
    let project = state
        .db
        .call(move |db| db.create_project(&user_id, &req.title, &req.description))
        .await?;
    Ok(Json(ProjectView::from(&project)))
}

async fn list_projects(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id.clone();
    let projects = state.db.call(move |db| db.list_projects(&user_id)).await?;
    Ok(Json(projects.iter().map(ProjectView::from).collect::<Vec<_>>()))
}

async fn get_project(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_owned_project(&state, &user, &id).await?;
    Ok(Json(ProjectView::from(&project)))
}

async fn update_project(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_project(&state, &user, &req.id).await?;
    let project = state
        .db
        .call(move |db| db.update_project(&req.id, req.title.as_deref(), req.description.as_deref()))
        .await?;
    Ok(Json(ProjectView::from(&project)))
}

async fn delete_project(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_owned_project(&state, &user, &id).await?;

    // Deleting a project takes its pods down with it.
    let project_id = project.id.clone();
    let pods = state
        .db
        .call(move |db| db.list_pods_by_project(&project_id))
        .await?;
    for pod in &pods {
        state.deployer.teardown(pod).await;
    }

    state.db.call(move |db| db.delete_project(&project.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_project_pods(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_owned_project(&state, &user, &id).await?;
    let pods = state
        .db
        .call(move |db| db.list_pods_by_project(&project.id))
        .await?;
    Ok(Json(pods.iter().map(PodView::from).collect::<Vec<_>>()))
}

// ── Pods ──────────────────────────────────────────────────────────────

async fn create_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreatePodRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title_err = if req.title.is_empty() { "Title is required" } else { "" };
    let project_err = if req.project_id.is_empty() {
        "Project ID is required"
    } else {
        ""
    };
    if !title_err.is_empty() || !project_err.is_empty() {
        return Err(ApiError::Validation(json!({
            "title": title_err,
            "project_id": project_err,
        })));
    }

    load_owned_project(&state, &user, &req.project_id).await?;
    if let Some(token_id) = &req.git_token_id {
        load_owned_git_token(&state, &user, token_id).await?;
    }

    let user_id = user.id.clone();
    let pod = state
        .db
        .call(move |db| {
            db.create_pod(
                &user_id,
                &req.project_id,
                &req.title,
                &req.description,
                req.repo_url.as_deref().filter(|u| !u.is_empty()),
                req.branch.as_deref().unwrap_or("main"),
                req.dockerfile_path.as_deref().unwrap_or("Dockerfile"),
                req.git_token_id.as_deref(),
            )
        })
        .await?;
    Ok(Json(PodView::from(&pod)))
}

async fn list_pods(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id.clone();
    let pods = state.db.call(move |db| db.list_pods(&user_id)).await?;
    Ok(Json(pods.iter().map(PodView::from).collect::<Vec<_>>()))
}

async fn get_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    Ok(Json(PodView::from(&pod)))
}

async fn update_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<UpdatePodRequest>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_pod(&state, &user, &req.id).await?;
    if let Some(token_id) = &req.git_token_id {
        load_owned_git_token(&state, &user, token_id).await?;
    }

    let update = PodUpdate {
        title: req.title,
        description: req.description,
        repo_url: req.repo_url,
        branch: req.branch,
        dockerfile_path: req.dockerfile_path,
        git_token_id: req.git_token_id,
    };
    let pod = state
        .db
        .call(move |db| db.update_pod(&req.id, &update))
        .await?;
    Ok(Json(PodView::from(&pod)))
}

async fn delete_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    state.deployer.teardown(&pod).await;
    state.db.call(move |db| db.delete_pod(&pod.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Deploy operations ─────────────────────────────────────────────────

async fn deploy_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_pod(&state, &user, &id).await?;
    state.deployer.deploy(&id).await?;
    Ok(Json(json!({"status": "deploying"})))
}

async fn stop_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_pod(&state, &user, &id).await?;
    state.deployer.stop(&id).await?;
    Ok(Json(json!({"status": "stopped"})))
}

async fn restart_pod(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_pod(&state, &user, &id).await?;
    state.deployer.restart(&id).await?;
    Ok(Json(json!({"status": "restarting"})))
}

async fn pod_logs(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned_pod(&state, &user, &id).await?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.deployer.logs(&id, lines).await?;
    Ok(Json(json!({"logs": logs})))
}

// ── Pod domains ───────────────────────────────────────────────────────

async fn create_domain(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<CreateDomainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.domain.is_empty() {
        return Err(ApiError::Validation(json!({"domain": "Domain is required"})));
    }
    let pod = load_owned_pod(&state, &user, &id).await?;
    let domain = state
        .db
        .call(move |db| {
            db.create_pod_domain(
                &pod.id,
                &req.domain,
                DomainKind::Custom,
                req.port.unwrap_or(80),
                false,
                req.ssl_enabled.unwrap_or(true),
            )
        })
        .await?;
    Ok(Json(domain))
}

async fn list_domains(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    let domains = state
        .db
        .call(move |db| db.list_pod_domains(&pod.id))
        .await?;
    Ok(Json(domains))
}

async fn set_primary_domain(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((id, domain_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    let domain = state
        .db
        .call(move |db| db.set_primary_domain(&pod.id, &domain_id))
        .await?;
    Ok(Json(domain))
}

async fn delete_domain(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((id, domain_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    state
        .db
        .call(move |db| {
            let domain = db.get_pod_domain(&domain_id)?;
            if domain.pod_id != pod.id {
                return Err(StoreError::NotFound);
            }
            db.delete_pod_domain(&domain_id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Pod env vars ──────────────────────────────────────────────────────

async fn create_env_var(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<CreateEnvVarRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.key.is_empty() {
        return Err(ApiError::Validation(json!({"key": "Key is required"})));
    }
    let pod = load_owned_pod(&state, &user, &id).await?;
    let env_var = state
        .db
        .call(move |db| db.create_pod_env_var(&pod.id, &req.key, &req.value))
        .await?;
    Ok(Json(env_var))
}

async fn list_env_vars(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    let env_vars = state
        .db
        .call(move |db| db.list_pod_env_vars(&pod.id))
        .await?;
    Ok(Json(env_vars))
}

async fn delete_env_var(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path((id, env_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let pod = load_owned_pod(&state, &user, &id).await?;
    state
        .db
        .call(move |db| {
            let env_var = db.get_pod_env_var(&env_id)?;
            if env_var.pod_id != pod.id {
                return Err(StoreError::NotFound);
            }
            db.delete_pod_env_var(&env_id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Git tokens ────────────────────────────────────────────────────────

async fn create_git_token(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<CreateGitTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name_err = if req.name.is_empty() { "Name is required" } else { "" };
    let token_err = if req.token.is_empty() { "Token is required" } else { "" };
    if !name_err.is_empty() || !token_err.is_empty() {
        return Err(ApiError::Validation(json!({
            "name": name_err,
            "token": token_err,
        })));
    }

    let user_id = user.id.clone();
    let token = state
        .db
        .call(move |db| {
            db.create_git_token(
                &user_id,
                &req.name,
                req.provider.as_deref().unwrap_or("github"),
                &req.token,
            )
        })
        .await?;
    Ok(Json(GitTokenView::from(&token)))
}

async fn list_git_tokens(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user.id.clone();
    let tokens = state.db.call(move |db| db.list_git_tokens(&user_id)).await?;
    Ok(Json(tokens.iter().map(GitTokenView::from).collect::<Vec<_>>()))
}

async fn delete_git_token(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let token = load_owned_git_token(&state, &user, &id).await?;
    state.db.call(move |db| db.delete_git_token(&token.id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::auth;
    use crate::db::Database;
    use crate::engine::fake::FakeEngine;

    struct TestApp {
        router: Router,
        state: SharedState,
        tmp: tempfile::TempDir,
    }

    fn test_app_with(engine: FakeEngine) -> TestApp {
        let db = DbHandle::new(Database::new_in_memory().unwrap());
        let config = Config::from_lookup(|_| None).unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let deployer = Deployer::new(
            db.clone(),
            Arc::new(engine),
            config.base_domain.clone(),
            tmp.path().to_path_buf(),
        );
        let state = Arc::new(AppState {
            db,
            config,
            deployer,
        });
        let router = api_router(state.clone()).with_state(state.clone());
        TestApp { router, state, tmp }
    }

    fn test_app() -> TestApp {
        test_app_with(FakeEngine::default())
    }

    async fn seed_user(app: &TestApp, email: &str) -> (String, String) {
        let email = email.to_string();
        let user = app
            .state
            .db
            .call(move |db| db.create_user(&email, "hash"))
            .await
            .unwrap();
        let token = auth::create_token(&app.state.config.jwt_secret, &user.id, 3600);
        (user.id, token)
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    async fn create_project(app: &TestApp, token: &str, title: &str) -> String {
        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                "/api/projects",
                token,
                Some(json!({"title": title, "description": ""})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await["id"].as_str().unwrap().to_string()
    }

    async fn create_pod(
        app: &TestApp,
        token: &str,
        project_id: &str,
        repo_url: Option<&str>,
    ) -> String {
        let mut body = json!({"title": "My App", "project_id": project_id});
        if let Some(url) = repo_url {
            body["repo_url"] = json!(url);
        }
        let resp = app
            .router
            .clone()
            .oneshot(authed("POST", "/api/pods", token, Some(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_is_public_and_identifies_the_service() {
        let app = test_app();
        let resp = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["service"], "deeploy");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn api_routes_require_a_token() {
        let app = test_app();
        let resp = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/api/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn project_create_echoes_with_generated_id() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                "/api/projects",
                &token,
                Some(json!({"title": "P", "description": ""})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["title"], "P");
        assert!(!json["id"].as_str().unwrap().is_empty());
        assert!(json.get("user_id").is_none());
    }

    #[tokio::test]
    async fn pod_create_reports_missing_project_id() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                "/api/pods",
                &token,
                Some(json!({"title": "A"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(
            json,
            json!({"title": "", "project_id": "Project ID is required"})
        );
    }

    #[tokio::test]
    async fn deploy_without_repo_url_is_invalid_config() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id = create_pod(&app, &token, &project_id, None).await;

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(resp).await, "pod has no repo URL configured");

        // status is untouched in the store
        let pod_id_clone = pod_id.clone();
        let pod = app
            .state
            .db
            .call(move |db| db.get_pod(&pod_id_clone))
            .await
            .unwrap();
        assert_eq!(pod.status, PodStatus::Created);
    }

    #[tokio::test]
    async fn deploy_happy_path_records_running_pod_with_auto_domain() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id =
            create_pod(&app, &token, &project_id, Some("https://example.com/acme/app.git")).await;

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({"status": "deploying"}));

        let pod_id_clone = pod_id.clone();
        let pod = app
            .state
            .db
            .call(move |db| db.get_pod(&pod_id_clone))
            .await
            .unwrap();
        assert_eq!(pod.status, PodStatus::Running);
        assert!(pod.container_id.is_some());

        let pod_id_clone = pod_id.clone();
        let domains = app
            .state
            .db
            .call(move |db| db.list_pod_domains(&pod_id_clone))
            .await
            .unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].kind, DomainKind::Auto);
        assert_eq!(domains[0].port, 80);
        assert!(domains[0].is_primary);
        assert!(domains[0].domain.ends_with(".localhost"));

        // the per-deploy workspace is gone
        assert_eq!(std::fs::read_dir(app.tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn logs_endpoint_returns_clean_lines() {
        let engine = FakeEngine {
            stored_logs: vec!["ready".to_string(), "listening on :80".to_string()],
            ..Default::default()
        };
        let app = test_app_with(engine);
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id =
            create_pod(&app, &token, &project_id, Some("https://example.com/acme/app.git")).await;

        app.router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "GET",
                &format!("/api/pods/{}/logs?lines=10", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"logs": ["ready", "listening on :80"]})
        );
    }

    #[tokio::test]
    async fn concurrent_deploy_returns_conflict() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id =
            create_pod(&app, &token, &project_id, Some("https://example.com/acme/app.git")).await;

        let locks = app.state.deployer.locks();
        let _guard = locks.try_acquire(&pod_id).unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn git_token_listing_masks_the_secret() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                "/api/git-tokens",
                &token,
                Some(json!({"name": "ci", "token": "ghp_supersecret9876"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["token"], "****9876");

        let resp = app
            .router
            .clone()
            .oneshot(authed("GET", "/api/git-tokens", &token, None))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json[0]["token"], "****9876");
        assert!(!json.to_string().contains("supersecret"));
    }

    #[tokio::test]
    async fn resources_of_other_users_read_as_not_found() {
        let app = test_app();
        let (_a, token_a) = seed_user(&app, "a@b.c").await;
        let (_b, token_b) = seed_user(&app, "b@b.c").await;
        let project_id = create_project(&app, &token_a, "P").await;

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "GET",
                &format!("/api/projects/{}", project_id),
                &token_b,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn custom_domain_can_become_primary() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id =
            create_pod(&app, &token, &project_id, Some("https://example.com/acme/app.git")).await;

        app.router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/domains", pod_id),
                &token,
                Some(json!({"domain": "app.example.com"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let created = body_json(resp).await;
        assert_eq!(created["type"], "custom");
        assert_eq!(created["is_primary"], false);

        let domain_id = created["id"].as_str().unwrap();
        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "PUT",
                &format!("/api/pods/{}/domains/{}/primary", pod_id, domain_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["is_primary"], true);

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "GET",
                &format!("/api/pods/{}/domains", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        let domains = body_json(resp).await;
        let primaries: Vec<_> = domains
            .as_array()
            .unwrap()
            .iter()
            .filter(|d| d["is_primary"] == true)
            .collect();
        assert_eq!(primaries.len(), 1);
    }

    #[tokio::test]
    async fn pod_update_round_trips_through_get() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id = create_pod(&app, &token, &project_id, None).await;

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "PUT",
                "/api/pods",
                &token,
                Some(json!({"id": pod_id, "branch": "develop"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .router
            .clone()
            .oneshot(authed("GET", &format!("/api/pods/{}", pod_id), &token, None))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json["branch"], "develop");
        assert_eq!(json["title"], "My App");
    }

    #[tokio::test]
    async fn delete_pod_tears_down_its_container() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id =
            create_pod(&app, &token, &project_id, Some("https://example.com/acme/app.git")).await;

        app.router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/deploy", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "DELETE",
                &format!("/api/pods/{}", pod_id),
                &token,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app
            .router
            .clone()
            .oneshot(authed("GET", &format!("/api/pods/{}", pod_id), &token, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn env_vars_flow_into_listing() {
        let app = test_app();
        let (_uid, token) = seed_user(&app, "a@b.c").await;
        let project_id = create_project(&app, &token, "P").await;
        let pod_id = create_pod(&app, &token, &project_id, None).await;

        let resp = app
            .router
            .clone()
            .oneshot(authed(
                "POST",
                &format!("/api/pods/{}/env", pod_id),
                &token,
                Some(json!({"key": "PORT", "value": "80"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .router
            .clone()
            .oneshot(authed("GET", &format!("/api/pods/{}/env", pod_id), &token, None))
            .await
            .unwrap();
        let json = body_json(resp).await;
        assert_eq!(json[0]["key"], "PORT");
        assert_eq!(json[0]["value"], "80");
    }
}

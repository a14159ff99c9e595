use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Registered account. Never serialized to API responses; the auth gate
/// exposes a reduced view instead.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectView {
    pub id: String,
    pub title: String,
    pub description: String,
}

impl From<&Project> for ProjectView {
    fn from(p: &Project) -> Self {
        Self {
            id: p.id.clone(),
            title: p.title.clone(),
            description: p.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Created,
    Building,
    Running,
    Stopped,
    Failed,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Building => "building",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PodStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "building" => Ok(Self::Building),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid pod status: {}", s)),
        }
    }
}

/// A declarative deployable unit: repo + dockerfile + env + domains.
///
/// `container_id` is non-empty exactly when `status` is running or stopped.
#[derive(Debug, Clone)]
pub struct Pod {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub repo_url: Option<String>,
    pub branch: String,
    pub dockerfile_path: String,
    pub git_token_id: Option<String>,
    pub container_id: Option<String>,
    pub status: PodStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodView {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub repo_url: Option<String>,
    pub branch: String,
    pub dockerfile_path: String,
    pub git_token_id: Option<String>,
    pub container_id: Option<String>,
    pub status: PodStatus,
}

impl From<&Pod> for PodView {
    fn from(pod: &Pod) -> Self {
        Self {
            id: pod.id.clone(),
            project_id: pod.project_id.clone(),
            title: pod.title.clone(),
            description: pod.description.clone(),
            repo_url: pod.repo_url.clone(),
            branch: pod.branch.clone(),
            dockerfile_path: pod.dockerfile_path.clone(),
            git_token_id: pod.git_token_id.clone(),
            container_id: pod.container_id.clone(),
            status: pod.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Auto,
    Custom,
}

impl DomainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for DomainKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "custom" => Ok(Self::Custom),
            _ => Err(format!("Invalid domain type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PodDomain {
    pub id: String,
    pub pod_id: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub kind: DomainKind,
    pub port: i64,
    pub is_primary: bool,
    pub ssl_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PodEnvVar {
    pub id: String,
    pub pod_id: String,
    pub key: String,
    pub value: String,
}

/// Stored git credential. The secret is write-only through the API; list
/// responses carry [`GitTokenView`] with the value masked.
#[derive(Debug, Clone)]
pub struct GitToken {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub provider: String,
    pub token: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitTokenView {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub token: String,
}

impl From<&GitToken> for GitTokenView {
    fn from(t: &GitToken) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            provider: t.provider.clone(),
            token: mask_secret(&t.token),
        }
    }
}

/// Mask a secret down to its last four characters.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", visible)
}

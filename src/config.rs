use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Runtime environment, from `GO_ENV`. The name is kept for compatibility
/// with existing deployments and compose files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(value: &str) -> Self {
        match value {
            "production" => Self::Production,
            _ => Self::Development,
        }
    }
}

/// Server configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: AppEnv,
    pub port: u16,
    pub db_connection: String,
    pub jwt_secret: String,
    pub base_domain: String,
    /// Root directory for per-deploy clone/build workspaces.
    pub build_root: PathBuf,
}

const DEV_JWT_SECRET: &str = "deeploy-dev-secret";

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an injectable lookup so tests don't
    /// have to mutate process-wide environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = AppEnv::parse(lookup("GO_ENV").as_deref().unwrap_or("development"));

        let port: u16 = match lookup("PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", raw))?,
            None => 8090,
        };

        let driver = lookup("DB_DRIVER").unwrap_or_else(|| "sqlite".to_string());
        if driver != "sqlite" {
            bail!("unsupported DB_DRIVER {:?}: only sqlite is supported", driver);
        }
        let db_connection = lookup("DB_CONNECTION").unwrap_or_else(|| "deeploy.db".to_string());

        let jwt_secret = match lookup("JWT_SECRET") {
            Some(secret) if !secret.is_empty() => secret,
            _ if env == AppEnv::Production => {
                bail!("JWT_SECRET is required when GO_ENV=production")
            }
            _ => DEV_JWT_SECRET.to_string(),
        };

        let base_domain = lookup("BASE_DOMAIN").unwrap_or_else(|| "localhost".to_string());

        let build_root = lookup("BUILD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("deeploy-builds"));

        Ok(Self {
            env,
            port,
            db_connection,
            jwt_secret,
            base_domain,
            build_root,
        })
    }

    pub fn is_development(&self) -> bool {
        self.env == AppEnv::Development
    }
}

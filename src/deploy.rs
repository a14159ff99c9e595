//! Deploy orchestrator: drives a pod through its lifecycle
//! (`created → building → running → stopped / failed`), coordinating the
//! datastore, git, and the container engine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::RngCore;

use crate::db::DbHandle;
use crate::engine::{ContainerEngine, RunOpts, Workspace, repo_name_from_url};
use crate::errors::{DeployError, EngineError};
use crate::models::{DomainKind, Pod, PodStatus};

pub const STOP_TIMEOUT_SECS: i64 = 30;
pub const DEFAULT_LOG_LINES: usize = 100;

/// Keyed mutual exclusion over pod ids. A second mutating operation on the
/// same pod fails fast instead of queueing; entries vanish when the guard
/// drops, so the set stays small.
#[derive(Default)]
pub struct PodLocks {
    active: Mutex<HashSet<String>>,
}

impl PodLocks {
    fn lock_set(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn try_acquire(self: &Arc<Self>, pod_id: &str) -> Option<PodLockGuard> {
        let mut active = self.lock_set();
        if !active.insert(pod_id.to_string()) {
            return None;
        }
        Some(PodLockGuard {
            locks: Arc::clone(self),
            pod_id: pod_id.to_string(),
        })
    }
}

pub struct PodLockGuard {
    locks: Arc<PodLocks>,
    pod_id: String,
}

impl Drop for PodLockGuard {
    fn drop(&mut self) {
        self.locks.lock_set().remove(&self.pod_id);
    }
}

/// Derive a URL-safe subdomain from a pod title: lower-cased, spaces to
/// dashes, restricted to `[a-z0-9-]`, at most 20 characters, plus a random
/// hex suffix so fresh pods never collide. Titles that sanitize to nothing
/// fall back to `pod`.
pub fn derive_subdomain(title: &str) -> String {
    let mut prefix: String = title
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'))
        .collect();
    prefix.truncate(20);
    if prefix.is_empty() {
        prefix = "pod".to_string();
    }

    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", prefix, suffix)
}

pub struct Deployer {
    db: DbHandle,
    engine: Arc<dyn ContainerEngine>,
    locks: Arc<PodLocks>,
    base_domain: String,
    build_root: PathBuf,
}

impl Deployer {
    pub fn new(
        db: DbHandle,
        engine: Arc<dyn ContainerEngine>,
        base_domain: String,
        build_root: PathBuf,
    ) -> Self {
        Self {
            db,
            engine,
            locks: Arc::new(PodLocks::default()),
            base_domain,
            build_root,
        }
    }

    /// Deploy (or redeploy) a pod. Idempotent with respect to the final
    /// running state: an already-running pod gets its container replaced.
    pub async fn deploy(&self, pod_id: &str) -> Result<Pod, DeployError> {
        let _guard = self
            .locks
            .try_acquire(pod_id)
            .ok_or(DeployError::Busy)?;
        self.deploy_locked(pod_id).await
    }

    async fn deploy_locked(&self, pod_id: &str) -> Result<Pod, DeployError> {
        // Snapshot before the transition: teardown needs the old container id.
        let pod = self.load_pod(pod_id).await?;
        let Some(repo_url) = pod.repo_url.clone().filter(|u| !u.is_empty()) else {
            return Err(DeployError::MissingRepoUrl);
        };

        // Publish progress before any external call so concurrent observers
        // never see a stale `running` during a rebuild.
        self.set_state(&pod.id, PodStatus::Building, None).await?;

        match self.run_deploy(&pod, &repo_url).await {
            Ok(container_id) => {
                self.set_state(&pod.id, PodStatus::Running, Some(container_id))
                    .await
            }
            Err(err) => {
                if let Err(state_err) = self.set_state(&pod.id, PodStatus::Failed, None).await {
                    tracing::error!(
                        "failed to record failed state for pod {}: {}",
                        pod.id,
                        state_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_deploy(&self, pod: &Pod, repo_url: &str) -> Result<String, DeployError> {
        let token = match pod.git_token_id.clone() {
            Some(token_id) => Some(
                self.db
                    .call(move |db| db.get_git_token(&token_id))
                    .await
                    .map_err(DeployError::Credential)?
                    .token,
            ),
            None => None,
        };

        // The guard removes the clone on every exit path below.
        let workspace = Workspace::create(&self.build_root, &repo_name_from_url(repo_url))
            .map_err(EngineError::from)?;

        self.engine
            .clone_repo(repo_url, &pod.branch, token.as_deref(), workspace.path())
            .await?;

        let tag = format!("deeploy-{}:latest", pod.id);
        let pod_id = pod.id.clone();
        let sink = move |chunk: &str| {
            let line = chunk.trim_end();
            if !line.is_empty() {
                tracing::debug!("build[{}]: {}", pod_id, line);
            }
        };
        self.engine
            .build(workspace.path(), &pod.dockerfile_path, &tag, &sink)
            .await?;

        let (domain, port) = self.ensure_auto_domain(pod).await?;

        let pod_id = pod.id.clone();
        let env: Vec<(String, String)> = self
            .db
            .call(move |db| db.list_pod_env_vars(&pod_id))
            .await?
            .into_iter()
            .map(|v| (v.key, v.value))
            .collect();

        // Tear down the previous container before creating the new one so
        // the name never conflicts. It may already be gone; that's fine.
        if let Some(old) = &pod.container_id {
            if let Err(err) = self.engine.stop(old, STOP_TIMEOUT_SECS).await {
                tracing::warn!("failed to stop old container {}: {}", old, err);
            }
            if let Err(err) = self.engine.remove(old).await {
                tracing::warn!("failed to remove old container {}: {}", old, err);
            }
        }

        let container_id = self
            .engine
            .run(RunOpts {
                image: tag,
                container_name: format!("deeploy-{}", pod.id),
                pod_id: pod.id.clone(),
                domain,
                port,
                env,
            })
            .await?;

        Ok(container_id)
    }

    /// Reuse the pod's auto domain, creating `<slug>.<base-domain>` on the
    /// first successful deploy. The auto domain becomes primary unless the
    /// user already picked one.
    async fn ensure_auto_domain(&self, pod: &Pod) -> Result<(String, i64), DeployError> {
        let pod_id = pod.id.clone();
        let domains = self.db.call(move |db| db.list_pod_domains(&pod_id)).await?;
        if let Some(auto) = domains.iter().find(|d| d.kind == DomainKind::Auto) {
            return Ok((auto.domain.clone(), auto.port));
        }

        let fqdn = format!("{}.{}", derive_subdomain(&pod.title), self.base_domain);
        let make_primary = !domains.iter().any(|d| d.is_primary);
        let pod_id = pod.id.clone();
        let fqdn_for_insert = fqdn.clone();
        let created = self
            .db
            .call(move |db| {
                db.create_pod_domain(
                    &pod_id,
                    &fqdn_for_insert,
                    DomainKind::Auto,
                    80,
                    make_primary,
                    true,
                )
            })
            .await?;
        Ok((created.domain, created.port))
    }

    /// Gracefully stop a pod's container. The container is kept so logs stay
    /// inspectable and the proxy record survives until the next deploy.
    pub async fn stop(&self, pod_id: &str) -> Result<Pod, DeployError> {
        let _guard = self
            .locks
            .try_acquire(pod_id)
            .ok_or(DeployError::Busy)?;
        self.stop_locked(pod_id).await
    }

    async fn stop_locked(&self, pod_id: &str) -> Result<Pod, DeployError> {
        let pod = self.load_pod(pod_id).await?;
        let Some(container_id) = pod.container_id.clone() else {
            return Err(DeployError::NotRunning);
        };
        self.engine.stop(&container_id, STOP_TIMEOUT_SECS).await?;
        self.set_state(&pod.id, PodStatus::Stopped, Some(container_id))
            .await
    }

    /// Stop (ignoring "nothing to stop") followed by a fresh deploy. Any
    /// other stop failure aborts the restart.
    pub async fn restart(&self, pod_id: &str) -> Result<Pod, DeployError> {
        let _guard = self
            .locks
            .try_acquire(pod_id)
            .ok_or(DeployError::Busy)?;
        match self.stop_locked(pod_id).await {
            Ok(_) | Err(DeployError::NotRunning) => {}
            Err(err) => return Err(err),
        }
        self.deploy_locked(pod_id).await
    }

    /// Last `n` log lines of the pod's container. Takes no pod lock.
    pub async fn logs(&self, pod_id: &str, n: usize) -> Result<Vec<String>, DeployError> {
        let pod = self.load_pod(pod_id).await?;
        let Some(container_id) = pod.container_id else {
            return Err(DeployError::NotRunning);
        };
        Ok(self.engine.log_lines(&container_id, n).await?)
    }

    /// Best-effort container teardown, used when the pod record is deleted.
    pub async fn teardown(&self, pod: &Pod) {
        if let Some(container_id) = &pod.container_id {
            if let Err(err) = self.engine.stop(container_id, STOP_TIMEOUT_SECS).await {
                tracing::warn!("failed to stop container {}: {}", container_id, err);
            }
            if let Err(err) = self.engine.remove(container_id).await {
                tracing::warn!("failed to remove container {}: {}", container_id, err);
            }
        }
    }

    async fn load_pod(&self, pod_id: &str) -> Result<Pod, DeployError> {
        let id = pod_id.to_string();
        Ok(self.db.call(move |db| db.get_pod(&id)).await?)
    }

    async fn set_state(
        &self,
        pod_id: &str,
        status: PodStatus,
        container_id: Option<String>,
    ) -> Result<Pod, DeployError> {
        let id = pod_id.to_string();
        Ok(self
            .db
            .call(move |db| db.set_pod_state(&id, status, container_id.as_deref()))
            .await?)
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> Arc<PodLocks> {
        Arc::clone(&self.locks)
    }
}

//! Container engine adapter: a thin wrapper over the local Docker daemon
//! plus the `git` CLI for fetching build contexts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{
    BuildInfo, ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use futures_util::StreamExt;
use rand::RngCore;

use crate::errors::EngineError;

/// The single port application containers are expected to listen on.
pub const CONTAINER_PORT: &str = "80/tcp";

/// Everything needed to create and start one pod container.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub image: String,
    pub container_name: String,
    pub pod_id: String,
    pub domain: String,
    pub port: i64,
    pub env: Vec<(String, String)>,
}

/// One envelope of the daemon's streamed build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Stream(String),
    Error(String),
    Done,
}

impl From<BuildInfo> for BuildEvent {
    fn from(info: BuildInfo) -> Self {
        if let Some(error) = info.error {
            let detail = info
                .error_detail
                .and_then(|d| d.message)
                .filter(|m| !m.is_empty() && *m != error);
            let message = match detail {
                Some(detail) => format!("{}: {}", error, detail),
                None => error,
            };
            BuildEvent::Error(message)
        } else if let Some(text) = info.stream {
            BuildEvent::Stream(text)
        } else {
            BuildEvent::Done
        }
    }
}

/// Capability surface the orchestrator needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Shallow-clone `branch` of `repo_url` into `dest`. A token, when
    /// supplied, is injected into the URL userinfo; interactive credential
    /// prompts are disabled.
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<(), EngineError>;

    /// Build an image from `context`, invoking `sink` once per informational
    /// stream chunk. Any error envelope fails the build.
    async fn build(
        &self,
        context: &Path,
        dockerfile: &str,
        tag: &str,
        sink: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<(), EngineError>;

    /// Create and start a container, returning its id. Reverse-proxy labels
    /// are always attached.
    async fn run(&self, opts: RunOpts) -> Result<String, EngineError>;

    /// Graceful stop with a bounded timeout before the daemon force-kills.
    async fn stop(&self, container_id: &str, timeout_secs: i64) -> Result<(), EngineError>;

    /// Force-remove a container.
    async fn remove(&self, container_id: &str) -> Result<(), EngineError>;

    /// Last `n` lines of stdout+stderr, demultiplexed by the engine client
    /// rather than by stripping framing bytes.
    async fn log_lines(&self, container_id: &str, n: usize) -> Result<Vec<String>, EngineError>;
}

/// Adapter backed by the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, EngineError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<(), EngineError> {
        let url = match token {
            Some(token) => with_token(repo_url, token),
            None => repo_url.to_string(),
        };

        let output = tokio::process::Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, &url])
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await?;

        if !output.status.success() {
            return Err(EngineError::Clone {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn build(
        &self,
        context: &Path,
        dockerfile: &str,
        tag: &str,
        sink: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<(), EngineError> {
        let context = context.to_path_buf();
        let tar_bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| EngineError::Engine(format!("tar task panicked: {}", e)))??;

        let options = BuildImageOptionsBuilder::default()
            .dockerfile(dockerfile)
            .t(tag)
            .rm(true)
            .build();

        let mut stream =
            self.docker
                .build_image(options, None, Some(bollard::body_full(tar_bytes.into())));
        while let Some(chunk) = stream.next().await {
            match BuildEvent::from(chunk?) {
                BuildEvent::Stream(text) => sink(&text),
                BuildEvent::Error(message) => return Err(EngineError::Build { message }),
                BuildEvent::Done => {}
            }
        }
        Ok(())
    }

    async fn run(&self, opts: RunOpts) -> Result<String, EngineError> {
        let mut labels = HashMap::new();
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            format!("traefik.http.routers.{}.rule", opts.pod_id),
            format!("Host(`{}`)", opts.domain),
        );
        labels.insert(
            format!("traefik.http.services.{}.loadbalancer.server.port", opts.pod_id),
            opts.port.to_string(),
        );
        labels.insert("deeploy.pod.id".to_string(), opts.pod_id.clone());

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let body = ContainerCreateBody {
            image: Some(opts.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(HashMap::from([(
                CONTAINER_PORT.to_string(),
                HashMap::new(),
            )])),
            host_config: Some(HostConfig {
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default()
            .name(&opts.container_name)
            .build();
        let created = self.docker.create_container(Some(options), body).await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await?;
        Ok(created.id)
    }

    async fn stop(&self, container_id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        let options = StopContainerOptionsBuilder::default()
            .t(timeout_secs as i32)
            .build();
        self.docker.stop_container(container_id, Some(options)).await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn log_lines(&self, container_id: &str, n: usize) -> Result<Vec<String>, EngineError> {
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&n.to_string())
            .build();
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    let text = String::from_utf8_lossy(&message);
                    lines.extend(text.lines().map(|l| l.to_string()));
                }
                _ => {}
            }
        }
        Ok(lines)
    }
}

/// Inject a credential into the userinfo component of an HTTP(S) remote.
fn with_token(url: &str, token: &str) -> String {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return format!("{}{}@{}", scheme, token, rest);
        }
    }
    url.to_string()
}

/// Directory-name component derived from a repo URL.
pub fn repo_name_from_url(repo_url: &str) -> String {
    let name = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or_default();
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}

/// Best-effort recursive removal.
pub fn cleanup(path: &Path) {
    if let Err(err) = std::fs::remove_dir_all(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

/// Per-invocation clone/build directory, removed on every exit path
/// (including cancellation) when the guard drops.
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path, repo_name: &str) -> std::io::Result<Self> {
        let mut nonce = [0u8; 4];
        rand::rng().fill_bytes(&mut nonce);
        let nonce: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();
        let path = root.join(format!("{}-{}-{}", repo_name, std::process::id(), nonce));
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        cleanup(&self.path);
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory engine used by orchestrator and API tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct FakeEngine {
        pub calls: Mutex<Vec<String>>,
        pub fail_clone: bool,
        pub fail_build: bool,
        pub fail_run: bool,
        pub fail_stop: bool,
        pub stored_logs: Vec<String>,
        pub counter: AtomicU32,
    }

    impl FakeEngine {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn clone_repo(
            &self,
            repo_url: &str,
            branch: &str,
            token: Option<&str>,
            _dest: &Path,
        ) -> Result<(), EngineError> {
            self.calls.lock().unwrap().push(format!(
                "clone {} {} token={}",
                repo_url,
                branch,
                token.is_some()
            ));
            if self.fail_clone {
                return Err(EngineError::Clone {
                    stderr: "fatal: could not read from remote repository".to_string(),
                });
            }
            Ok(())
        }

        async fn build(
            &self,
            _context: &Path,
            dockerfile: &str,
            tag: &str,
            sink: &(dyn Fn(&str) + Send + Sync),
        ) -> Result<(), EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("build {} {}", dockerfile, tag));
            if self.fail_build {
                return Err(EngineError::Build {
                    message: "The command '/bin/sh -c exit 1' returned a non-zero code: 1"
                        .to_string(),
                });
            }
            sink("Step 1/1 : FROM scratch\n");
            Ok(())
        }

        async fn run(&self, opts: RunOpts) -> Result<String, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("run {} {}", opts.container_name, opts.domain));
            if self.fail_run {
                return Err(EngineError::Engine("failed to start container".to_string()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("container-{}", n))
        }

        async fn stop(&self, container_id: &str, _timeout_secs: i64) -> Result<(), EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {}", container_id));
            if self.fail_stop {
                return Err(EngineError::Engine("failed to stop container".to_string()));
            }
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("remove {}", container_id));
            Ok(())
        }

        async fn log_lines(
            &self,
            container_id: &str,
            n: usize,
        ) -> Result<Vec<String>, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("logs {} {}", container_id, n));
            Ok(self.stored_logs.iter().rev().take(n).rev().cloned().collect())
        }
    }
}

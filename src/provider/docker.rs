//! Docker-backed sandbox provider.
//!
//! One container per instance, named `orzbob-sandbox-<id>`, running the
//! configured runner image (a terminal multiplexer plus the user program).
//! Instance metadata lives in container labels so `get`/`list` reconstruct
//! instances from the daemon; labels added after create are kept in a
//! process-local overlay because Docker labels are immutable post-create.
//!
//! Secrets are held in process memory and resolved into environment
//! variables at create time. Values never appear in logs.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::terminal::{ChannelReader, TerminalBinder, TerminalSession};

use super::{
    Instance, InstanceSpec, InstanceStatus, Provider, ProviderError, ProviderKind, Secret,
};

/// Container name prefix for sandbox containers.
const CONTAINER_PREFIX: &str = "orzbob-sandbox-";

/// Label holding the instance id on sandbox containers.
const INSTANCE_LABEL: &str = "orzbob.io/instance-id";

/// Label holding the tier on sandbox containers.
const TIER_LABEL: &str = "orzbob.io/tier";

/// Label holding the comma-joined secret names on sandbox containers.
const SECRETS_LABEL: &str = "orzbob.io/secrets";

/// tmux session the runner image starts; terminal attach targets it.
const TMUX_SESSION: &str = "main";

/// Namespace reported for secrets.
const DOCKER_NAMESPACE: &str = "default";

/// Per-tier container resource budgets.
fn tier_budget(tier: &str) -> (i64, i64) {
    // (memory bytes, nano CPUs)
    let (memory_mb, milli_cpus): (i64, i64) = match tier {
        "medium" => (4096, 2000),
        "large" => (8192, 4000),
        "gpu" => (16384, 8000),
        // Unknown tiers get the small budget; the API layer validates the
        // tier set before requests reach the provider.
        _ => (2048, 1000),
    };
    (
        memory_mb.saturating_mul(1024).saturating_mul(1024),
        milli_cpus.saturating_mul(1_000_000),
    )
}

/// Docker-backed provider implementation.
pub struct DockerProvider {
    docker: Docker,
    runner_image: String,
    secrets: Mutex<HashMap<String, Secret>>,
    /// Labels applied after create; merged over container labels on read.
    label_overlay: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl DockerProvider {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon socket cannot be reached.
    pub fn new(runner_image: String) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;
        Ok(Self {
            docker,
            runner_image,
            secrets: Mutex::new(HashMap::new()),
            label_overlay: Mutex::new(HashMap::new()),
        })
    }

    fn container_name(id: &str) -> String {
        format!("{CONTAINER_PREFIX}{id}")
    }

    /// Pull the runner image if it is not already present.
    async fn ensure_image(&self) -> Result<(), ProviderError> {
        let pull_opts = CreateImageOptions {
            from_image: self.runner_image.clone(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(pull_opts), None, None);
        while let Some(result) = pull_stream.next().await {
            if let Err(e) = result {
                warn!(error = %e, image = %self.runner_image, "image pull warning");
            }
        }
        Ok(())
    }

    async fn instance_from_inspect(&self, id: &str) -> Result<Instance, ProviderError> {
        let name = Self::container_name(id);
        let inspect = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await;

        let state = match inspect {
            Ok(state) => state,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(ProviderError::InstanceNotFound(id.to_owned())),
            Err(e) => return Err(ProviderError::Infrastructure(e.to_string())),
        };

        let running = state
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let status = if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Pending
        };

        let mut labels = state
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let tier = labels.remove(TIER_LABEL).unwrap_or_default();
        let secret_names: Vec<String> = labels
            .remove(SECRETS_LABEL)
            .map(|joined| {
                joined
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        labels.remove(INSTANCE_LABEL);

        if let Some(overlay) = self.label_overlay.lock().await.get(id) {
            labels.extend(overlay.clone());
        }

        let created_at = state
            .created
            .as_deref()
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);

        Ok(Instance {
            id: id.to_owned(),
            tier,
            status,
            created_at,
            secret_names,
            labels,
            handle: state.id,
        })
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn create_instance(&self, spec: InstanceSpec) -> Result<Instance, ProviderError> {
        // Resolve secrets to env entries before touching the daemon.
        let mut env: Vec<String> = Vec::new();
        {
            let secrets = self.secrets.lock().await;
            for name in &spec.secret_names {
                let secret = secrets
                    .get(name)
                    .ok_or_else(|| ProviderError::SecretNotFound(name.clone()))?;
                for (key, value) in &secret.data {
                    env.push(format!("{key}={value}"));
                }
            }
        }

        self.ensure_image().await?;

        let id = Uuid::new_v4().to_string();
        let name = Self::container_name(&id);

        let mut labels = spec.labels.clone();
        labels.insert(INSTANCE_LABEL.to_owned(), id.clone());
        labels.insert(TIER_LABEL.to_owned(), spec.tier.clone());
        labels.insert(SECRETS_LABEL.to_owned(), spec.secret_names.join(","));

        let (memory, nano_cpus) = tier_budget(&spec.tier);
        let host_config = HostConfig {
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            cap_drop: Some(vec!["ALL".to_owned()]),
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            pids_limit: Some(512),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(self.runner_image.clone()),
            env: Some(env),
            labels: Some(labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        self.docker
            .create_container(options, container_config)
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        info!(instance_id = %id, tier = %spec.tier, "sandbox container started");

        self.instance_from_inspect(&id).await
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, ProviderError> {
        self.instance_from_inspect(id).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_owned(), vec![INSTANCE_LABEL.to_owned()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        let mut instances = Vec::with_capacity(containers.len());
        for summary in containers {
            let Some(id) = summary
                .labels
                .as_ref()
                .and_then(|l| l.get(INSTANCE_LABEL))
                .cloned()
            else {
                continue;
            };
            match self.instance_from_inspect(&id).await {
                Ok(instance) => instances.push(instance),
                // Raced with a delete between list and inspect.
                Err(ProviderError::InstanceNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(instances)
    }

    async fn delete_instance(&self, id: &str) -> Result<(), ProviderError> {
        // Existence check first so a missing id maps to NotFound, not to
        // the daemon's remove error.
        self.instance_from_inspect(id).await?;

        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&Self::container_name(id), Some(remove_opts))
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        self.label_overlay.lock().await.remove(id);
        debug!(instance_id = %id, "sandbox container removed");
        Ok(())
    }

    async fn label_instance(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ProviderError> {
        self.instance_from_inspect(id).await?;
        self.label_overlay
            .lock()
            .await
            .entry(id.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn create_secret(
        &self,
        name: &str,
        data: HashMap<String, String>,
    ) -> Result<Secret, ProviderError> {
        let mut secrets = self.secrets.lock().await;
        if secrets.contains_key(name) {
            return Err(ProviderError::SecretExists(name.to_owned()));
        }
        let secret = Secret {
            name: name.to_owned(),
            namespace: DOCKER_NAMESPACE.to_owned(),
            created_at: Utc::now(),
            data,
        };
        secrets.insert(name.to_owned(), secret.clone());
        Ok(secret)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, ProviderError> {
        self.secrets
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::SecretNotFound(name.to_owned()))
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, ProviderError> {
        let mut secrets: Vec<Secret> = self.secrets.lock().await.values().cloned().collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ProviderError> {
        self.secrets
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::SecretNotFound(name.to_owned()))
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }
}

#[async_trait]
impl TerminalBinder for DockerProvider {
    /// Attach to the sandbox's tmux session over a TTY exec.
    ///
    /// TTY mode multiplexes stdout and stderr onto one stream, so the
    /// session reports no distinct stderr reader.
    async fn bind(&self, instance_id: &str) -> Result<TerminalSession, ProviderError> {
        self.instance_from_inspect(instance_id).await?;

        let create_exec = CreateExecOptions {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            cmd: Some(vec![
                "tmux".to_owned(),
                "attach-session".to_owned(),
                "-t".to_owned(),
                TMUX_SESSION.to_owned(),
            ]),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(&Self::container_name(instance_id), create_exec)
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| ProviderError::Infrastructure(e.to_string()))?;

        let StartExecResults::Attached { mut output, input } = started else {
            return Err(ProviderError::Infrastructure(
                "exec started detached; expected attached stdio".to_owned(),
            ));
        };

        // Demux the exec output stream into a plain byte channel. The
        // forwarding task ends when the exec finishes or the reader drops.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                let bytes = match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => message.to_vec(),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "terminal output stream ended");
                        break;
                    }
                };
                if tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        Ok(TerminalSession {
            input: Box::new(ExecInput { inner: input }),
            stdout: Box::new(ChannelReader::new(rx)),
            stderr: None,
        })
    }
}

/// Newtype making bollard's pinned exec writer `Unpin` for the session.
struct ExecInput {
    inner: std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
}

impl tokio::io::AsyncWrite for ExecInput {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, ResourcesUlimits};
use bollard::query_parameters::{
    AttachContainerOptions as BollardAttachContainerOptionsQuery,
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StatsOptions as BollardStatsOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

use super::{ContainerRuntime, ContainerSpec, UsageSnapshot};
use crate::demux::{encode_frame, StreamKind};
use crate::errors::RuntimeError;

/// Timeout in seconds for individual requests on the engine socket.
const CLIENT_TIMEOUT_SECS: u64 = 30;

/// `ContainerRuntime` backed by the local Docker engine.
///
/// `bollard::Docker` is a cheap handle over a connection pool and tolerates
/// concurrent use, so one instance is shared by all workers.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect over the given unix socket, or the platform default when `None`.
    pub fn connect(socket_path: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) => Docker::connect_with_socket(
                path,
                CLIENT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
        let ulimits = spec
            .limits
            .ulimits
            .iter()
            .map(|u| ResourcesUlimits {
                name: Some(u.name.to_string()),
                soft: Some(u.soft),
                hard: Some(u.hard),
            })
            .collect();

        let tmpfs: HashMap<String, String> = spec
            .tmpfs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let with_stdin = spec.stdin.is_some();

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(spec.network_disabled),
            tty: Some(false),
            attach_stdin: Some(with_stdin),
            open_stdin: Some(with_stdin),
            stdin_once: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                network_mode: spec.network_disabled.then(|| "none".to_string()),
                readonly_rootfs: Some(spec.readonly_rootfs),
                cap_drop: Some(spec.cap_drop.clone()),
                security_opt: Some(spec.security_opt.clone()),
                memory: Some(spec.limits.memory_bytes),
                memory_swap: Some(spec.limits.memory_swap_bytes),
                nano_cpus: Some(spec.limits.nano_cpus),
                pids_limit: Some(spec.limits.pids_limit),
                ulimits: Some(ulimits),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let container = self
            .docker
            .create_container(options, Self::create_body(spec))
            .await?;
        Ok(container.id)
    }

    async fn start(&self, id: &str, stdin: Option<&str>) -> Result<(), RuntimeError> {
        let Some(input) = stdin else {
            self.docker
                .start_container(id, None::<BollardStartContainerOptionsQuery>)
                .await?;
            return Ok(());
        };

        // attach before start so no input is lost to a fast-exiting program
        let attached = self
            .docker
            .attach_container(
                id,
                Some(BollardAttachContainerOptionsQuery {
                    stdin: true,
                    stream: true,
                    ..Default::default()
                }),
            )
            .await?;
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let mut writer = attached.input;
        writer.write_all(input.as_bytes()).await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(BollardWaitContainerOptionsQuery {
                condition: "not-running".to_string(),
            }),
        );

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; for us it is just an exit code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(RuntimeError::WaitStreamEnded),
        }
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let mut stream = self.docker.logs(
            id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );

        // bollard has already split the frames; re-encode so every runtime
        // hands the runner the same wire format
        let mut raw = Vec::new();
        while let Some(item) = stream.next().await {
            match item? {
                LogOutput::StdOut { message } => encode_frame(StreamKind::Stdout, &message, &mut raw),
                LogOutput::StdErr { message } => encode_frame(StreamKind::Stderr, &message, &mut raw),
                _ => {}
            }
        }
        Ok(raw)
    }

    async fn stats(&self, id: &str) -> Result<UsageSnapshot, RuntimeError> {
        let mut stream = self.docker.stats(
            id,
            Some(BollardStatsOptionsQuery {
                stream: false,
                one_shot: true,
            }),
        );

        match stream.next().await {
            Some(Ok(stats)) => {
                let memory = stats.memory_stats;
                Ok(UsageSnapshot {
                    memory_usage_bytes: memory.as_ref().and_then(|m| m.usage),
                    memory_max_usage_bytes: memory.as_ref().and_then(|m| m.max_usage),
                })
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(UsageSnapshot::default()),
        }
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .stop_container(
                id,
                Some(BollardStopContainerOptionsQuery {
                    t: Some(0),
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .remove_container(
                id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::compute_resource_limits;
    use std::collections::BTreeMap;

    fn sample_spec(stdin: Option<&str>) -> ContainerSpec {
        let mut tmpfs = BTreeMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=8m".to_string());
        ContainerSpec {
            name: "sandbox-test".to_string(),
            image: "sandbox-python-runner:latest".to_string(),
            cmd: vec!["python3".into(), "-c".into(), "print(1)".into()],
            env: vec![],
            stdin: stdin.map(str::to_string),
            user: "sandbox".to_string(),
            working_dir: "/sandbox".to_string(),
            network_disabled: true,
            readonly_rootfs: true,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges:true".to_string()],
            limits: compute_resource_limits("128m", 0.5),
            tmpfs,
        }
    }

    #[test]
    fn test_create_body_maps_hardening() {
        let body = DockerRuntime::create_body(&sample_spec(None));
        let host = body.host_config.unwrap();

        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(body.user.as_deref(), Some("sandbox"));
        assert_eq!(body.env, None);
        assert_eq!(body.open_stdin, Some(false));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(host.ulimits.unwrap().len(), 2);
        assert_eq!(
            host.tmpfs.unwrap().get("/tmp").map(String::as_str),
            Some("rw,noexec,nosuid,size=8m")
        );
    }

    #[test]
    fn test_create_body_opens_stdin_only_when_given() {
        let body = DockerRuntime::create_body(&sample_spec(Some("42\n")));
        assert_eq!(body.attach_stdin, Some(true));
        assert_eq!(body.open_stdin, Some(true));
        assert_eq!(body.stdin_once, Some(true));
    }

    #[tokio::test]
    #[ignore] // Requires a local Docker daemon
    async fn test_ping_local_daemon() {
        let runtime = DockerRuntime::connect(None).unwrap();
        assert!(runtime.ping().await.is_ok());
    }
}

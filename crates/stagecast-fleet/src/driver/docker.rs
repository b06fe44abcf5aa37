// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker implementation of the workload driver.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, ContainerStatsResponse, ContainerSummaryStateEnum,
    ContainerUpdateBody, HostConfig, Port, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
    WaitContainerOptions,
};
use futures_util::stream::TryStreamExt;
use tracing::{debug, info, warn};

use crate::driver::traits::{
    DriverError, DriverResult, ResourceLimits, RuntimeState, WorkloadDriver, WorkloadSpec,
    WorkloadStats, WorkloadSummary,
};

/// Driver backed by a local Docker daemon.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the platform defaults (unix socket or named pipe).
    pub fn connect() -> DriverResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Runtime(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    async fn logs_inner(&self, name: &str, tail: usize) -> DriverResult<String> {
        let options = Some(LogsOptions {
            stdout: true,
            stderr: true,
            since: 0,
            until: 0,
            timestamps: false,
            follow: false,
            tail: if tail == 0 {
                "all".to_string()
            } else {
                tail.to_string()
            },
        });

        let mut stream = self.docker.logs(name, options);
        let mut output = String::new();
        while let Some(entry) = stream
            .try_next()
            .await
            .map_err(|e| map_bollard_error(name, e))?
        {
            match entry {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
        Ok(output)
    }
}

fn map_bollard_error(name: &str, error: bollard::errors::Error) -> DriverError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(name.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409, ..
        } => DriverError::AlreadyExists(name.to_string()),
        other => DriverError::Runtime(other.to_string()),
    }
}

fn build_create_body(spec: &WorkloadSpec) -> ContainerCreateBody {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let port_bindings = spec.port.map(|port| {
        let mut bindings = HashMap::new();
        bindings.insert(
            format!("{port}/tcp"),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
        bindings
    });

    let restart_policy = spec.restart_unless_stopped.then(|| RestartPolicy {
        name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        maximum_retry_count: None,
    });

    let host_config = HostConfig {
        port_bindings,
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        memory: Some(spec.resources.memory_bytes),
        memory_swap: Some(spec.resources.memory_swap_bytes),
        cpu_shares: Some(spec.resources.cpu_shares),
        restart_policy,
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(env),
        labels: if spec.labels.is_empty() {
            None
        } else {
            Some(spec.labels.clone())
        },
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn map_state(status: Option<ContainerStateStatusEnum>, running: Option<bool>) -> RuntimeState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => RuntimeState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => RuntimeState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => RuntimeState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => RuntimeState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => RuntimeState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => RuntimeState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => RuntimeState::Dead,
        // No status string; fall back to the running flag.
        _ => match running {
            Some(true) => RuntimeState::Running,
            Some(false) => RuntimeState::Exited,
            None => RuntimeState::NotFound,
        },
    }
}

fn map_summary_state(state: Option<ContainerSummaryStateEnum>) -> RuntimeState {
    match state {
        Some(ContainerSummaryStateEnum::CREATED) => RuntimeState::Created,
        Some(ContainerSummaryStateEnum::RUNNING) => RuntimeState::Running,
        Some(ContainerSummaryStateEnum::PAUSED) => RuntimeState::Paused,
        Some(ContainerSummaryStateEnum::RESTARTING) => RuntimeState::Restarting,
        Some(ContainerSummaryStateEnum::REMOVING) => RuntimeState::Removing,
        Some(ContainerSummaryStateEnum::EXITED) => RuntimeState::Exited,
        Some(ContainerSummaryStateEnum::DEAD) => RuntimeState::Dead,
        _ => RuntimeState::NotFound,
    }
}

/// Host ports from a container listing. The daemon reports one entry per
/// bound interface, so duplicates are collapsed.
fn host_ports(ports: Option<Vec<Port>>) -> Vec<u16> {
    let mut out: Vec<u16> = ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.public_port)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// CPU usage as a percentage of all host CPUs, from two consecutive samples.
fn cpu_percent(
    cpu_total: u64,
    precpu_total: u64,
    system_total: u64,
    presystem_total: u64,
    online_cpus: u32,
) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
    let system_delta = system_total.saturating_sub(presystem_total) as f64;
    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * f64::from(online_cpus) * 100.0
    } else {
        0.0
    }
}

fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit > 0 {
        (usage as f64 / limit as f64) * 100.0
    } else {
        0.0
    }
}

fn extract_stats(response: &ContainerStatsResponse) -> WorkloadStats {
    let cpu_total = response
        .cpu_stats
        .as_ref()
        .and_then(|c| c.cpu_usage.as_ref())
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let precpu_total = response
        .precpu_stats
        .as_ref()
        .and_then(|c| c.cpu_usage.as_ref())
        .and_then(|u| u.total_usage)
        .unwrap_or(0);
    let system_total = response
        .cpu_stats
        .as_ref()
        .and_then(|c| c.system_cpu_usage)
        .unwrap_or(0);
    let presystem_total = response
        .precpu_stats
        .as_ref()
        .and_then(|c| c.system_cpu_usage)
        .unwrap_or(0);
    let online_cpus = response
        .cpu_stats
        .as_ref()
        .and_then(|c| c.online_cpus)
        .unwrap_or(1);

    let memory_usage = response
        .memory_stats
        .as_ref()
        .and_then(|m| m.usage)
        .unwrap_or(0);
    let memory_limit = response
        .memory_stats
        .as_ref()
        .and_then(|m| m.limit)
        .unwrap_or(0);

    let (network_rx_bytes, network_tx_bytes) = response
        .networks
        .as_ref()
        .map(|interfaces| {
            interfaces.values().fold((0u64, 0u64), |(rx, tx), net| {
                (
                    rx + net.rx_bytes.unwrap_or(0),
                    tx + net.tx_bytes.unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    WorkloadStats {
        cpu_percent: cpu_percent(
            cpu_total,
            precpu_total,
            system_total,
            presystem_total,
            online_cpus,
        ),
        memory_percent: memory_percent(memory_usage, memory_limit),
        network_rx_bytes,
        network_tx_bytes,
    }
}

#[async_trait]
impl WorkloadDriver for DockerDriver {
    fn driver_type(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &WorkloadSpec) -> DriverResult<()> {
        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        });
        let body = build_create_body(spec);

        self.docker
            .create_container(options, body)
            .await
            .map_err(|e| map_bollard_error(&spec.name, e))?;
        debug!(workload = %spec.name, image = %spec.image, "Created workload");
        Ok(())
    }

    async fn start(&self, name: &str) -> DriverResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_bollard_error(name, e))?;
        debug!(workload = %name, "Started workload");
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> DriverResult<()> {
        let options = Some(StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            ..Default::default()
        });
        self.docker
            .stop_container(name, options)
            .await
            .map_err(|e| map_bollard_error(name, e))?;
        debug!(workload = %name, "Stopped workload");
        Ok(())
    }

    async fn remove(&self, name: &str) -> DriverResult<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        self.docker
            .remove_container(name, options)
            .await
            .map_err(|e| map_bollard_error(name, e))?;
        debug!(workload = %name, "Removed workload");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> RuntimeState {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => match details.state {
                Some(state) => map_state(state.status, state.running),
                None => RuntimeState::NotFound,
            },
            Err(e) => {
                debug!(workload = %name, error = %e, "Inspect failed, reporting not_found");
                RuntimeState::NotFound
            }
        }
    }

    async fn stats(&self, name: &str) -> WorkloadStats {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: false,
        });
        let mut stream = self.docker.stats(name, options);
        match stream.try_next().await {
            Ok(Some(response)) => extract_stats(&response),
            Ok(None) => WorkloadStats::default(),
            Err(e) => {
                debug!(workload = %name, error = %e, "Stats failed, reporting zeroed usage");
                WorkloadStats::default()
            }
        }
    }

    async fn logs(&self, name: &str, tail: usize) -> String {
        match self.logs_inner(name, tail).await {
            Ok(output) => output,
            Err(e) => {
                debug!(workload = %name, error = %e, "Log fetch failed, returning empty");
                String::new()
            }
        }
    }

    async fn update_resources(&self, name: &str, limits: &ResourceLimits) -> DriverResult<()> {
        let body = ContainerUpdateBody {
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_swap_bytes),
            cpu_shares: Some(limits.cpu_shares),
            ..Default::default()
        };
        self.docker
            .update_container(name, body)
            .await
            .map_err(|e| map_bollard_error(name, e))?;
        info!(workload = %name, memory_bytes = limits.memory_bytes, cpu_shares = limits.cpu_shares,
            "Updated workload resources");
        Ok(())
    }

    async fn list_by_label(&self, label: &str) -> DriverResult<Vec<WorkloadSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_bollard_error(label, e))?;

        // The listing already carries state and port bindings; no per-container
        // inspect round-trips.
        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let name = container
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(WorkloadSummary {
                    name,
                    labels: container.labels.unwrap_or_default(),
                    state: map_summary_state(container.state),
                    ports: host_ports(container.ports),
                })
            })
            .collect())
    }

    async fn remove_if_exited(&self, label: &str) -> DriverResult<u64> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        filters.insert(
            "status".to_string(),
            vec!["exited".to_string(), "dead".to_string()],
        );

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_bollard_error(label, e))?;

        let mut removed = 0u64;
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.remove(&id).await {
                Ok(()) => {
                    info!(container_id = %id, "Reclaimed exited workload");
                    removed += 1;
                }
                Err(e) => {
                    warn!(container_id = %id, error = %e, "Failed to reclaim exited workload");
                }
            }
        }
        Ok(removed)
    }

    async fn wait(&self, name: &str, timeout: Duration) -> DriverResult<i64> {
        let options = Some(WaitContainerOptions::default());
        let mut stream = self.docker.wait_container(name, options);

        let next = tokio::time::timeout(timeout, stream.try_next())
            .await
            .map_err(|_| DriverError::Timeout {
                operation: "wait",
                name: name.to_string(),
                seconds: timeout.as_secs(),
            })?;

        match next {
            Ok(Some(response)) => Ok(response.status_code),
            Ok(None) => Ok(0),
            Err(e) => Err(map_bollard_error(name, e)),
        }
    }
}

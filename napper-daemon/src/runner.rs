//! External command execution against the container runtime and proxy.
//!
//! The `ContainerRuntime` trait is the seam to the outside world: list,
//! start, stop, kill, log-tail, maintenance toggle. `DockerRuntime` shells
//! out to the docker CLI; everything above it is runtime-agnostic and
//! funnels through `execute_with_retry`.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{NapperError, Result};
use crate::hostname::service_for_host;

/// Lines of proxy log tailed during discovery
const DISCOVERY_LOG_LINES: usize = 500;

/// Routing-rule label value, e.g. ``Host(`app.example.com`)``
static HOST_RULE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Host\(`([^`]+)`\)").unwrap());

/// Container state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Created,
    Other,
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "exited" => Self::Exited,
            "created" => Self::Created,
            _ => Self::Other,
        }
    }

    /// Eligible to be started
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Exited | Self::Created)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

/// Discovery result for one application
#[derive(Debug, Clone, PartialEq)]
pub struct AppInfo {
    pub service: String,
    pub container_name: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Abstract container-runtime operations. Any runtime exposing these
/// semantics suffices; command strings are an implementation choice.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers in any state matching a label filter
    /// (`service` or `service=name`).
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn kill_container(&self, name: &str) -> Result<()>;

    /// Tail of a container's stdout/stderr, newest lines last.
    async fn tail_logs(&self, container: &str, lines: usize) -> Result<String>;

    /// Toggle the proxy's maintenance flag for a service.
    async fn set_maintenance(&self, service: &str, enabled: bool) -> Result<()>;
}

/// docker-CLI implementation
pub struct DockerRuntime {
    proxy_container: String,
}

impl DockerRuntime {
    pub fn new(proxy_container: impl Into<String>) -> Self {
        Self {
            proxy_container: proxy_container.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NapperError::Command {
                operation: format!("docker {}", args.join(" ")),
                attempts: 1,
                message: e.to_string(),
            })?;

        if output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(combined)
        } else {
            Err(NapperError::Command {
                operation: format!("docker {}", args.join(" ")),
                attempts: 1,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let filter = format!("label={}", label);
        let output = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.Names}}\t{{.State}}\t{{.Labels}}",
            ])
            .await?;

        let containers = output
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                let state = ContainerState::parse(parts.next().unwrap_or(""));
                let labels = parse_labels(parts.next().unwrap_or(""));
                Some(ContainerInfo {
                    name: name.to_string(),
                    state,
                    labels,
                })
            })
            .collect();
        Ok(containers)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker(&["start", name]).await.map(|_| ())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.docker(&["stop", name]).await.map(|_| ())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.docker(&["kill", name]).await.map(|_| ())
    }

    async fn tail_logs(&self, container: &str, lines: usize) -> Result<String> {
        let tail = lines.to_string();
        self.docker(&["logs", "--tail", &tail, container]).await
    }

    async fn set_maintenance(&self, service: &str, enabled: bool) -> Result<()> {
        let subcommand = if enabled { "maintenance" } else { "resume" };
        self.docker(&[
            "exec",
            &self.proxy_container,
            "kamal-proxy",
            subcommand,
            service,
        ])
        .await
        .map(|_| ())
    }
}

/// Comma-separated `k=v` pairs from docker's `{{.Labels}}` column
fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// High-level command surface used by the supervisor.
pub struct Runner {
    runtime: Arc<dyn ContainerRuntime>,
    max_retries: u32,
    proxy_container: String,
}

impl Runner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        max_retries: u32,
        proxy_container: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            max_retries,
            proxy_container: proxy_container.into(),
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// Run an operation with up to `max_retries` extra attempts, sleeping
    /// `2^attempt` seconds between attempts.
    pub async fn execute_with_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", operation, attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    }
                }
            }
        }

        Err(NapperError::Command {
            operation: operation.to_string(),
            attempts,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Start the first startable container of the host's service.
    /// Returns false when no candidate container exists.
    pub async fn start_app_container(&self, host: &str) -> Result<bool> {
        let service = service_for_host(host).to_string();
        let label = format!("service={}", service);

        self.execute_with_retry(&format!("start app '{}'", service), || {
            let label = label.clone();
            let service = service.clone();
            async move {
                let containers = self.runtime.list_containers(&label).await?;
                match containers.iter().find(|c| c.state.is_startable()) {
                    Some(container) => {
                        info!("Starting container {} for service {}", container.name, service);
                        self.runtime.start_container(&container.name).await?;
                        Ok(true)
                    }
                    None => {
                        debug!("No startable container for service {}", service);
                        Ok(false)
                    }
                }
            }
        })
        .await
    }

    /// Stop the first running container of the host's service.
    /// Returns false when nothing is running.
    pub async fn stop_app_container(&self, host: &str) -> Result<bool> {
        let service = service_for_host(host).to_string();
        let label = format!("service={}", service);

        self.execute_with_retry(&format!("stop app '{}'", service), || {
            let label = label.clone();
            let service = service.clone();
            async move {
                let containers = self.runtime.list_containers(&label).await?;
                match containers.iter().find(|c| c.state == ContainerState::Running) {
                    Some(container) => {
                        info!("Stopping container {} for service {}", container.name, service);
                        self.runtime.stop_container(&container.name).await?;
                        Ok(true)
                    }
                    None => {
                        debug!("No running container for service {}", service);
                        Ok(false)
                    }
                }
            }
        })
        .await
    }

    /// Hard-kill the host's container. Failure is tolerated.
    pub async fn force_stop_app_container(&self, host: &str) -> bool {
        let service = service_for_host(host);
        let label = format!("service={}", service);

        let containers = match self.runtime.list_containers(&label).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Force-stop discovery failed for {}: {}", service, e);
                return false;
            }
        };

        let target = containers
            .iter()
            .find(|c| c.state == ContainerState::Running)
            .or_else(|| containers.first());
        match target {
            Some(container) => match self.runtime.kill_container(&container.name).await {
                Ok(()) => {
                    info!("Force-killed container {} for service {}", container.name, service);
                    true
                }
                Err(e) => {
                    warn!("Force-kill of {} failed: {}", container.name, e);
                    false
                }
            },
            None => false,
        }
    }

    /// Enable or disable proxy maintenance for a host. Errors are logged
    /// and swallowed; maintenance must never abort a lifecycle path.
    pub async fn set_maintenance(&self, host: &str, enabled: bool) {
        let service = service_for_host(host);
        if let Err(e) = self.runtime.set_maintenance(service, enabled).await {
            warn!(
                "Failed to {} maintenance for {}: {}",
                if enabled { "enable" } else { "disable" },
                host,
                e
            );
        }
    }

    /// Discover applications managed on this host: every container carrying
    /// a `service` label (except the proxy itself), plus hostnames observed
    /// in the proxy's own log.
    pub async fn discover_kamal_apps(&self) -> HashMap<String, AppInfo> {
        let mut apps = HashMap::new();

        match self.runtime.list_containers("service").await {
            Ok(containers) => {
                for container in containers {
                    if container.labels.get("role").is_some_and(|r| r == "proxy") {
                        continue;
                    }
                    let Some(service) = container.labels.get("service").cloned() else {
                        continue;
                    };
                    let host = container
                        .labels
                        .values()
                        .find_map(|value| host_from_rule(value))
                        .unwrap_or_else(|| service.clone());

                    apps.entry(host).or_insert(AppInfo {
                        service,
                        container_name: Some(container.name),
                        labels: container.labels,
                    });
                }
            }
            Err(e) => debug!("Container discovery failed: {}", e),
        }

        match self
            .runtime
            .tail_logs(&self.proxy_container, DISCOVERY_LOG_LINES)
            .await
        {
            Ok(logs) => {
                for capture in HOST_RULE.captures_iter(&logs) {
                    let host = capture[1].to_string();
                    apps.entry(host.clone()).or_insert_with(|| AppInfo {
                        service: service_for_host(&host).to_string(),
                        container_name: None,
                        labels: HashMap::new(),
                    });
                }
            }
            Err(e) => debug!("Proxy log discovery failed: {}", e),
        }

        apps
    }
}

fn host_from_rule(value: &str) -> Option<String> {
    HOST_RULE
        .captures(value)
        .map(|capture| capture[1].to_string())
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted runtime that records every call.
    #[derive(Default)]
    pub struct MockRuntime {
        pub containers: Mutex<Vec<ContainerInfo>>,
        pub logs: Mutex<HashMap<String, String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_listing: Mutex<bool>,
    }

    impl MockRuntime {
        pub fn with_containers(containers: Vec<ContainerInfo>) -> Arc<Self> {
            let mock = Self::default();
            *mock.containers.lock() = containers;
            Arc::new(mock)
        }

        pub fn set_logs(&self, container: &str, content: &str) {
            self.logs
                .lock()
                .insert(container.to_string(), content.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn calls_matching(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        fn set_state(&self, name: &str, state: ContainerState) {
            for container in self.containers.lock().iter_mut() {
                if container.name == name {
                    container.state = state;
                }
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
            if *self.fail_listing.lock() {
                return Err(NapperError::Command {
                    operation: "list".to_string(),
                    attempts: 1,
                    message: "runtime unavailable".to_string(),
                });
            }
            let containers = self.containers.lock();
            let matching = match label.split_once('=') {
                Some((key, value)) => containers
                    .iter()
                    .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
                    .cloned()
                    .collect(),
                None => containers
                    .iter()
                    .filter(|c| c.labels.contains_key(label))
                    .cloned()
                    .collect(),
            };
            Ok(matching)
        }

        async fn start_container(&self, name: &str) -> Result<()> {
            self.record(format!("start {}", name));
            self.set_state(name, ContainerState::Running);
            Ok(())
        }

        async fn stop_container(&self, name: &str) -> Result<()> {
            self.record(format!("stop {}", name));
            self.set_state(name, ContainerState::Exited);
            Ok(())
        }

        async fn kill_container(&self, name: &str) -> Result<()> {
            self.record(format!("kill {}", name));
            self.set_state(name, ContainerState::Exited);
            Ok(())
        }

        async fn tail_logs(&self, container: &str, _lines: usize) -> Result<String> {
            self.logs
                .lock()
                .get(container)
                .cloned()
                .ok_or_else(|| NapperError::Command {
                    operation: format!("logs {}", container),
                    attempts: 1,
                    message: "no such container".to_string(),
                })
        }

        async fn set_maintenance(&self, service: &str, enabled: bool) -> Result<()> {
            self.record(format!(
                "maintenance {} {}",
                service,
                if enabled { "on" } else { "off" }
            ));
            Ok(())
        }
    }

    /// A container carrying a `service` label, optionally with a Host(...)
    /// routing rule.
    pub fn container(
        name: &str,
        service: &str,
        state: ContainerState,
        host_rule: Option<&str>,
    ) -> ContainerInfo {
        let mut labels = HashMap::new();
        labels.insert("service".to_string(), service.to_string());
        if let Some(host) = host_rule {
            labels.insert(
                "traefik.http.routers.app.rule".to_string(),
                format!("Host(`{}`)", host),
            );
        }
        ContainerInfo {
            name: name.to_string(),
            state,
            labels,
        }
    }
}

#[cfg(test)]
mod tests;

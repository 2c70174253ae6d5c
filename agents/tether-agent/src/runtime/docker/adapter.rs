//! Docker Host
//!
//! Implementation of RuntimeHost for Docker using the bollard library. Each
//! unit is a container created from a JSON [`UnitDescriptor`] artifact.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::ContainerStateStatusEnum;
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::runtime::adapter::{RuntimeHost, Unit, UnitId, UnitState};

const MANAGED_LABEL: &str = "tether.managed";
const LOCATION_LABEL: &str = "tether.location";
const STOP_TIMEOUT_SECS: i64 = 30;

/// Host event codes emitted for container lifecycle changes
pub const EVENT_STARTED: i32 = 1;
pub const EVENT_DIED: i32 = 2;
pub const EVENT_STOPPED: i32 = 3;
pub const EVENT_DESTROYED: i32 = 4;

/// Artifact content understood by the Docker host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub image: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl UnitDescriptor {
    pub fn parse(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content).context("Invalid unit descriptor")
    }
}

#[derive(Debug, Clone)]
struct DockerUnit {
    location: String,
    container_id: String,
}

/// Docker runtime host
pub struct DockerHost {
    client: Docker,
    network: Option<String>,
    units: DashMap<UnitId, DockerUnit>,
    next_id: AtomicU64,
    events: broadcast::Sender<i32>,
    watching: AtomicBool,
}

impl DockerHost {
    /// Create a new Docker host connecting to the default socket
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_socket_defaults()
            .context("Failed to connect to Docker socket")?;
        Ok(Self::with_client(client))
    }

    /// Create a new Docker host with a custom socket path
    pub fn with_socket(socket_path: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .context("Failed to connect to Docker socket")?;
        Ok(Self::with_client(client))
    }

    fn with_client(client: Docker) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client,
            network: None,
            units: DashMap::new(),
            next_id: AtomicU64::new(1),
            events,
            watching: AtomicBool::new(false),
        }
    }

    /// Attach created containers to `network`
    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    pub async fn version(&self) -> Result<String> {
        let version = self.client.version().await?;
        Ok(format!(
            "Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ))
    }

    /// Register containers left behind by a previous run. Returns the number
    /// of adopted units.
    pub async fn adopt_existing(&self) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let mut adopted = 0;
        for container in self.client.list_containers(Some(options)).await? {
            let (Some(container_id), Some(location)) = (
                container.id,
                container
                    .labels
                    .and_then(|labels| labels.get(LOCATION_LABEL).cloned()),
            ) else {
                continue;
            };
            if self.find(&location).is_some() {
                continue;
            }
            let id = self.allocate_id();
            debug!(unit_id = %id, location = %location, "Adopted existing container");
            self.units.insert(
                id,
                DockerUnit {
                    location,
                    container_id,
                },
            );
            adopted += 1;
        }

        info!(count = adopted, "Adopted existing units");
        Ok(adopted)
    }

    fn allocate_id(&self) -> UnitId {
        UnitId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn find(&self, location: &str) -> Option<(UnitId, DockerUnit)> {
        self.units
            .iter()
            .find(|entry| entry.value().location == location)
            .map(|entry| (*entry.key(), entry.value().clone()))
    }

    fn lookup(&self, id: UnitId) -> Result<DockerUnit> {
        self.units
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("No container registered for unit {}", id))
    }

    /// Docker container name for a unit location
    pub fn container_name(location: &str) -> String {
        let sanitized: String = location
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("tether-{}", sanitized.trim_matches('-'))
    }

    fn parse_state(status: Option<&ContainerStateStatusEnum>) -> UnitState {
        match status {
            Some(ContainerStateStatusEnum::RUNNING) => UnitState::Active,
            Some(ContainerStateStatusEnum::RESTARTING) => UnitState::Starting,
            Some(ContainerStateStatusEnum::REMOVING) => UnitState::Stopping,
            Some(ContainerStateStatusEnum::DEAD) => UnitState::Uninstalled,
            _ => UnitState::Resolved,
        }
    }

    fn event_code(action: &str) -> Option<i32> {
        match action {
            "start" => Some(EVENT_STARTED),
            "die" => Some(EVENT_DIED),
            "stop" => Some(EVENT_STOPPED),
            "destroy" => Some(EVENT_DESTROYED),
            _ => None,
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result.with_context(|| format!("Failed to pull image {}", image))?;
            if let Some(status) = info.status {
                debug!(status = %status, "Pulling image");
            }
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Remove a container, treating an already-missing one as removed
    async fn remove_container(&self, id_or_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id_or_name, Some(options)).await {
            Ok(()) => {
                info!(container = %id_or_name, "Container removed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create the container for `location` from `content`, replacing any
    /// container already using its name
    async fn create_container(&self, location: &str, content: &[u8]) -> Result<String> {
        let descriptor = UnitDescriptor::parse(content)?;
        self.pull_image(&descriptor.image).await?;

        let name = Self::container_name(location);
        self.remove_container(&name).await?;

        let env: Vec<String> = descriptor
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = descriptor.labels;
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(LOCATION_LABEL.to_string(), location.to_string());

        let host_config = bollard::service::HostConfig {
            network_mode: self.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(descriptor.image),
            cmd: descriptor.command,
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), config)
            .await
            .with_context(|| format!("Failed to create container {}", name))?;
        info!(container_id = %response.id, name = %name, "Container created");

        Ok(response.id)
    }

    async fn inspect(&self, id: UnitId, unit: DockerUnit) -> Result<Unit> {
        let state = match self
            .client
            .inspect_container(&unit.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(container) => Self::parse_state(
                container
                    .state
                    .as_ref()
                    .and_then(|state| state.status.as_ref()),
            ),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => UnitState::Uninstalled,
            Err(e) => return Err(e.into()),
        };

        Ok(Unit {
            id,
            location: unit.location,
            state,
        })
    }

    fn spawn_event_watch(&self) {
        let client = self.client.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let mut filters = HashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert(
                "label".to_string(),
                vec![format!("{}=true", MANAGED_LABEL)],
            );
            let options = EventsOptions::<String> {
                filters,
                ..Default::default()
            };

            let mut stream = client.events(Some(options));
            while let Some(event) = stream.next().await {
                match event {
                    Ok(message) => {
                        let Some(code) = message.action.as_deref().and_then(Self::event_code)
                        else {
                            continue;
                        };
                        debug!(action = ?message.action, code, "Container event");
                        if events.send(code).is_err() {
                            debug!("No event subscribers left");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Docker event stream failed");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RuntimeHost for DockerHost {
    fn runtime_type(&self) -> &str {
        "docker"
    }

    async fn install(&self, location: &str, content: Bytes) -> Result<Unit> {
        let container_id = self.create_container(location, &content).await?;

        let id = match self.find(location) {
            Some((id, _)) => id,
            None => self.allocate_id(),
        };
        self.units.insert(
            id,
            DockerUnit {
                location: location.to_string(),
                container_id,
            },
        );

        Ok(Unit {
            id,
            location: location.to_string(),
            state: UnitState::Installed,
        })
    }

    async fn update(&self, id: UnitId, content: Bytes) -> Result<()> {
        let unit = self.lookup(id)?;
        let container_id = self.create_container(&unit.location, &content).await?;
        self.units.insert(
            id,
            DockerUnit {
                location: unit.location,
                container_id,
            },
        );
        Ok(())
    }

    async fn start(&self, id: UnitId) -> Result<()> {
        let unit = self.lookup(id)?;
        self.client
            .start_container(&unit.container_id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container_id = %unit.container_id, "Container started");
        Ok(())
    }

    async fn stop(&self, id: UnitId) -> Result<()> {
        let unit = self.lookup(id)?;
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.client.stop_container(&unit.container_id, Some(options)).await {
            // 304: already stopped
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                info!(container_id = %unit.container_id, "Container stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn uninstall(&self, id: UnitId) -> Result<()> {
        let unit = self.lookup(id)?;
        self.remove_container(&unit.container_id).await?;
        self.units.remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Unit>> {
        let entries: Vec<(UnitId, DockerUnit)> = self
            .units
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut units = Vec::with_capacity(entries.len());
        for (id, unit) in entries {
            units.push(self.inspect(id, unit).await?);
        }
        units.sort_by_key(|unit| unit.id);
        Ok(units)
    }

    async fn get(&self, location: &str) -> Result<Option<Unit>> {
        match self.find(location) {
            Some((id, unit)) => Ok(Some(self.inspect(id, unit).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_id(&self, id: UnitId) -> Result<Option<Unit>> {
        let unit = self.units.get(&id).map(|entry| entry.value().clone());
        match unit {
            Some(unit) => Ok(Some(self.inspect(id, unit).await?)),
            None => Ok(None),
        }
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<i32>> {
        let receiver = self.events.subscribe();
        if !self.watching.swap(true, Ordering::SeqCst) {
            self.spawn_event_watch();
        }
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        assert_eq!(DockerHost::container_name("web"), "tether-web");
        assert_eq!(
            DockerHost::container_name("file:/units/web api.json"),
            "tether-file--units-web-api.json"
        );
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(
            DockerHost::parse_state(Some(&ContainerStateStatusEnum::RUNNING)),
            UnitState::Active
        );
        assert_eq!(
            DockerHost::parse_state(Some(&ContainerStateStatusEnum::EXITED)),
            UnitState::Resolved
        );
        assert_eq!(
            DockerHost::parse_state(Some(&ContainerStateStatusEnum::CREATED)),
            UnitState::Resolved
        );
        assert_eq!(DockerHost::parse_state(None), UnitState::Resolved);
    }

    #[test]
    fn test_event_code() {
        assert_eq!(DockerHost::event_code("start"), Some(EVENT_STARTED));
        assert_eq!(DockerHost::event_code("die"), Some(EVENT_DIED));
        assert_eq!(DockerHost::event_code("exec_start"), None);
    }

    #[test]
    fn test_descriptor_parse() {
        let descriptor = UnitDescriptor::parse(
            br#"{"image":"nginx:1.25","env":{"PORT":"8080"}}"#,
        )
        .unwrap();
        assert_eq!(descriptor.image, "nginx:1.25");
        assert_eq!(descriptor.env.get("PORT").map(String::as_str), Some("8080"));
        assert!(descriptor.command.is_none());
        assert!(descriptor.labels.is_empty());

        assert!(UnitDescriptor::parse(b"not json").is_err());
    }
}

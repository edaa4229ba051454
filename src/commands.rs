use crate::create::{ContainerConfig, CreateContainerBody};
use crate::engine::EngineGateway;
use crate::error::{ErrorKind, Result};
use crate::model::{Container, CreatedResponse, ResourceClass};
use crate::store::ResourceStore;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

/// Async locks keyed by resource id. Idle entries are pruned on the next
/// acquisition.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// State-changing operations. Each one runs against the engine and then
/// re-syncs the class it touched; commands on the same id run one at a time.
pub struct CommandExecutor {
    store: Arc<ResourceStore>,
    locks: KeyedLocks,
}

impl CommandExecutor {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    fn gateway(&self) -> &EngineGateway {
        self.store.gateway()
    }

    /// Lock key for a container reference. Names and unique id prefixes map
    /// to the full id from the last listing so every spelling of one
    /// container shares a lock.
    fn container_key(&self, reference: &str) -> String {
        let state = self.store.snapshot();
        resolve_container(&state.containers, reference).unwrap_or_else(|| reference.to_string())
    }

    async fn run<T>(
        &self,
        operation: &str,
        target: &str,
        key: &str,
        touched: &[ResourceClass],
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _guard = self.locks.acquire(key).await;
        let value = match call.await {
            Ok(value) => value,
            Err(error) => {
                warn!("{operation} {target} failed: {error}");
                return Err(ErrorKind::command(operation, error));
            }
        };
        info!("{operation} {target}");

        for class in touched {
            self.store.apply_mutation_result(*class).await;
        }
        Ok(value)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.run(
            "start",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().start_container(id),
        )
        .await
    }

    pub async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.run(
            "stop",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().stop_container(id, timeout_secs),
        )
        .await
    }

    pub async fn restart(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.run(
            "restart",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().restart_container(id, timeout_secs),
        )
        .await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.run(
            "pause",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().pause_container(id),
        )
        .await
    }

    pub async fn unpause(&self, id: &str) -> Result<()> {
        self.run(
            "unpause",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().unpause_container(id),
        )
        .await
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ErrorKind::command(
                "rename",
                ErrorKind::InvalidArgument("new name is empty".to_string()),
            ));
        }
        self.run(
            "rename",
            id,
            &self.container_key(id),
            &[ResourceClass::Containers],
            self.gateway().rename_container(id, new_name),
        )
        .await
    }

    pub async fn remove(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        let touched: &[ResourceClass] = if volumes {
            &[ResourceClass::Containers, ResourceClass::Volumes]
        } else {
            &[ResourceClass::Containers]
        };
        self.run(
            "remove",
            id,
            &self.container_key(id),
            touched,
            self.gateway().remove_container(id, force, volumes),
        )
        .await
    }

    /// Exports a container as an image. Without a repo the image is named
    /// `container-export-<unix millis>`.
    pub async fn commit(
        &self,
        id: &str,
        repo: Option<&str>,
        tag: Option<&str>,
    ) -> Result<CreatedResponse> {
        let repo = match repo.map(str::trim).filter(|repo| !repo.is_empty()) {
            Some(repo) => repo.to_string(),
            None => format!("container-export-{}", Utc::now().timestamp_millis()),
        };
        let tag = tag.map(str::trim).unwrap_or_default();
        self.run(
            "commit",
            id,
            &self.container_key(id),
            &[ResourceClass::Images],
            self.gateway().commit_container(id, &repo, tag),
        )
        .await
    }

    pub async fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        self.run(
            "remove image",
            id,
            &format!("image:{id}"),
            &[ResourceClass::Images],
            self.gateway().remove_image(id, force),
        )
        .await
    }

    pub async fn create(&self, image: &str, name: Option<&str>) -> Result<CreatedResponse> {
        let body = CreateContainerBody::from_image(image.trim());
        self.create_from_body("create", name, body).await
    }

    pub async fn create_with_config(&self, config: &ContainerConfig) -> Result<CreatedResponse> {
        let body = config.to_create_body();
        self.create_from_body("create", config.container_name(), body)
            .await
    }

    /// Creates then starts. A start failure leaves the created container in
    /// place, as the engine would.
    pub async fn run_image(&self, image: &str, name: Option<&str>) -> Result<CreatedResponse> {
        let created = self.create(image, name).await?;
        self.start_created("run", created).await
    }

    pub async fn run_with_config(&self, config: &ContainerConfig) -> Result<CreatedResponse> {
        let created = self.create_with_config(config).await?;
        self.start_created("run", created).await
    }

    /// Recreates a container from its inspected config under a new name,
    /// `<name>_copy_<unix millis>` by default. The copy is not started.
    pub async fn copy(&self, id: &str, new_name: Option<&str>) -> Result<CreatedResponse> {
        let _guard = self.locks.acquire(&self.container_key(id)).await;
        let details = self
            .gateway()
            .inspect_container(id)
            .await
            .map_err(|error| ErrorKind::command("copy", error))?;

        let name = match new_name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => format!(
                "{}_copy_{}",
                details.display_name(),
                Utc::now().timestamp_millis()
            ),
        };
        let body = CreateContainerBody::copy_of(&details);
        let created = self
            .gateway()
            .create_container(Some(&name), &body)
            .await
            .map_err(|error| ErrorKind::command("copy", error))?;
        info!("copy {id} as {name}");

        self.store
            .apply_mutation_result(ResourceClass::Containers)
            .await;
        Ok(created)
    }

    async fn create_from_body(
        &self,
        operation: &str,
        name: Option<&str>,
        body: CreateContainerBody,
    ) -> Result<CreatedResponse> {
        let key = format!("create:{}", name.unwrap_or(&body.image));
        let created = self
            .run(
                operation,
                &key,
                &key,
                &[ResourceClass::Containers],
                self.gateway().create_container(name, &body),
            )
            .await?;
        for warning in &created.warnings {
            warn!("engine warning for {}: {warning}", created.id);
        }
        Ok(created)
    }

    async fn start_created(
        &self,
        operation: &str,
        created: CreatedResponse,
    ) -> Result<CreatedResponse> {
        self.run(
            operation,
            &created.id,
            &created.id,
            &[ResourceClass::Containers],
            self.gateway().start_container(&created.id),
        )
        .await?;
        Ok(created)
    }
}

/// Full id of the container `reference` names: an exact id, a name with or
/// without the leading slash, or an id prefix matching exactly one container.
fn resolve_container(containers: &[Container], reference: &str) -> Option<String> {
    let name = reference.trim_start_matches('/');
    if let Some(container) = containers.iter().find(|container| {
        container.id == reference
            || container
                .names
                .iter()
                .any(|candidate| candidate.trim_start_matches('/') == name)
    }) {
        return Some(container.id.clone());
    }

    let mut prefixed = containers
        .iter()
        .filter(|container| !reference.is_empty() && container.id.starts_with(reference));
    match (prefixed.next(), prefixed.next()) {
        (Some(container), None) => Some(container.id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandExecutor, resolve_container};
    use crate::create::{ContainerConfig, PortSpec};
    use crate::engine::EngineGateway;
    use crate::error::ErrorKind;
    use crate::model::{Container, ResourceClass};
    use crate::store::ResourceStore;
    use crate::testing::FakeTransport;
    use crate::transport::Method;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn executor(fake: &Arc<FakeTransport>) -> (CommandExecutor, Arc<ResourceStore>) {
        let store = ResourceStore::new(EngineGateway::new(fake.clone()));
        (CommandExecutor::new(store.clone()), store)
    }

    fn list_with_state(state: &str) -> Value {
        json!([{"Id": "web", "Names": ["/web"], "Image": "nginx", "State": state}])
    }

    #[tokio::test]
    async fn start_is_followed_by_container_refresh() {
        let fake = FakeTransport::new();
        let running = Arc::new(AtomicBool::new(false));
        let listed = running.clone();
        fake.on(Method::GET, "/containers/json", move |_| {
            let state = if listed.load(Ordering::SeqCst) {
                "running"
            } else {
                "exited"
            };
            Ok((200, list_with_state(state)))
        });
        let started = running.clone();
        fake.on(Method::POST, "/containers/web/start", move |_| {
            started.store(true, Ordering::SeqCst);
            Ok((204, Value::Null))
        });
        let (commands, store) = executor(&fake);

        store.refresh(ResourceClass::Containers).await;
        assert_eq!(store.snapshot().containers[0].state, "exited");

        commands.start("web").await.unwrap();
        assert_eq!(store.snapshot().containers[0].state, "running");
        assert_eq!(
            fake.requests()[1..],
            [
                "POST /containers/web/start".to_string(),
                "GET /containers/json?all=true".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_command_reports_operation_and_skips_refresh() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::POST,
            "/containers/ghost/pause",
            404,
            json!({"message": "No such container: ghost"}),
        );
        let (commands, _) = executor(&fake);

        let error = commands.pause("ghost").await.unwrap_err();
        assert!(matches!(
            &error,
            ErrorKind::CommandFailed { operation, .. } if operation == "pause"
        ));
        assert_eq!(error.status(), Some(404));
        assert_eq!(fake.count("GET /containers/json"), 0);
    }

    #[tokio::test]
    async fn failed_refresh_does_not_fail_the_command() {
        let fake = FakeTransport::new();
        fake.respond(Method::POST, "/containers/web/unpause", 204, Value::Null);
        fake.respond(Method::GET, "/containers/json", 500, json!({"message": "busy"}));
        let (commands, store) = executor(&fake);

        commands.unpause("web").await.unwrap();
        let state = store.snapshot();
        assert!(!state.connected);
        assert!(
            state
                .class_state(ResourceClass::Containers)
                .last_error
                .is_some()
        );
    }

    #[tokio::test]
    async fn commands_on_one_id_run_in_sequence() {
        let fake = FakeTransport::new();
        fake.slow(
            Method::POST,
            "/containers/web/stop",
            Duration::from_millis(30),
            |_| Ok((204, Value::Null)),
        );
        fake.respond(Method::DELETE, "/containers/web", 204, Value::Null);
        fake.respond(Method::GET, "/containers/json", 200, json!([]));
        let (commands, _) = executor(&fake);

        let (stopped, removed) =
            tokio::join!(commands.stop("web", 1), commands.remove("web", false, false));
        stopped.unwrap();
        removed.unwrap();

        assert_eq!(
            fake.requests(),
            vec![
                "POST /containers/web/stop?t=1",
                "GET /containers/json?all=true",
                "DELETE /containers/web",
                "GET /containers/json?all=true",
            ]
        );
    }

    #[tokio::test]
    async fn commands_on_different_ids_overlap() {
        let fake = FakeTransport::new();
        for route in ["/containers/web/restart", "/containers/db/restart"] {
            fake.slow(Method::POST, route, Duration::from_millis(30), |_| {
                Ok((204, Value::Null))
            });
        }
        fake.respond(Method::GET, "/containers/json", 200, json!([]));
        let (commands, _) = executor(&fake);

        let (web, db) = tokio::join!(commands.restart("web", 5), commands.restart("db", 5));
        web.unwrap();
        db.unwrap();

        let requests = fake.requests();
        assert_eq!(requests[0], "POST /containers/web/restart?t=5");
        assert_eq!(requests[1], "POST /containers/db/restart?t=5");
    }

    #[tokio::test]
    async fn commit_without_repo_generates_export_name() {
        let fake = FakeTransport::new();
        fake.respond(Method::POST, "/commit", 201, json!({"Id": "sha256:new"}));
        fake.respond(Method::GET, "/images/json", 200, json!([]));
        let (commands, _) = executor(&fake);

        let image = commands.commit("web", None, None).await.unwrap();
        assert_eq!(image.id, "sha256:new");
        let requests = fake.requests();
        assert!(requests[0].starts_with("POST /commit?container=web&repo=container-export-"));
        assert_eq!(requests[1], "GET /images/json");
    }

    #[tokio::test]
    async fn copy_recreates_from_inspect_with_generated_name() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::GET,
            "/containers/web/json",
            200,
            json!({
                "Id": "web",
                "Name": "/web",
                "Config": {"Image": "nginx:1.27", "Env": ["A=1"], "Cmd": ["nginx", "-g", "daemon off;"]}
            }),
        );
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        fake.on(Method::POST, "/containers/create", move |request| {
            *sink.lock().unwrap() = request.body.clone();
            Ok((201, json!({"Id": "copy1", "Warnings": null})))
        });
        fake.respond(Method::GET, "/containers/json", 200, json!([]));
        let (commands, _) = executor(&fake);

        let created = commands.copy("web", None).await.unwrap();
        assert_eq!(created.id, "copy1");
        assert!(fake.requests()[1].starts_with("POST /containers/create?name=web_copy_"));

        let body = captured.lock().unwrap().clone().unwrap();
        assert_eq!(body["Image"], json!("nginx:1.27"));
        assert_eq!(body["Env"], json!(["A=1"]));
        assert_eq!(body["Cmd"], json!(["nginx", "-g", "daemon off;"]));
    }

    #[tokio::test]
    async fn run_with_config_creates_then_starts() {
        let fake = FakeTransport::new();
        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        fake.on(Method::POST, "/containers/create", move |request| {
            *sink.lock().unwrap() = request.body.clone();
            Ok((201, json!({"Id": "fresh"})))
        });
        fake.respond(Method::POST, "/containers/fresh/start", 204, Value::Null);
        fake.respond(Method::GET, "/containers/json", 200, json!([]));
        let (commands, _) = executor(&fake);

        let config = ContainerConfig {
            name: Some("api".to_string()),
            ports: vec![PortSpec {
                host: 8080,
                container: 80,
                ..PortSpec::default()
            }],
            ..ContainerConfig::new("nginx")
        }
        .with_defaults();
        let created = commands.run_with_config(&config).await.unwrap();
        assert_eq!(created.id, "fresh");

        let requests = fake.requests();
        assert_eq!(requests[0], "POST /containers/create?name=api");
        assert_eq!(requests[2], "POST /containers/fresh/start");
        let body = captured.lock().unwrap().clone().unwrap();
        assert_eq!(body["HostConfig"]["Memory"], json!(512 * 1024 * 1024));
        assert_eq!(
            body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"],
            json!("8080")
        );
    }

    #[tokio::test]
    async fn empty_rename_is_rejected_locally() {
        let fake = FakeTransport::new();
        let (commands, _) = executor(&fake);
        let error = commands.rename("web", "   ").await.unwrap_err();
        let ErrorKind::CommandFailed { operation, cause } = &error else {
            panic!("expected a command failure, got {error:?}");
        };
        assert_eq!(operation, "rename");
        assert!(matches!(**cause, ErrorKind::InvalidArgument(_)));
        assert!(!error.is_unreachable());
        assert_eq!(error.status(), None);
        assert!(fake.requests().is_empty());
    }

    #[test]
    fn container_references_resolve_to_full_ids() {
        let containers = vec![
            Container {
                id: "4f1c9e0a77b2".to_string(),
                names: vec!["/web".to_string()],
                ..Container::default()
            },
            Container {
                id: "4f88d3a1c0e5".to_string(),
                names: vec!["/db".to_string()],
                ..Container::default()
            },
        ];
        assert_eq!(
            resolve_container(&containers, "web").as_deref(),
            Some("4f1c9e0a77b2")
        );
        assert_eq!(
            resolve_container(&containers, "/db").as_deref(),
            Some("4f88d3a1c0e5")
        );
        assert_eq!(
            resolve_container(&containers, "4f1c").as_deref(),
            Some("4f1c9e0a77b2")
        );
        assert_eq!(resolve_container(&containers, "4f"), None);
        assert_eq!(resolve_container(&containers, "cache"), None);
        assert_eq!(resolve_container(&containers, ""), None);
    }

    #[tokio::test]
    async fn name_and_id_of_one_container_share_a_lock() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::GET,
            "/containers/json",
            200,
            json!([{"Id": "4f1c9e0a77b2", "Names": ["/web"], "Image": "nginx", "State": "running"}]),
        );
        fake.slow(
            Method::POST,
            "/containers/web/stop",
            Duration::from_millis(40),
            |_| Ok((204, Value::Null)),
        );
        fake.respond(Method::POST, "/containers/4f1c9e0a77b2/start", 204, Value::Null);
        let (commands, store) = executor(&fake);
        store.refresh(ResourceClass::Containers).await;

        let (stopped, started) = tokio::join!(
            commands.stop("web", 10),
            commands.start("4f1c9e0a77b2"),
        );
        stopped.unwrap();
        started.unwrap();

        assert_eq!(
            fake.requests()[1..],
            [
                "POST /containers/web/stop?t=10".to_string(),
                "GET /containers/json?all=true".to_string(),
                "POST /containers/4f1c9e0a77b2/start".to_string(),
                "GET /containers/json?all=true".to_string(),
            ]
        );
    }
}

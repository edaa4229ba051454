use crate::decoder::{LogDecoder, LogFraming};
use crate::error::{ErrorKind, Result};
use crate::model::{
    Container, ContainerDetails, CreatedResponse, ExecInspect, Image, Network, SystemInfo,
    VersionInfo, Volume, VolumeList,
};
use crate::stats::StatsSample;
use crate::transport::{ApiRequest, Duplex, Expect, Transport};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use url::form_urlencoded::Serializer;

#[derive(Debug, Clone, PartialEq)]
pub struct LogOptions {
    pub follow: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub timestamps: bool,
    /// Trailing line count; `None` asks for the whole log.
    pub tail: Option<u64>,
    pub framing: LogFraming,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            stdout: true,
            stderr: true,
            since: None,
            until: None,
            timestamps: false,
            tail: None,
            framing: LogFraming::Raw,
        }
    }
}

impl LogOptions {
    pub fn query(&self) -> String {
        let mut query = Serializer::new(String::new());
        if self.follow {
            query.append_pair("follow", "true");
        }
        if self.stdout {
            query.append_pair("stdout", "true");
        }
        if self.stderr {
            query.append_pair("stderr", "true");
        }
        if let Some(since) = self.since {
            query.append_pair("since", &since.to_string());
        }
        if let Some(until) = self.until {
            query.append_pair("until", &until.to_string());
        }
        if self.timestamps {
            query.append_pair("timestamps", "true");
        }
        if let Some(tail) = self.tail {
            query.append_pair("tail", &tail.to_string());
        }
        query.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub detach_keys: String,
    pub tty: bool,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub privileged: bool,
    pub user: String,
    pub working_dir: String,
}

impl ExecConfig {
    pub const DETACH_KEYS: &'static str = "ctrl-p,ctrl-q";

    /// Interactive shell attached to a TTY.
    pub fn interactive(shell: &str) -> Self {
        Self {
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            detach_keys: Self::DETACH_KEYS.to_string(),
            tty: true,
            env: Vec::new(),
            cmd: vec![shell.to_string()],
            privileged: false,
            user: String::new(),
            working_dir: String::new(),
        }
    }

    /// `<shell> -c <line>` with output captured and no stdin.
    pub fn one_shot(shell: &str, line: &str) -> Self {
        Self {
            attach_stdin: false,
            tty: false,
            cmd: vec![shell.to_string(), "-c".to_string(), line.to_string()],
            ..Self::interactive(shell)
        }
    }
}

/// Typed calls over the engine's HTTP API.
#[derive(Clone)]
pub struct EngineGateway {
    transport: Arc<dyn Transport>,
}

impl EngineGateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    pub async fn ping(&self) -> Result<String> {
        let response = self
            .transport
            .request(ApiRequest::get("/_ping").expect(Expect::Text))
            .await?;
        Ok(response.text())
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        self.transport
            .request(ApiRequest::get(format!("/containers/json?all={all}")).expect(Expect::List))
            .await?
            .json()
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        self.transport
            .request(ApiRequest::get("/images/json").expect(Expect::List))
            .await?
            .json()
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let list: VolumeList = self
            .transport
            .request(ApiRequest::get("/volumes"))
            .await?
            .json()?;
        Ok(list.volumes)
    }

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        self.transport
            .request(ApiRequest::get("/networks").expect(Expect::List))
            .await?
            .json()
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.transport
            .request(ApiRequest::get(format!("/containers/{id}/json")))
            .await?
            .json()
    }

    pub fn logs_path(id: &str, options: &LogOptions) -> String {
        format!("/containers/{id}/logs?{}", options.query())
    }

    pub fn stats_path(id: &str, stream: bool) -> String {
        format!("/containers/{id}/stats?stream={stream}")
    }

    /// One-shot log fetch; `follow` is ignored here, use the stream API for it.
    pub async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<String> {
        let options = LogOptions {
            follow: false,
            ..options.clone()
        };
        let bytes = self
            .transport
            .request(ApiRequest::get(Self::logs_path(id, &options)).expect(Expect::Raw))
            .await?
            .bytes();

        let mut decoder = LogDecoder::new(options.framing);
        let mut text = decoder.feed(&bytes).concat();
        if let Some(tail) = decoder.flush() {
            text.push_str(&tail);
        }
        Ok(text)
    }

    pub async fn container_stats(&self, id: &str) -> Result<StatsSample> {
        self.transport
            .request(ApiRequest::get(Self::stats_path(id, false)))
            .await?
            .json()
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.post(format!("/containers/{id}/start")).await
    }

    pub async fn stop_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.post(format!("/containers/{id}/stop?t={timeout_secs}"))
            .await
    }

    pub async fn restart_container(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.post(format!("/containers/{id}/restart?t={timeout_secs}"))
            .await
    }

    pub async fn pause_container(&self, id: &str) -> Result<()> {
        self.post(format!("/containers/{id}/pause")).await
    }

    pub async fn unpause_container(&self, id: &str) -> Result<()> {
        self.post(format!("/containers/{id}/unpause")).await
    }

    pub async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        let query = Serializer::new(String::new())
            .append_pair("name", name)
            .finish();
        self.post(format!("/containers/{id}/rename?{query}")).await
    }

    pub async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        let mut query = Serializer::new(String::new());
        if force {
            query.append_pair("force", "true");
        }
        if volumes {
            query.append_pair("v", "true");
        }
        let path = with_query(format!("/containers/{id}"), query.finish());
        self.transport.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    /// Snapshots a container into an image. An empty `repo` leaves the image
    /// untagged and drops `tag`, as the engine would.
    pub async fn commit_container(
        &self,
        id: &str,
        repo: &str,
        tag: &str,
    ) -> Result<CreatedResponse> {
        let mut query = Serializer::new(String::new());
        query.append_pair("container", id);
        if !repo.is_empty() {
            query.append_pair("repo", repo);
            if !tag.is_empty() {
                query.append_pair("tag", tag);
            }
        }
        self.transport
            .request(
                ApiRequest::post(format!("/commit?{}", query.finish())).expect(Expect::Object),
            )
            .await?
            .json()
    }

    pub async fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        let path = if force {
            format!("/images/{id}?force=true")
        } else {
            format!("/images/{id}")
        };
        self.transport.request(ApiRequest::delete(path)).await?;
        Ok(())
    }

    pub async fn create_container<B: Serialize>(
        &self,
        name: Option<&str>,
        body: &B,
    ) -> Result<CreatedResponse> {
        let body = serde_json::to_value(body)
            .map_err(|error| ErrorKind::InvalidResponse(error.to_string()))?;
        let query = match name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => Serializer::new(String::new())
                .append_pair("name", name)
                .finish(),
            None => String::new(),
        };
        self.transport
            .request(
                ApiRequest::post(with_query("/containers/create".to_string(), query))
                    .json(body)
                    .expect(Expect::Object),
            )
            .await?
            .json()
    }

    pub async fn create_exec(&self, container_id: &str, config: &ExecConfig) -> Result<String> {
        let body = serde_json::to_value(config)
            .map_err(|error| ErrorKind::InvalidResponse(error.to_string()))?;
        let created: CreatedResponse = self
            .transport
            .request(
                ApiRequest::post(format!("/containers/{container_id}/exec"))
                    .json(body)
                    .expect(Expect::Object),
            )
            .await?
            .json()?;
        if created.id.is_empty() {
            return Err(ErrorKind::InvalidResponse(
                "exec create returned no id".to_string(),
            ));
        }
        Ok(created.id)
    }

    /// Starts an exec over an upgraded full-duplex connection.
    pub async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<Duplex> {
        self.transport
            .upgrade(&format!("/exec/{exec_id}/start"), exec_start_body(tty))
            .await
    }

    /// Starts an exec and waits for it to finish, returning its raw output.
    pub async fn run_exec(&self, exec_id: &str, tty: bool) -> Result<Bytes> {
        let response = self
            .transport
            .request(
                ApiRequest::post(format!("/exec/{exec_id}/start"))
                    .json(exec_start_body(tty))
                    .expect(Expect::Raw),
            )
            .await?;
        Ok(response.bytes())
    }

    pub async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect> {
        self.transport
            .request(ApiRequest::get(format!("/exec/{exec_id}/json")))
            .await?
            .json()
    }

    pub async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.post(format!("/exec/{exec_id}/resize?h={rows}&w={cols}"))
            .await
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        self.transport
            .request(ApiRequest::get("/info"))
            .await?
            .json()
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        self.transport
            .request(ApiRequest::get("/version"))
            .await?
            .json()
    }

    async fn post(&self, path: String) -> Result<()> {
        self.transport.request(ApiRequest::post(path)).await?;
        Ok(())
    }
}

fn exec_start_body(tty: bool) -> Value {
    json!({ "Detach": false, "Tty": tty })
}

fn with_query(path: String, query: String) -> String {
    if query.is_empty() {
        path
    } else {
        format!("{path}?{query}")
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineGateway, ExecConfig, LogOptions};
    use crate::decoder::LogFraming;
    use crate::error::ErrorKind;
    use crate::testing::FakeTransport;
    use crate::transport::Method;
    use serde_json::{Value, json};

    #[test]
    fn log_query_includes_only_requested_flags() {
        assert_eq!(LogOptions::default().query(), "stdout=true&stderr=true");

        let options = LogOptions {
            follow: true,
            stderr: false,
            since: Some(1_700_000_000),
            timestamps: true,
            tail: Some(100),
            ..LogOptions::default()
        };
        assert_eq!(
            options.query(),
            "follow=true&stdout=true&since=1700000000&timestamps=true&tail=100"
        );
    }

    #[test]
    fn exec_bodies_use_engine_field_names() {
        let body = serde_json::to_value(ExecConfig::interactive("/bin/bash")).unwrap();
        assert_eq!(body["AttachStdin"], json!(true));
        assert_eq!(body["Tty"], json!(true));
        assert_eq!(body["DetachKeys"], json!("ctrl-p,ctrl-q"));
        assert_eq!(body["Cmd"], json!(["/bin/bash"]));

        let one_shot = serde_json::to_value(ExecConfig::one_shot("/bin/sh", "ls -la")).unwrap();
        assert_eq!(one_shot["Cmd"], json!(["/bin/sh", "-c", "ls -la"]));
        assert_eq!(one_shot["AttachStdin"], json!(false));
        assert_eq!(one_shot["Tty"], json!(false));
    }

    #[tokio::test]
    async fn empty_container_list_decodes_to_empty_vec() {
        let fake = FakeTransport::new();
        fake.respond(Method::GET, "/containers/json", 200, Value::Null);
        let gateway = EngineGateway::new(fake.clone());

        let containers = gateway.list_containers(true).await.unwrap();
        assert!(containers.is_empty());
        assert_eq!(fake.requests(), vec!["GET /containers/json?all=true"]);
    }

    #[tokio::test]
    async fn volumes_are_unwrapped_from_envelope() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::GET,
            "/volumes",
            200,
            json!({"Volumes": [{"Name": "pgdata", "Driver": "local"}], "Warnings": null}),
        );
        let gateway = EngineGateway::new(fake);

        let volumes = gateway.list_volumes().await.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "pgdata");
    }

    #[tokio::test]
    async fn lifecycle_calls_hit_expected_paths() {
        let fake = FakeTransport::new();
        for route in ["/containers/web/stop", "/containers/web/rename"] {
            fake.respond(Method::POST, route, 204, Value::Null);
        }
        fake.respond(Method::POST, "/commit", 201, json!({"Id": "sha256:abc"}));
        fake.respond(Method::DELETE, "/containers/web", 204, Value::Null);
        let gateway = EngineGateway::new(fake.clone());

        gateway.stop_container("web", 10).await.unwrap();
        gateway.rename_container("web", "web two").await.unwrap();
        gateway.remove_container("web", true, true).await.unwrap();
        let image = gateway.commit_container("web", "snap", "").await.unwrap();
        assert_eq!(image.id, "sha256:abc");

        assert_eq!(
            fake.requests(),
            vec![
                "POST /containers/web/stop?t=10",
                "POST /containers/web/rename?name=web+two",
                "DELETE /containers/web?force=true&v=true",
                "POST /commit?container=web&repo=snap",
            ]
        );
    }

    #[tokio::test]
    async fn rejected_request_surfaces_http_status() {
        let fake = FakeTransport::new();
        fake.respond(
            Method::POST,
            "/containers/web/start",
            409,
            json!({"message": "container already started"}),
        );
        let gateway = EngineGateway::new(fake);

        let error = gateway.start_container("web").await.unwrap_err();
        assert_eq!(error.status(), Some(409));
        assert!(!error.is_unreachable());
    }

    #[tokio::test]
    async fn multiplexed_logs_are_demultiplexed() {
        let fake = FakeTransport::new();
        let mut framed = vec![1u8, 0, 0, 0, 0, 0, 0, 6];
        framed.extend_from_slice(b"ready\n");
        fake.respond(
            Method::GET,
            "/containers/web/logs",
            200,
            Value::String(String::from_utf8(framed).unwrap()),
        );
        let gateway = EngineGateway::new(fake);

        let options = LogOptions {
            framing: LogFraming::Multiplexed,
            ..LogOptions::default()
        };
        assert_eq!(gateway.container_logs("web", &options).await.unwrap(), "ready\n");
    }

    #[tokio::test]
    async fn exec_create_without_id_is_invalid() {
        let fake = FakeTransport::new();
        fake.respond(Method::POST, "/containers/web/exec", 201, json!({}));
        let gateway = EngineGateway::new(fake);

        let error = gateway
            .create_exec("web", &ExecConfig::interactive("/bin/sh"))
            .await
            .unwrap_err();
        assert!(matches!(error, ErrorKind::InvalidResponse(_)));
    }
}

//! In-memory engine double for unit tests.

use crate::error::{ErrorKind, Result};
use crate::transport::{ApiRequest, ApiResponse, ByteStream, Duplex, Method, Transport, normalize_body};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

type Handler = Arc<dyn Fn(&ApiRequest) -> Result<(u16, Value)> + Send + Sync>;

struct Route {
    method: Method,
    route: String,
    handler: Handler,
    delay: Duration,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    streams: Mutex<HashMap<String, mpsc::UnboundedReceiver<Result<Bytes>>>>,
    upgrades: Mutex<Vec<DuplexStream>>,
    upgrade_enabled: Mutex<bool>,
    upgrade_count: AtomicUsize,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn respond(&self, method: Method, route: &str, status: u16, body: Value) {
        self.on(method, route, move |_| Ok((status, body.clone())));
    }

    pub(crate) fn on<F>(&self, method: Method, route: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<(u16, Value)> + Send + Sync + 'static,
    {
        self.insert(method, route, Arc::new(handler), Duration::ZERO);
    }

    pub(crate) fn slow<F>(&self, method: Method, route: &str, delay: Duration, handler: F)
    where
        F: Fn(&ApiRequest) -> Result<(u16, Value)> + Send + Sync + 'static,
    {
        self.insert(method, route, Arc::new(handler), delay);
    }

    fn insert(&self, method: Method, route: &str, handler: Handler, delay: Duration) {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|existing| !(existing.method == method && existing.route == route));
        routes.push(Route {
            method,
            route: route.to_string(),
            handler,
            delay,
        });
    }

    /// Registers a stream body for `route`; the returned sender feeds chunks
    /// and dropping it ends the body.
    pub(crate) fn stream(&self, route: &str) -> mpsc::UnboundedSender<Result<Bytes>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .insert(route.to_string(), receiver);
        sender
    }

    pub(crate) fn enable_upgrades(&self) {
        *self.upgrade_enabled.lock().unwrap() = true;
    }

    /// Engine side of the most recent upgraded connection.
    pub(crate) fn take_upgraded(&self) -> Option<DuplexStream> {
        self.upgrades.lock().unwrap().pop()
    }

    pub(crate) fn upgrade_count(&self) -> usize {
        self.upgrade_count.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub(crate) fn max_in_flight(&self, route: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(route)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, route: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.entry(route.to_string()).or_insert(0);
        *current += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(route.to_string()).or_insert(0);
        *peak = (*peak).max(*current);
    }

    fn leave(&self, route: &str) {
        if let Some(current) = self.in_flight.lock().unwrap().get_mut(route) {
            *current = current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn endpoint(&self) -> String {
        "fake://engine".to_string()
    }

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method, request.path));

        let matched = {
            let routes = self.routes.lock().unwrap();
            routes
                .iter()
                .find(|route| route.method == request.method && route.route == request.route())
                .map(|route| (route.handler.clone(), route.delay))
        };
        let Some((handler, delay)) = matched else {
            return normalize_body(404, None, b"{\"message\":\"no route\"}", request.expect);
        };

        let route = request.route().to_string();
        self.enter(&route);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = handler(&request);
        self.leave(&route);

        let (status, body) = outcome?;
        let encoded = match &body {
            Value::Null => Vec::new(),
            Value::String(text) => text.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        };
        let content_type = match body {
            Value::String(_) => "text/plain",
            _ => "application/json",
        };
        normalize_body(status, Some(content_type), &encoded, request.expect)
    }

    async fn open_stream(&self, path: &str) -> Result<ByteStream> {
        self.log.lock().unwrap().push(format!("GET {path}"));
        let route = path.split('?').next().unwrap_or_default();
        let receiver = self
            .streams
            .lock()
            .unwrap()
            .remove(route)
            .ok_or_else(|| ErrorKind::http(404, b"no stream"))?;
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (chunk, receiver))
        });
        Ok(stream.boxed())
    }

    async fn upgrade(&self, path: &str, _body: Value) -> Result<Duplex> {
        self.log.lock().unwrap().push(format!("UPGRADE {path}"));
        if !*self.upgrade_enabled.lock().unwrap() {
            return Err(ErrorKind::Unsupported(format!("connection upgrade for {path}")));
        }
        self.upgrade_count.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(4096);
        self.upgrades.lock().unwrap().push(remote);
        Ok(Duplex::new(local))
    }
}

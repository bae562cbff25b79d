//! HTTP entry point that turns requests into render tasks.
//!
//! Every `GET` is answered by prerendering the same path and query on the
//! configured base URL. The handler builds a [`Task`], enqueues it on the
//! shared [`TaskQueue`] and then races the task's result against the
//! request's [`Cancel`]. Dropping the handler future (client went away) drops
//! the result receiver, so the worker's later send is a no-op. The drop is
//! logged like any other outcome.

use super::error::GatewayError;
use super::overrides::{selector_override, wait_override};
use crate::server::config::ServerConfig;
use axum::{
    Router,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Html,
};
use core::time::Duration;
use precrawl::{Cancel, RenderParams, Task, TaskQueue};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Request-independent settings of the gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Must carry a scheme and a host, see
    /// [`crate::server::config::parse_base_url`].
    pub base_url: Url,
    pub default_selector: String,
    pub default_wait: Duration,
    pub selector_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl From<&ServerConfig> for GatewaySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            default_selector: config.default_selector.clone(),
            default_wait: config.default_wait,
            selector_timeout: config.render_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    settings: GatewaySettings,
    queue: Arc<TaskQueue>,
    root: Cancel,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, queue: Arc<TaskQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                queue,
                root: Cancel::new(),
            }),
        }
    }

    /// Router that sends every path to the render handler.
    pub fn router(self) -> Router {
        Router::new().fallback(handle).with_state(self)
    }

    /// Fails every request still waiting for a result with `408`. Used once
    /// the shutdown grace period is over.
    pub fn cancel_pending(&self) {
        self.inner.root.cancel();
    }

    /// Base URL with the request's path and query in place of its own.
    ///
    /// The request path is always treated as a path, so `//other.host/x`
    /// cannot move the target to another host.
    pub fn resolve_target(&self, uri: &Uri) -> Url {
        let mut target = self.inner.settings.base_url.clone();
        target.set_path(uri.path());
        target.set_query(uri.query());
        target.set_fragment(None);
        target
    }

    /// Render parameters for a request to `target`, with header overrides
    /// applied on top of the configured defaults.
    pub fn params_for(
        &self,
        target: &Url,
        headers: &HeaderMap,
    ) -> Result<RenderParams, GatewayError> {
        let settings = &self.inner.settings;
        let selector =
            selector_override(headers)?.unwrap_or_else(|| settings.default_selector.clone());
        let wait = wait_override(headers)?.unwrap_or(settings.default_wait);

        Ok(RenderParams::new(target.as_str())
            .with_selector(selector)
            .with_wait(wait)
            .with_selector_timeout(settings.selector_timeout))
    }

    /// Token for one request: a child of the gateway's root, bounded by the
    /// configured request timeout.
    pub fn request_cancel(&self) -> Cancel {
        match self.inner.settings.request_timeout {
            Some(timeout) => self.inner.root.with_timeout(timeout),
            None => self.inner.root.child(),
        }
    }

    /// Enqueues `params` and waits for the worker's answer or `cancel`.
    pub async fn submit(
        &self,
        params: RenderParams,
        cancel: &Cancel,
    ) -> Result<String, GatewayError> {
        let (task, result_rx) = Task::new(params);
        self.inner.queue.enqueue(task).map_err(GatewayError::Rejected)?;

        tokio::select! {
            biased;
            result = result_rx => match result {
                Ok(Ok(html)) => Ok(html),
                Ok(Err(e)) => Err(GatewayError::Render(e)),
                Err(_) => Err(GatewayError::Unavailable),
            },
            _ = cancel.done() => Err(GatewayError::Canceled),
        }
    }

    /// Full request path: method check, target resolution, overrides,
    /// dispatch.
    pub async fn render(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<String, GatewayError> {
        let start = Instant::now();

        if method != Method::GET {
            tracing::warn!("Rejected method={method} path={}", uri.path());
            return Err(GatewayError::MethodNotAllowed);
        }

        let target = self.resolve_target(uri);
        let params = self.params_for(&target, headers).inspect_err(|e| {
            tracing::warn!("Invalid overrides path={} err={e}", uri.path());
        })?;

        tracing::info!(
            "Request path={} target={target} selector={} wait={:?}",
            uri.path(),
            params.selector,
            params.wait
        );

        let cancel = self.request_cancel();
        let in_flight = InFlight {
            target: &target,
            start,
        };
        let result = self.submit(params, &cancel).await;
        in_flight.answered();

        match &result {
            Ok(html) => tracing::info!(
                "Render ok target={target} bytes={} duration={:?}",
                html.len(),
                start.elapsed()
            ),
            Err(GatewayError::Canceled) => tracing::warn!(
                "Request canceled target={target} duration={:?}",
                start.elapsed()
            ),
            Err(e) => tracing::warn!(
                "Render failed target={target} err={e} duration={:?}",
                start.elapsed()
            ),
        }

        result
    }
}

/// Logs a request whose future was dropped before it got an answer, which
/// is how a client disconnect reaches the handler.
struct InFlight<'a> {
    target: &'a Url,
    start: Instant,
}

impl InFlight<'_> {
    fn answered(self) {
        core::mem::forget(self);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        tracing::warn!(
            "Request canceled by client target={} duration={:?}",
            self.target,
            self.start.elapsed()
        );
    }
}

async fn handle(
    State(gateway): State<Gateway>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Html<String>, GatewayError> {
    gateway.render(&method, &uri, &headers).await.map(Html)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::gateway::overrides::{SELECTOR_HEADER, WAIT_HEADER, WAIT_MS_HEADER};
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderValue, Request, StatusCode, header};
    use axum::response::Response;
    use precrawl::testing::{StubAllocator, StubRenderer};
    use precrawl::{Dispatcher, PagePool};
    use std::io;
    use std::sync::Mutex;
    use tower::ServiceExt;
    use tracing_subscriber::fmt::MakeWriter;

    /// Log sink for tests that assert on what was logged.
    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Logs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Logs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self {
            self.clone()
        }
    }

    fn settings() -> GatewaySettings {
        GatewaySettings {
            base_url: Url::parse("https://site.test").unwrap(),
            default_selector: "body".into(),
            default_wait: Duration::ZERO,
            selector_timeout: Duration::from_secs(5),
            request_timeout: None,
        }
    }

    struct Harness {
        gateway: Gateway,
        queue: Arc<TaskQueue>,
        pool: Arc<PagePool<StubAllocator>>,
        renderer: Arc<StubRenderer>,
        dispatcher: Option<Dispatcher>,
    }

    async fn harness(settings: GatewaySettings, renderer: StubRenderer, workers: usize) -> Harness {
        let queue = Arc::new(TaskQueue::new());
        let pool = Arc::new(PagePool::new(1, StubAllocator::default()).await.unwrap());
        let renderer = Arc::new(renderer);
        let dispatcher = (workers > 0).then(|| {
            Dispatcher::spawn(
                workers,
                Arc::clone(&queue),
                Arc::clone(&pool),
                Arc::clone(&renderer),
            )
        });

        Harness {
            gateway: Gateway::new(settings, Arc::clone(&queue)),
            queue,
            pool,
            renderer,
            dispatcher,
        }
    }

    async fn send(gateway: &Gateway, request: Request<Body>) -> (StatusCode, Response) {
        let response = gateway.clone().router().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn renders_path_and_query_on_base() {
        let h = harness(settings(), StubRenderer::html("<html>OK</html>"), 1).await;

        let (status, response) = send(&h.gateway, get("/foo?x=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(body(response).await, "<html>OK</html>");

        let calls = h.renderer.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target_url, "https://site.test/foo?x=1");
        assert_eq!(calls[0].selector, "body");
        assert_eq!(calls[0].wait, Duration::ZERO);
        assert_eq!(calls[0].selector_timeout, Duration::from_secs(5));

        if let Some(d) = h.dispatcher {
            d.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn headers_override_selector_and_wait() {
        let h = harness(settings(), StubRenderer::html("<html></html>"), 1).await;

        let request = Request::builder()
            .uri("/app")
            .header(SELECTOR_HEADER, " #root ")
            .header(WAIT_MS_HEADER, "250")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::OK);

        let calls = h.renderer.calls();
        assert_eq!(calls[0].selector, "#root");
        assert_eq!(calls[0].wait, Duration::from_millis(250));

        if let Some(d) = h.dispatcher {
            d.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_ascii_selector_reaches_the_renderer() {
        let h = harness(settings(), StubRenderer::html("<html></html>"), 1).await;
        let selector = "[title=\"café\"]";

        let request = Request::builder()
            .uri("/menu")
            .header(SELECTOR_HEADER, HeaderValue::from_bytes(selector.as_bytes()).unwrap())
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.renderer.calls()[0].selector, selector);

        if let Some(d) = h.dispatcher {
            d.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn selector_that_is_not_utf8_is_a_bad_request() {
        let h = harness(settings(), StubRenderer::html(""), 0).await;

        let request = Request::builder()
            .uri("/menu")
            .header(SELECTOR_HEADER, HeaderValue::from_bytes(b"#app\xff").unwrap())
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body(response).await.starts_with("invalid selector: "));
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let h = harness(settings(), StubRenderer::html(""), 0).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/foo")
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET");
        assert!(h.queue.is_empty());
    }

    #[tokio::test]
    async fn bad_wait_is_a_bad_request_and_not_dispatched() {
        let h = harness(settings(), StubRenderer::html(""), 0).await;

        let request = Request::builder()
            .uri("/foo")
            .header(WAIT_HEADER, "whenever")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .uri("/foo")
            .header(WAIT_MS_HEADER, "-10")
            .body(Body::empty())
            .unwrap();
        let (status, response) = send(&h.gateway, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body(response).await, "wait duration must be non-negative");

        assert!(h.queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn render_errors_are_internal_errors() {
        let h = harness(settings(), StubRenderer::failing("boom"), 1).await;

        let (status, response) = send(&h.gateway, get("/broken")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body(response).await, "render failed: boom");

        if let Some(d) = h.dispatcher {
            d.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn selector_timeout_is_an_internal_error() {
        let h = harness(settings(), StubRenderer::selector_timeout("<html></html>"), 1).await;

        let (status, _) = send(&h.gateway, get("/slow")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        if let Some(d) = h.dispatcher {
            d.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn request_deadline_maps_to_request_timeout() {
        let settings = GatewaySettings {
            request_timeout: Some(Duration::from_millis(20)),
            ..settings()
        };
        let h = harness(settings, StubRenderer::html(""), 0).await;

        let (status, response) = send(&h.gateway, get("/never")).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
        assert_eq!(body(response).await, "request canceled");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_request_leaves_the_worker_healthy() {
        let settings = GatewaySettings {
            request_timeout: Some(Duration::from_millis(20)),
            ..settings()
        };
        let renderer =
            StubRenderer::html("<html>late</html>").with_delay(Duration::from_millis(100));
        let h = harness(settings, renderer, 1).await;

        let (status, _) = send(&h.gateway, get("/late")).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

        // The worker finishes the render and posts into a closed channel.
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.renderer.calls().is_empty() || h.pool.available() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("page was not returned after the late render");
        assert_eq!(h.pool.outstanding(), 0);
        assert_eq!(h.renderer.calls().len(), 1);

        let d = h.dispatcher.unwrap();
        assert_eq!(d.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn dropped_request_is_logged_and_abandons_its_task() {
        let logs = Logs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let h = harness(settings(), StubRenderer::html(""), 0).await;
        let uri: Uri = "/gone".parse().unwrap();
        let headers = HeaderMap::new();

        let render = h.gateway.render(&Method::GET, &uri, &headers);
        assert!(tokio::time::timeout(Duration::from_millis(20), render).await.is_err());

        let task = h.queue.dequeue().unwrap();
        assert!(task.is_abandoned());
        assert!(
            logs.contents()
                .contains("Request canceled by client target=https://site.test/gone")
        );
    }

    #[tokio::test]
    async fn cancel_pending_releases_waiting_requests() {
        let h = harness(settings(), StubRenderer::html(""), 0).await;

        let gateway = h.gateway.clone();
        let pending = tokio::spawn(async move { send(&gateway, get("/stuck")).await.0 });

        while h.queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.gateway.cancel_pending();

        assert_eq!(pending.await.unwrap(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn dropped_task_is_service_unavailable() {
        let h = harness(settings(), StubRenderer::html(""), 0).await;

        let queue = Arc::clone(&h.queue);
        let dropper = tokio::spawn(async move {
            let task = queue.wait_dequeue(&Cancel::never()).await.unwrap();
            drop(task);
        });

        let (status, _) = send(&h.gateway, get("/orphan")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        dropper.await.unwrap();
    }

    #[test]
    fn target_keeps_the_base_host() {
        let gateway = Gateway::new(settings(), Arc::new(TaskQueue::new()));

        let target = gateway.resolve_target(&"//other.host/x".parse().unwrap());
        assert_eq!(target.host_str(), Some("site.test"));

        let target = gateway.resolve_target(&"/a/./b/../c".parse().unwrap());
        assert_eq!(target.as_str(), "https://site.test/a/c");
    }

    #[test]
    fn target_replaces_base_path_and_query() {
        let settings = GatewaySettings {
            base_url: Url::parse("https://site.test/app/?lang=en#top").unwrap(),
            ..settings()
        };
        let gateway = Gateway::new(settings, Arc::new(TaskQueue::new()));

        let target = gateway.resolve_target(&"/docs".parse().unwrap());
        assert_eq!(target.as_str(), "https://site.test/docs");
    }
}

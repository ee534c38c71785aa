use std::{
    cell::{Cell, RefCell},
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use docgate_core::{
    http::ResponseWithContinue,
    log::{LogLevel, RequestLogger},
    process::{ChildProcess, EngineConfig, Exit, Launcher, RestartPolicy, Supervisor},
    resource::{DeferredResource, ResourceError, ResourceSlot},
    trace::Trace,
    Error, ErrorKind,
};
use docgate_services::{
    http::generate_response,
    pipeline::{
        CatchPanicHandler, CleanupHandler, ErrorHandler, LogHandler, ResourceHandler,
        ResourceSettings, TraceHandler,
    },
};
use http::{header, Method, Request, Response, StatusCode};
use monoio_http::common::body::{Body, FixedBody, HttpBody};
use service_async::{ParamRef, Service};

certain_map::certain_map! {
    #[style = "unfilled"]
    #[derive(Debug, Clone)]
    #[empty(EmptyContext)]
    #[full(FullContext)]
    pub struct Context {
        trace: Trace,
        logger: RequestLogger,
        resource: ResourceSlot,
    }
}

type Pipeline<H> =
    TraceHandler<CleanupHandler<LogHandler<ErrorHandler<CatchPanicHandler<ResourceHandler<H>>>>>>;

fn pipeline<H>(handler: H, root: &Path, level: LogLevel) -> Pipeline<H> {
    let settings = ResourceSettings {
        root: root.to_path_buf(),
        max_body_bytes: 1 << 20,
    };
    TraceHandler::new(
        CleanupHandler::new(LogHandler::new(ErrorHandler::new(CatchPanicHandler::new(
            ResourceHandler::new(handler, settings),
        )))),
        level,
    )
}

/// Handler answering from a closure over the request and its resource slot.
struct Fake<F>(F);

fn fake<F>(f: F) -> Fake<F>
where
    F: Fn(&Request<HttpBody>, &ResourceSlot) -> Result<Response<HttpBody>, Error>,
{
    Fake(f)
}

impl<F, CX> Service<(Request<HttpBody>, CX)> for Fake<F>
where
    F: Fn(&Request<HttpBody>, &ResourceSlot) -> Result<Response<HttpBody>, Error>,
    CX: ParamRef<ResourceSlot>,
{
    type Response = ResponseWithContinue<HttpBody>;
    type Error = Error;

    async fn call(
        &self,
        (req, ctx): (Request<HttpBody>, CX),
    ) -> Result<Self::Response, Self::Error> {
        (self.0)(&req, ParamRef::<ResourceSlot>::param_ref(&ctx)).map(|resp| (resp, true))
    }
}

/// Handler that needs a worker before doing anything.
struct NeedsWorker(Supervisor);

impl<CX> Service<(Request<HttpBody>, CX)> for NeedsWorker {
    type Response = ResponseWithContinue<HttpBody>;
    type Error = Error;

    async fn call(&self, _: (Request<HttpBody>, CX)) -> Result<Self::Response, Self::Error> {
        let _worker = self.0.acquire("chromium", Duration::from_millis(200)).await?;
        Ok((generate_response(StatusCode::OK, false), true))
    }
}

#[derive(Clone, Default)]
struct Logs(Arc<Mutex<Vec<u8>>>);

impl Write for Logs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Logs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn run<F: Future>(logs: &Logs, f: F) -> F::Output {
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        docgate_core::runtime::legacy().unwrap().block_on(f)
    })
}

async fn call<S>(svc: &S, req: Request<HttpBody>) -> Response<HttpBody>
where
    S: Service<
        (Request<HttpBody>, EmptyContext),
        Response = ResponseWithContinue<HttpBody>,
        Error = std::convert::Infallible,
    >,
{
    match svc.call((req, EmptyContext::default())).await {
        Ok((resp, _)) => resp,
        Err(never) => match never {},
    }
}

async fn body_text(resp: Response<HttpBody>) -> String {
    let mut body = resp.into_body();
    let mut out = Vec::new();
    while let Some(chunk) = body.next_data().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(out).unwrap()
}

const BOUNDARY: &str = "docgate-test-boundary";

fn form_request(path: &str, values: &[(&str, &str)], files: &[(&str, &str)]) -> Request<HttpBody> {
    let mut body = String::new();
    for (name, value) in values {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    for (file_name, content) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(HttpBody::fixed_body(Some(Bytes::from(body))))
        .unwrap()
}

fn get(path: &str) -> Request<HttpBody> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(HttpBody::fixed_body(None))
        .unwrap()
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn ok() -> Result<Response<HttpBody>, Error> {
    Ok(generate_response(StatusCode::OK, false))
}

#[test]
fn invalid_arguments_are_rejected_before_the_handler() {
    let root = tempfile::tempdir().unwrap();
    let called = Rc::new(Cell::new(false));
    let flag = called.clone();
    let svc = pipeline(
        fake(move |_, _| {
            flag.set(true);
            ok()
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();

    let resp = run(&logs, async {
        let req = form_request("/convert", &[("waitTimeout", "soon")], &[("a.html", "<p/>")]);
        call(&svc, req).await
    });

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!called.get());
    assert!(is_empty_dir(root.path()));
    assert_eq!(logs.text().matches("op=resource.acquire").count(), 1);
}

#[test]
fn pipeline_owned_workspace_is_closed_once() {
    let root = tempfile::tempdir().unwrap();
    let seen = Rc::new(RefCell::new(Vec::<PathBuf>::new()));
    let dirs = seen.clone();
    let svc = pipeline(
        fake(move |_, slot| {
            assert!(slot.has_resource());
            let dir = slot.must_resource(|r| r.dir().unwrap().to_path_buf());
            assert!(dir.join("a.html").is_file());
            dirs.borrow_mut().push(dir);
            ok()
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();

    let statuses = run(&logs, async {
        let first = call(&svc, form_request("/convert", &[], &[("a.html", "<p/>")])).await;
        let second = call(&svc, form_request("/convert", &[], &[("a.html", "<p/>")])).await;
        (first.status(), second.status())
    });

    assert_eq!(statuses, (StatusCode::OK, StatusCode::OK));
    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);
    assert!(seen.iter().all(|dir| !dir.exists()));
    assert!(is_empty_dir(root.path()));
    let text = logs.text();
    assert!(!text.contains("pipeline.cleanup"), "{text}");
    assert!(!text.contains("dropped without close"), "{text}");
}

#[test]
fn early_close_is_logged_without_changing_the_response() {
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(
        fake(|_, slot| {
            slot.must_resource(|r| r.close()).unwrap();
            ok()
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();

    let (first, second) = run(&logs, async {
        let first = call(&svc, form_request("/convert", &[], &[])).await;
        let second = call(&svc, form_request("/convert", &[], &[])).await;
        (first.status(), second.status())
    });

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert!(is_empty_dir(root.path()));
    let text = logs.text();
    assert_eq!(text.matches("op=pipeline.cleanup").count(), 2, "{text}");
    assert!(text.contains(&ResourceError::AlreadyClosed.to_string()));
}

#[test]
fn deferred_workspace_outlives_the_pipeline() {
    let root = tempfile::tempdir().unwrap();
    let claimed = Rc::new(RefCell::new(None::<DeferredResource>));
    let stash = claimed.clone();
    let svc = pipeline(
        fake(move |_, slot| {
            *stash.borrow_mut() = slot.transfer();
            Ok(generate_response(StatusCode::NO_CONTENT, false))
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();

    let resp = run(&logs, async {
        let req = form_request(
            "/convert",
            &[("webhookURL", "http://127.0.0.1:9/hook")],
            &[("a.html", "<p/>")],
        );
        call(&svc, req).await
    });

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let mut deferred = claimed.borrow_mut().take().unwrap();
    let dir = deferred.dir().unwrap().to_path_buf();
    assert!(dir.join("a.html").is_file());
    assert_eq!(deferred.webhook_url(), "http://127.0.0.1:9/hook");

    deferred.close().unwrap();
    assert!(!dir.exists());
    assert!(matches!(deferred.close(), Err(ResourceError::AlreadyClosed)));
    assert!(!logs.text().contains("dropped without close"));
}

#[test]
fn unclaimed_webhook_workspace_is_closed_by_the_pipeline() {
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(
        fake(|_, slot| {
            assert!(slot.has_resource());
            Err(Error::invalid("route", "no route for /forms/none"))
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();

    let resp = run(&logs, async {
        let req = form_request(
            "/forms/none",
            &[("webhookURL", "http://127.0.0.1:9/hook")],
            &[("a.html", "<p/>")],
        );
        call(&svc, req).await
    });

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(is_empty_dir(root.path()));
    let logs = logs.text();
    assert!(!logs.contains("dropped without close"), "{logs}");
    assert!(!logs.contains("op=pipeline.cleanup"), "{logs}");
}

#[test]
fn ping_has_no_workspace_and_logs_only_at_debug() {
    for (level, logged) in [(LogLevel::Info, false), (LogLevel::Debug, true)] {
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(
            fake(|req, slot| {
                assert_eq!(req.uri().path(), "/ping");
                assert!(!slot.has_resource());
                ok()
            }),
            root.path(),
            level,
        );
        let logs = Logs::default();
        let resp = run(&logs, call(&svc, get("/ping")));

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(is_empty_dir(root.path()));
        assert_eq!(logs.text().contains("GET /ping 200"), logged);
    }
}

#[test]
fn status_depends_only_on_the_error_kind() {
    let cases = [
        (ErrorKind::Invalid, StatusCode::BAD_REQUEST),
        (ErrorKind::Timeout, StatusCode::BAD_GATEWAY),
        (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (kind, status) in cases {
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(
            fake(move |_, _| Err(Error::new("test.handler", kind, "went wrong"))),
            root.path(),
            LogLevel::Info,
        );
        let logs = Logs::default();
        let (got, body) = run(&logs, async {
            let resp = call(&svc, form_request("/convert", &[], &[])).await;
            (resp.status(), body_text(resp).await)
        });

        assert_eq!(got, status);
        assert_eq!(body, r#"{"message":"went wrong"}"#);
        assert_eq!(logs.text().matches("op=test.handler").count(), 1);
        assert!(is_empty_dir(root.path()));
    }
}

#[test]
fn internal_causes_are_not_shown_to_clients() {
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(
        fake(|_, _| Err(Error::internal("test.handler", "secret path /etc/x"))),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();
    let body = run(&logs, async {
        body_text(call(&svc, form_request("/convert", &[], &[])).await).await
    });

    assert!(!body.contains("secret"));
    assert!(body.contains("An internal error has occurred"));
    assert!(logs.text().contains("secret path /etc/x"));
}

#[test]
fn transport_errors_pass_through_untouched() {
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(
        fake(|_, _| Err(Error::transport("route", StatusCode::NOT_FOUND))),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();
    let (status, body) = run(&logs, async {
        let resp = call(&svc, form_request("/missing", &[], &[])).await;
        (resp.status(), body_text(resp).await)
    });

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, r#"{"message":"Not Found"}"#);
    assert!(!logs.text().contains("op=route"));
    assert!(is_empty_dir(root.path()));
}

#[test]
fn handler_panic_still_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(
        fake(|_, slot| {
            slot.must_resource(|_| panic!("engine exploded"));
            ok()
        }),
        root.path(),
        LogLevel::Info,
    );
    let logs = Logs::default();
    let resp = run(&logs, call(&svc, form_request("/convert", &[], &[("a.html", "x")])));

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(is_empty_dir(root.path()));
    let text = logs.text();
    assert!(text.contains("engine exploded"));
    assert!(!text.contains("dropped without close"));
}

struct Dying;

impl ChildProcess for Dying {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> io::Result<Option<Exit>> {
        Ok(Some(Exit::Code(1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct DyingLauncher;

impl Launcher for DyingLauncher {
    fn launch(&self, _: &EngineConfig, _: u16) -> io::Result<Box<dyn ChildProcess>> {
        Ok(Box::new(Dying))
    }
}

#[test]
fn no_healthy_worker_is_a_bad_gateway() {
    let engine = EngineConfig {
        name: "chromium".to_string(),
        instances: 2,
        command: vec!["chromium".to_string()],
        base_port: None,
        probe: false,
        convert: Vec::new(),
    };
    let policy = RestartPolicy {
        max_restarts: 1,
        backoff_ms: 1,
        max_backoff_ms: 1,
        poll_ms: 5,
        startup_grace_ms: 1000,
    };
    let supervisor = Supervisor::start(vec![engine], policy, Arc::new(DyingLauncher)).unwrap();
    let root = tempfile::tempdir().unwrap();
    let svc = pipeline(NeedsWorker(supervisor.clone()), root.path(), LogLevel::Info);
    let logs = Logs::default();

    let resp = run(&logs, call(&svc, form_request("/convert", &[], &[])));

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(is_empty_dir(root.path()));
    assert_eq!(logs.text().matches("op=supervisor.acquire").count(), 1);
    supervisor.shutdown();
}

#[cfg(unix)]
mod conversion {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use docgate_core::process::{CommandLauncher, WorkerState};
    use docgate_services::http::handlers::{ConvertTimeouts, RouteConfig, RouteHandler};
    use monoio::{
        io::{AsyncReadRent, AsyncWriteRentExt},
        net::TcpListener,
    };
    use service_async::MakeService;

    use super::*;

    // sh -c SCRIPT $0 $1..: copies the first input to the output
    const COPY: [&str; 5] = ["sh", "-c", "cat \"$1\" > \"$0\"", "{output}", "{inputs}"];

    /// Launches real commands and counts how often it was asked to.
    #[derive(Default)]
    struct CountingLauncher(AtomicUsize);

    impl CountingLauncher {
        fn launches(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Launcher for CountingLauncher {
        fn launch(&self, engine: &EngineConfig, port: u16) -> io::Result<Box<dyn ChildProcess>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            CommandLauncher.launch(engine, port)
        }
    }

    fn supervisor() -> Supervisor {
        supervisor_with(&COPY, Arc::new(CommandLauncher))
    }

    fn supervisor_with(convert: &[&str], launcher: Arc<dyn Launcher>) -> Supervisor {
        let engine = EngineConfig {
            name: "copy".to_string(),
            instances: 1,
            command: vec!["sleep".to_string(), "30".to_string()],
            base_port: Some(39000),
            probe: false,
            convert: convert.iter().map(|s| s.to_string()).collect(),
        };
        let policy = RestartPolicy {
            poll_ms: 5,
            startup_grace_ms: 20,
            ..Default::default()
        };
        Supervisor::start(vec![engine], policy, launcher).unwrap()
    }

    fn routes() -> Vec<RouteConfig> {
        vec![RouteConfig {
            path: "/forms/copy/convert/html".to_string(),
            engine: "copy".to_string(),
            extensions: vec!["html".to_string()],
        }]
    }

    #[test]
    fn converts_through_a_supervised_engine() {
        let supervisor = supervisor();
        let router = RouteHandler::factory(routes(), supervisor.clone(), ConvertTimeouts::default())
            .make()
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(router, root.path(), LogLevel::Info);
        let logs = Logs::default();

        let (status, disposition, body) = run(&logs, async {
            let req = form_request(
                "/forms/copy/convert/html",
                &[("resultFilename", "report")],
                &[("index.html", "<h1>hello</h1>")],
            );
            let resp = call(&svc, req).await;
            let disposition = resp
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .map(|v| v.to_str().unwrap().to_string());
            (resp.status(), disposition, body_text(resp).await)
        });

        assert_eq!(status, StatusCode::OK, "{}", logs.text());
        assert_eq!(body, "<h1>hello</h1>");
        assert_eq!(
            disposition.as_deref(),
            Some("attachment; filename=\"report.pdf\"")
        );
        assert!(is_empty_dir(root.path()));
        supervisor.shutdown();
    }

    #[test]
    fn routing_errors_and_rejected_webhooks() {
        let supervisor = supervisor();
        let router = RouteHandler::factory(routes(), supervisor.clone(), ConvertTimeouts::default())
            .make()
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(router, root.path(), LogLevel::Info);
        let logs = Logs::default();

        let statuses = run(&logs, async {
            let wrong_method = call(&svc, get("/forms/copy/convert/html")).await.status();
            let unknown = call(&svc, form_request("/forms/none", &[], &[])).await.status();
            let https_hook = call(
                &svc,
                form_request(
                    "/forms/copy/convert/html",
                    &[("webhookURL", "https://127.0.0.1/hook")],
                    &[("index.html", "<p/>")],
                ),
            )
            .await
            .status();
            (wrong_method, unknown, https_hook)
        });

        assert_eq!(
            statuses,
            (
                StatusCode::METHOD_NOT_ALLOWED,
                StatusCode::NOT_FOUND,
                StatusCode::BAD_REQUEST
            )
        );
        assert!(is_empty_dir(root.path()));
        assert!(!logs.text().contains("dropped without close"));
        supervisor.shutdown();
    }

    /// Answers one request with 200 and returns everything it received.
    async fn accept_hook(listener: TcpListener) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        while !request_complete(&received) {
            let (res, buf) = stream.read(Vec::with_capacity(4096)).await;
            if res.unwrap() == 0 {
                break;
            }
            received.extend_from_slice(&buf);
        }
        let reply = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n".to_vec();
        let (res, _) = stream.write_all(reply).await;
        res.unwrap();
        String::from_utf8_lossy(&received).into_owned()
    }

    fn request_complete(data: &[u8]) -> bool {
        let text = String::from_utf8_lossy(data);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let len = text[..end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        data.len() >= end + 4 + len
    }

    #[test]
    fn webhook_receives_the_pdf_and_the_workspace_is_removed() {
        let supervisor = supervisor();
        let router = RouteHandler::factory(routes(), supervisor.clone(), ConvertTimeouts::default())
            .make()
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(router, root.path(), LogLevel::Info);
        let logs = Logs::default();

        let (status, received) = run(&logs, async {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let hook_url = format!("http://{}/hook", listener.local_addr().unwrap());
            let hook = monoio::spawn(accept_hook(listener));
            let req = form_request(
                "/forms/copy/convert/html",
                &[("webhookURL", hook_url.as_str())],
                &[("index.html", "<h1>hook</h1>")],
            );
            let status = call(&svc, req).await.status();
            let received = hook.await;
            for _ in 0..200 {
                if is_empty_dir(root.path()) {
                    break;
                }
                monoio::time::sleep(Duration::from_millis(10)).await;
            }
            (status, received)
        });

        assert_eq!(status, StatusCode::NO_CONTENT, "{}", logs.text());
        assert!(received.starts_with("POST /hook HTTP/1.1\r\n"), "{received}");
        assert!(received.to_ascii_lowercase().contains("content-type: application/pdf"));
        assert!(received.ends_with("<h1>hook</h1>"), "{received}");
        assert!(is_empty_dir(root.path()));
        let logs = logs.text();
        assert!(logs.contains("op=webhook.deliver"), "{logs}");
        assert!(logs.contains("delivered to http://127.0.0.1:"), "{logs}");
        assert!(!logs.contains("dropped without close"));
        supervisor.shutdown();
    }

    #[test]
    fn missed_deadline_is_a_bad_gateway_and_restarts_the_worker() {
        let launcher = Arc::new(CountingLauncher::default());
        let supervisor = supervisor_with(
            &["sh", "-c", "exec sleep 5", "{output}", "{inputs}"],
            launcher.clone(),
        );
        let router = RouteHandler::factory(routes(), supervisor.clone(), ConvertTimeouts::default())
            .make()
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let svc = pipeline(router, root.path(), LogLevel::Info);
        let logs = Logs::default();

        let (status, body) = run(&logs, async {
            let req = form_request(
                "/forms/copy/convert/html",
                &[("waitTimeout", "200ms")],
                &[("index.html", "<p/>")],
            );
            let resp = call(&svc, req).await;
            (resp.status(), body_text(resp).await)
        });

        assert_eq!(status, StatusCode::BAD_GATEWAY, "{}", logs.text());
        assert!(body.contains("message"), "{body}");
        assert!(is_empty_dir(root.path()));
        assert!(logs.text().contains("op=convert.run"));

        // the timed out worker is killed and launched again
        for _ in 0..500 {
            if launcher.launches() == 2 && supervisor.healthy("copy") {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(launcher.launches(), 2);
        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot[0].state, WorkerState::Healthy);
        // a poisoned worker does not count against the restart budget
        assert_eq!(snapshot[0].restarts, 0);
        supervisor.shutdown();
    }
}

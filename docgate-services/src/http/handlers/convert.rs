//! Document conversion through the engine workers.
//!
//! A [`ConversionJob`] is prepared from the request workspace, then the
//! [`Converter`] leases a worker of the route's engine and runs the engine's
//! `convert` command template against it under the job deadline.
//!
//! Template placeholders: `{inputs}` as a whole argument expands to every
//! input file; `{port}`, `{output}`, `{url}`, `{landscape}` and
//! `{page_ranges}` are replaced inside any argument.
use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use docgate_core::{
    http::ResponseWithContinue,
    log::RequestLogger,
    process::{self, CommandOutcome, EngineConfig, Exit, Supervisor, PORT_PLACEHOLDER},
    resource::{ArgKey, Resource, ResourceSlot},
    Error, ErrorKind,
};
use http::{header, HeaderValue, StatusCode};
use monoio_http::common::body::HttpBody;
use service_async::ParamRef;

use super::{route::RouteConfig, webhook::WebhookDelivery};
use crate::http::{body_response, generate_response};

const OP_PREPARE: &str = "convert.prepare";
const OP_RUN: &str = "convert.run";
const DEFAULT_FILENAME: &str = "result.pdf";
// how often a running conversion is checked
const COMMAND_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
pub struct ConvertTimeouts {
    /// Wait for an idle healthy worker.
    pub acquire: Duration,
    /// Conversion deadline when the request gives no `waitTimeout`.
    pub convert: Duration,
    /// Largest `waitTimeout` a request may ask for.
    pub max_convert: Duration,
    /// Webhook POST deadline when the request gives no `webhookURLTimeout`.
    pub webhook: Duration,
}

impl Default for ConvertTimeouts {
    fn default() -> Self {
        Self {
            acquire: Duration::from_secs(10),
            convert: Duration::from_secs(30),
            max_convert: Duration::from_secs(120),
            webhook: Duration::from_secs(30),
        }
    }
}

/// Everything needed to run one conversion, detached from the request.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub engine: String,
    pub template: Vec<String>,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub url: Option<String>,
    pub landscape: bool,
    pub page_ranges: String,
    pub wait: Duration,
    pub filename: String,
}

impl ConversionJob {
    pub fn from_resource(
        route: &RouteConfig,
        engine: &EngineConfig,
        resource: &Resource,
        timeouts: &ConvertTimeouts,
    ) -> Result<Self, Error> {
        if engine.convert.is_empty() {
            return Err(Error::new(
                OP_PREPARE,
                ErrorKind::Internal,
                format!("engine '{}' has no convert command", engine.name),
            ));
        }
        let inputs = resource.files(&route.extensions)?;
        let url = resource.arg(ArgKey::RemoteUrl)?.map(str::to_string);
        if inputs.is_empty() && url.is_none() {
            return Err(Error::invalid(
                OP_PREPARE,
                format!(
                    "no form file found for extensions: [{}]",
                    route.extensions.join(", ")
                ),
            ));
        }
        let wait = resource
            .duration_arg(ArgKey::WaitTimeout)?
            .unwrap_or(timeouts.convert);
        if wait > timeouts.max_convert {
            return Err(Error::invalid(
                OP_PREPARE,
                format!(
                    "'{}' must not exceed {:?}",
                    ArgKey::WaitTimeout,
                    timeouts.max_convert
                ),
            ));
        }
        let mut filename = resource
            .arg_or(ArgKey::ResultFilename, DEFAULT_FILENAME)?
            .to_string();
        if !filename.to_ascii_lowercase().ends_with(".pdf") {
            filename.push_str(".pdf");
        }

        Ok(Self {
            engine: engine.name.clone(),
            template: engine.convert.clone(),
            inputs,
            output: resource.output_path()?,
            url,
            landscape: resource.bool_arg(ArgKey::Landscape)?.unwrap_or(false),
            page_ranges: resource.arg_or(ArgKey::PageRanges, "")?.to_string(),
            wait,
            filename,
        })
    }

    /// Renders the command template for the worker listening on `port`.
    pub fn argv(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        let output = self.output.display().to_string();
        let landscape = self.landscape.to_string();
        let mut argv = Vec::with_capacity(self.template.len() + self.inputs.len());
        for arg in self.template.iter() {
            if arg == "{inputs}" {
                argv.extend(self.inputs.iter().map(|p| p.display().to_string()));
                continue;
            }
            argv.push(
                arg.replace(PORT_PLACEHOLDER, &port)
                    .replace("{output}", &output)
                    .replace("{url}", self.url.as_deref().unwrap_or_default())
                    .replace("{landscape}", &landscape)
                    .replace("{page_ranges}", &self.page_ranges),
            );
        }
        argv
    }
}

#[derive(Debug, Clone)]
pub struct Converter {
    supervisor: Supervisor,
    timeouts: ConvertTimeouts,
}

impl Converter {
    pub fn new(supervisor: Supervisor, timeouts: ConvertTimeouts) -> Self {
        Self {
            supervisor,
            timeouts,
        }
    }

    #[inline]
    pub fn timeouts(&self) -> &ConvertTimeouts {
        &self.timeouts
    }

    pub fn prepare(&self, route: &RouteConfig, resource: &Resource) -> Result<ConversionJob, Error> {
        let engine = self.supervisor.engine(&route.engine).ok_or_else(|| {
            Error::new(
                OP_PREPARE,
                ErrorKind::Internal,
                format!("unknown engine '{}'", route.engine),
            )
        })?;
        ConversionJob::from_resource(route, engine, resource, &self.timeouts)
    }

    /// Runs the job on a leased worker and returns the produced PDF.
    pub async fn run(&self, job: &ConversionJob) -> Result<Bytes, Error> {
        let worker = self
            .supervisor
            .acquire(&job.engine, self.timeouts.acquire)
            .await?;
        let argv = job.argv(worker.port());
        let outcome = process::run(&argv, job.wait, COMMAND_POLL)
            .await
            .map_err(|e| Error::internal(OP_RUN, e))?;
        match outcome {
            CommandOutcome::TimedOut => {
                worker.poison();
                Err(Error::timeout(
                    OP_RUN,
                    format!("conversion exceeded {:?}", job.wait),
                ))
            }
            CommandOutcome::Exited(Exit::Code(0)) => {
                drop(worker);
                let pdf = std::fs::read(&job.output).map_err(|e| Error::internal(OP_RUN, e))?;
                Ok(Bytes::from(pdf))
            }
            CommandOutcome::Exited(exit) => Err(Error::internal(
                OP_RUN,
                format!("{} conversion failed with {exit}", job.engine),
            )),
        }
    }
}

/// Serves conversion routes, synchronously or through webhook delivery.
pub struct ConvertHandler {
    converter: Converter,
    webhook: WebhookDelivery,
}

impl ConvertHandler {
    pub fn new(supervisor: Supervisor, timeouts: ConvertTimeouts) -> Self {
        let converter = Converter::new(supervisor, timeouts);
        Self {
            webhook: WebhookDelivery::new(converter.clone()),
            converter,
        }
    }

    pub async fn convert<CX>(
        &self,
        route: &RouteConfig,
        ctx: &CX,
    ) -> Result<ResponseWithContinue<HttpBody>, Error>
    where
        CX: ParamRef<ResourceSlot> + ParamRef<RequestLogger>,
    {
        let slot = ParamRef::<ResourceSlot>::param_ref(ctx);
        if !slot.has_resource() {
            return Err(Error::new(
                OP_PREPARE,
                ErrorKind::Internal,
                "conversion request without workspace",
            ));
        }

        if let Some(mut deferred) = slot.transfer() {
            // from here on the workspace is ours to close
            let logger = ParamRef::<RequestLogger>::param_ref(ctx).clone();
            let prepared = WebhookDelivery::target(deferred.webhook_url())
                .and_then(|target| Ok((target, self.converter.prepare(route, &deferred)?)));
            let (target, job) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    if let Err(close) = deferred.close() {
                        logger.error_op("webhook.cleanup", &close);
                    }
                    return Err(e);
                }
            };
            self.webhook.spawn(target, job, deferred, logger);
            return Ok((generate_response(StatusCode::NO_CONTENT, false), true));
        }

        let job = slot.must_resource(|resource| self.converter.prepare(route, resource))?;
        let pdf = self.converter.run(&job).await?;
        Ok((pdf_response(pdf, &job.filename), true))
    }
}

fn pdf_response(pdf: Bytes, filename: &str) -> http::Response<HttpBody> {
    let mut resp = body_response(
        StatusCode::OK,
        HeaderValue::from_static("application/pdf"),
        pdf,
    );
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        resp.headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
    }
    resp
}

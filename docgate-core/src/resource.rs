//! Per-request workspaces.
//!
//! A [`Resource`] owns a scratch directory named after the request trace,
//! the form arguments of the request and every file written under that
//! directory. Who is responsible for closing it is explicit:
//! [`Ownership::Pipeline`] resources are closed by the cleanup stage, while
//! [`Ownership::Deferred`] ones (a webhook was requested) are moved out of the
//! [`ResourceSlot`] as a [`DeferredResource`] and closed by the delivery task.
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt, fs, io,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;

use crate::{
    error::{Error, ErrorKind},
    trace::Trace,
};

const OP_ACQUIRE: &str = "resource.acquire";

/// Form fields understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKey {
    ResultFilename,
    WaitTimeout,
    WebhookUrl,
    WebhookUrlTimeout,
    RemoteUrl,
    Landscape,
    PageRanges,
    PaperWidth,
    PaperHeight,
    Scale,
}

impl ArgKey {
    pub const ALL: [ArgKey; 10] = [
        ArgKey::ResultFilename,
        ArgKey::WaitTimeout,
        ArgKey::WebhookUrl,
        ArgKey::WebhookUrlTimeout,
        ArgKey::RemoteUrl,
        ArgKey::Landscape,
        ArgKey::PageRanges,
        ArgKey::PaperWidth,
        ArgKey::PaperHeight,
        ArgKey::Scale,
    ];

    pub const fn form_name(self) -> &'static str {
        match self {
            ArgKey::ResultFilename => "resultFilename",
            ArgKey::WaitTimeout => "waitTimeout",
            ArgKey::WebhookUrl => "webhookURL",
            ArgKey::WebhookUrlTimeout => "webhookURLTimeout",
            ArgKey::RemoteUrl => "remoteURL",
            ArgKey::Landscape => "landscape",
            ArgKey::PageRanges => "pageRanges",
            ArgKey::PaperWidth => "paperWidth",
            ArgKey::PaperHeight => "paperHeight",
            ArgKey::Scale => "scale",
        }
    }

    pub fn from_form_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.form_name() == name)
    }

    // Checks the raw form value of typed keys.
    fn validate(self, value: &str) -> Result<(), ResourceError> {
        let ok = match self {
            ArgKey::WaitTimeout | ArgKey::WebhookUrlTimeout => parse_duration(value).is_some(),
            ArgKey::Landscape => parse_bool(value).is_some(),
            ArgKey::PaperWidth | ArgKey::PaperHeight | ArgKey::Scale => {
                parse_positive(value).is_some()
            }
            ArgKey::WebhookUrl | ArgKey::RemoteUrl => !value.trim().is_empty(),
            ArgKey::ResultFilename | ArgKey::PageRanges => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ResourceError::InvalidArg {
                key: self.form_name(),
                value: value.to_string(),
            })
        }
    }
}

impl fmt::Display for ArgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.form_name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("resource is closed")]
    Closed,
    #[error("resource is already closed")]
    AlreadyClosed,
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("duplicate file name {0:?}")]
    DuplicateFileName(String),
    #[error("invalid value {value:?} for form field '{key}'")]
    InvalidArg { key: &'static str, value: String },
    #[error("workspace io error: {0}")]
    Io(#[from] io::Error),
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        match e {
            ResourceError::InvalidFileName(_)
            | ResourceError::DuplicateFileName(_)
            | ResourceError::InvalidArg { .. } => Error::new("resource", ErrorKind::Invalid, e.to_string()),
            _ => Error::internal("resource", e),
        }
    }
}

/// Who closes a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Closed by the pipeline cleanup stage.
    Pipeline,
    /// Closed by whoever delivers the result to the webhook.
    Deferred { webhook_url: String },
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content: Bytes,
}

/// Decoded request form.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    pub values: Vec<(String, String)>,
    pub files: Vec<Upload>,
}

impl FormData {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.files.is_empty()
    }
}

pub struct Resource {
    trace: Trace,
    dir: PathBuf,
    args: HashMap<ArgKey, String>,
    ownership: Ownership,
    closed: bool,
}

impl Resource {
    /// Creates `root/<trace>`, stores known form arguments and writes the
    /// uploaded files into it.
    ///
    /// Arguments and file names are validated before anything touches the
    /// disk; if writing fails halfway the directory is removed again.
    pub fn acquire(root: &Path, trace: &Trace, form: FormData) -> Result<Resource, Error> {
        let mut args = HashMap::new();
        for (name, value) in form.values {
            let Some(key) = ArgKey::from_form_name(&name) else {
                continue;
            };
            key.validate(&value)
                .map_err(|e| Error::new(OP_ACQUIRE, ErrorKind::Invalid, e.to_string()))?;
            args.insert(key, value);
        }

        let mut names = Vec::with_capacity(form.files.len());
        for upload in form.files.iter() {
            let name = sanitize_file_name(&upload.file_name)
                .map_err(|e| Error::new(OP_ACQUIRE, ErrorKind::Invalid, e.to_string()))?;
            if names.contains(&name) {
                return Err(Error::invalid(
                    OP_ACQUIRE,
                    ResourceError::DuplicateFileName(name.to_string()).to_string(),
                ));
            }
            names.push(name);
        }

        let ownership = match args.get(&ArgKey::WebhookUrl) {
            Some(url) => Ownership::Deferred {
                webhook_url: url.trim().to_string(),
            },
            None => Ownership::Pipeline,
        };

        let dir = root.join(trace.as_str());
        fs::create_dir_all(root).map_err(|e| Error::internal(OP_ACQUIRE, e))?;
        fs::create_dir(&dir).map_err(|e| Error::internal(OP_ACQUIRE, e))?;

        let write = || -> io::Result<()> {
            for (name, upload) in names.iter().zip(form.files.iter()) {
                fs::write(dir.join(name), &upload.content)?;
            }
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_dir_all(&dir);
            return Err(Error::internal(OP_ACQUIRE, e));
        }

        Ok(Resource {
            trace: trace.clone(),
            dir,
            args,
            ownership,
            closed: false,
        })
    }

    #[inline]
    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    #[inline]
    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        matches!(self.ownership, Ownership::Deferred { .. })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the argument was supplied. Stays answerable after close.
    pub fn has_arg(&self, key: ArgKey) -> bool {
        self.args.contains_key(&key)
    }

    pub fn arg(&self, key: ArgKey) -> Result<Option<&str>, ResourceError> {
        self.ensure_open()?;
        Ok(self.args.get(&key).map(String::as_str))
    }

    pub fn arg_or<'a>(&'a self, key: ArgKey, default: &'a str) -> Result<&'a str, ResourceError> {
        Ok(self.arg(key)?.unwrap_or(default))
    }

    pub fn duration_arg(&self, key: ArgKey) -> Result<Option<Duration>, ResourceError> {
        self.typed_arg(key, parse_duration)
    }

    pub fn bool_arg(&self, key: ArgKey) -> Result<Option<bool>, ResourceError> {
        self.typed_arg(key, parse_bool)
    }

    pub fn float_arg(&self, key: ArgKey) -> Result<Option<f64>, ResourceError> {
        self.typed_arg(key, parse_positive)
    }

    fn typed_arg<T>(
        &self,
        key: ArgKey,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<Option<T>, ResourceError> {
        match self.arg(key)? {
            None => Ok(None),
            Some(value) => parse(value)
                .map(Some)
                .ok_or_else(|| ResourceError::InvalidArg {
                    key: key.form_name(),
                    value: value.to_string(),
                }),
        }
    }

    pub fn dir(&self) -> Result<&Path, ResourceError> {
        self.ensure_open()?;
        Ok(&self.dir)
    }

    /// Where the conversion writes its result.
    pub fn output_path(&self) -> Result<PathBuf, ResourceError> {
        self.ensure_open()?;
        Ok(self.dir.join(format!("{}.pdf", self.trace)))
    }

    /// Uploaded files whose extension is one of `extensions`, sorted by name.
    /// Extensions are compared case-insensitively, with or without the dot.
    pub fn files<S: AsRef<str>>(&self, extensions: &[S]) -> Result<Vec<PathBuf>, ResourceError> {
        let output = self.output_path()?;
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path == output || !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if extensions
                .iter()
                .any(|want| want.as_ref().trim_start_matches('.').eq_ignore_ascii_case(ext))
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes the workspace. A second call fails with
    /// [`ResourceError::AlreadyClosed`] and leaves the disk untouched.
    pub fn close(&mut self) -> Result<(), ResourceError> {
        if self.closed {
            return Err(ResourceError::AlreadyClosed);
        }
        self.closed = true;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[inline]
    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.closed {
            Err(ResourceError::Closed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("trace", &self.trace)
            .field("dir", &self.dir)
            .field("ownership", &self.ownership)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        tracing::warn!(
            trace = %self.trace,
            op = "resource.drop",
            "resource dropped without close, reclaiming {}",
            self.dir.display()
        );
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// A resource whose closing was handed over to deferred delivery.
#[derive(Debug)]
pub struct DeferredResource(Resource);

impl DeferredResource {
    pub fn webhook_url(&self) -> &str {
        match &self.0.ownership {
            Ownership::Deferred { webhook_url } => webhook_url,
            Ownership::Pipeline => unreachable!("deferred resource with pipeline ownership"),
        }
    }
}

impl Deref for DeferredResource {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.0
    }
}

impl DerefMut for DeferredResource {
    fn deref_mut(&mut self) -> &mut Resource {
        &mut self.0
    }
}

#[derive(Default)]
enum SlotState {
    #[default]
    Vacant,
    Held(Resource),
    Transferred,
    Released,
}

/// What the cleanup stage finds in a slot at the end of a request.
#[derive(Debug)]
pub enum Release {
    /// No resource was ever acquired.
    Vacant,
    /// Handed over to deferred delivery.
    Transferred,
    /// Pipeline owned: must be closed.
    Owned(Resource),
    /// Deferred ownership, but nobody claimed it.
    Unclaimed(DeferredResource),
}

/// The zero-or-one resource of a request, shared by the pipeline stages.
#[derive(Clone, Default)]
pub struct ResourceSlot(Rc<RefCell<SlotState>>);

impl ResourceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the request resource. Fails if the request already has or had
    /// one; the rejected resource is closed.
    pub fn fill(&self, mut resource: Resource) -> Result<(), Error> {
        let mut state = self.0.borrow_mut();
        if !matches!(*state, SlotState::Vacant) {
            drop(state);
            let _ = resource.close();
            return Err(Error::new(
                "resource.with_resource",
                ErrorKind::Internal,
                "request already owns a resource",
            ));
        }
        *state = SlotState::Held(resource);
        Ok(())
    }

    pub fn has_resource(&self) -> bool {
        matches!(*self.0.borrow(), SlotState::Held(_))
    }

    /// # Panics
    /// When the slot holds no resource; check [`Self::has_resource`] first.
    pub fn must_resource<R>(&self, f: impl FnOnce(&mut Resource) -> R) -> R {
        match &mut *self.0.borrow_mut() {
            SlotState::Held(resource) => f(resource),
            _ => panic!("must_resource called on a request without resource"),
        }
    }

    pub fn with_resource<R>(&self, f: impl FnOnce(&mut Resource) -> R) -> Option<R> {
        match &mut *self.0.borrow_mut() {
            SlotState::Held(resource) => Some(f(resource)),
            _ => None,
        }
    }

    pub fn is_transferred(&self) -> bool {
        matches!(*self.0.borrow(), SlotState::Transferred)
    }

    /// Moves a deferred resource out of the slot. Pipeline owned resources
    /// stay where they are.
    pub fn transfer(&self) -> Option<DeferredResource> {
        let mut state = self.0.borrow_mut();
        match &*state {
            SlotState::Held(resource) if resource.is_deferred() => {}
            _ => return None,
        }
        match std::mem::replace(&mut *state, SlotState::Transferred) {
            SlotState::Held(resource) => Some(DeferredResource(resource)),
            _ => unreachable!(),
        }
    }

    /// Empties the slot for good.
    pub fn release(&self) -> Release {
        match std::mem::replace(&mut *self.0.borrow_mut(), SlotState::Released) {
            SlotState::Vacant | SlotState::Released => Release::Vacant,
            SlotState::Transferred => Release::Transferred,
            SlotState::Held(resource) if resource.is_deferred() => {
                Release::Unclaimed(DeferredResource(resource))
            }
            SlotState::Held(resource) => Release::Owned(resource),
        }
    }
}

impl fmt::Debug for ResourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.0.borrow() {
            SlotState::Vacant => "vacant",
            SlotState::Held(_) => "held",
            SlotState::Transferred => "transferred",
            SlotState::Released => "released",
        };
        f.debug_tuple("ResourceSlot").field(&state).finish()
    }
}

fn sanitize_file_name(name: &str) -> Result<&str, ResourceError> {
    let trimmed = name.trim();
    let bad = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\0']);
    if bad {
        Err(ResourceError::InvalidFileName(name.to_string()))
    } else {
        Ok(trimmed)
    }
}

/// Accepts `500ms`, `30s`, `2m` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60.0)
    } else {
        (value, 1.0)
    };
    let secs = number.trim().parse::<f64>().ok()? * scale;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_positive(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

//! Thread-per-core workers, each running its own monoio runtime and its own
//! copy of the service stack.

use std::{
    cell::RefCell, collections::HashMap, fmt::Debug, io, net::SocketAddr, num::NonZeroUsize,
    rc::Rc, thread::JoinHandle,
};

use anyhow::{anyhow, bail};
use docgate_core::{config::RuntimeConfig, runtime::WorkerRuntime, AnyError};
use futures_channel::{
    mpsc::{channel, Receiver, Sender},
    oneshot::{channel as ochannel, Receiver as OReceiver, Sender as OSender},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use monoio::{
    io::stream::Stream,
    net::{ListenerOpts, TcpListener},
    utils::bind_to_cpu_set,
};
use service_async::{MakeService, Service};
use tracing::{debug, error, info, warn};

pub struct Manager<F, LF> {
    runtime_config: RuntimeConfig,
    workers: Vec<Sender<Update<F, LF>>>,
}

impl<F, LF> Manager<F, LF> {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            workers: Vec::new(),
        }
    }
}

impl<F, LF> Manager<F, LF>
where
    F: MakeService + Send + 'static,
    LF: Send + 'static,
{
    pub fn spawn_workers<A>(&mut self) -> io::Result<Vec<JoinHandle<()>>>
    where
        Command<F, LF>: Execute<A, F::Service>,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism()
                .ok()
                .map(NonZeroUsize::get)
        } else {
            None
        };

        let mut handles = Vec::with_capacity(self.runtime_config.workers as usize);
        for worker_id in 0..self.runtime_config.workers as usize {
            let (tx, rx) = channel(128);
            let runtime_config = self.runtime_config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("docgate-worker-{worker_id}"))
                .spawn(move || {
                    if let Some(cores) = cores {
                        let core = worker_id % cores;
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = match WorkerRuntime::build(&runtime_config) {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!("worker {worker_id} runtime build failed: {e}");
                            return;
                        }
                    };
                    debug!(worker_id, io_uring = runtime.is_io_uring(), "worker runtime ready");
                    let controller = WorkerController::<F::Service>::default();
                    runtime.block_on(controller.run_controller(rx));
                })?;
            self.workers.push(tx);
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Sends `cmd` to every worker and collects their results in order.
    pub async fn apply(&mut self, cmd: Command<F, LF>) -> Vec<Result<(), AnyError>>
    where
        Command<F, LF>: Clone,
    {
        let mut results = Vec::with_capacity(self.workers.len());
        for sender in self.workers.iter_mut() {
            let (upd, rx) = Update::new(cmd.clone());
            match sender.send(upd).await {
                Ok(_) => match rx.await {
                    Ok(r) => results.push(r),
                    Err(e) => results.push(Err(e.into())),
                },
                Err(e) => results.push(Err(e.into())),
            }
        }
        results
    }
}

pub struct WorkerController<S> {
    sites: RefCell<HashMap<String, Rc<S>>>,
}

impl<S> Default for WorkerController<S> {
    fn default() -> Self {
        Self {
            sites: RefCell::new(HashMap::new()),
        }
    }
}

/// It should be cheap to clone.
#[derive(Clone)]
pub enum Command<F, LF> {
    /// Start serving a named site from a service factory and a listener
    /// factory.
    Add(String, F, LF),
}

pub struct Update<F, LF> {
    cmd: Command<F, LF>,
    result: OSender<Result<(), AnyError>>,
}

impl<F, LF> Update<F, LF> {
    pub fn new(cmd: Command<F, LF>) -> (Self, OReceiver<Result<(), AnyError>>) {
        let (tx, rx) = ochannel();
        (Self { cmd, result: tx }, rx)
    }
}

pub trait Execute<A, S> {
    fn execute(self, controller: &WorkerController<S>) -> Result<(), AnyError>;
}

impl<F, LF, A, S> Execute<A, S> for Command<F, LF>
where
    F: MakeService<Service = S>,
    F::Error: Debug,
    LF: MakeService,
    LF::Service: Stream<Item = io::Result<A>> + 'static,
    LF::Error: Debug,
    S: Service<A> + 'static,
    S::Error: Debug,
    A: 'static,
{
    fn execute(self, controller: &WorkerController<S>) -> Result<(), AnyError> {
        match self {
            Command::Add(name, factory, listener_factory) => {
                if controller.sites.borrow().contains_key(&name) {
                    bail!("site {name} already started");
                }
                let listener = listener_factory
                    .make()
                    .map_err(|e| anyhow!("create listener fail for site {name}: {e:?}"))?;
                let svc = Rc::new(
                    factory
                        .make()
                        .map_err(|e| anyhow!("create service fail for site {name}: {e:?}"))?,
                );
                controller.sites.borrow_mut().insert(name, svc.clone());
                monoio::spawn(serve(listener, svc));
                Ok(())
            }
        }
    }
}

impl<S> WorkerController<S> {
    pub async fn run_controller<F, LF, A>(&self, mut rx: Receiver<Update<F, LF>>)
    where
        Command<F, LF>: Execute<A, S>,
    {
        info!("worker controller started");
        while let Some(upd) = rx.next().await {
            if let Err(e) = upd.result.send(upd.cmd.execute(self)) {
                error!("unable to send back result: {e:?}");
            }
        }
        info!("worker controller exit");
    }
}

pub async fn serve<S, Svc, A>(mut listener: S, handler: Rc<Svc>)
where
    S: Stream<Item = io::Result<A>> + 'static,
    Svc: Service<A> + 'static,
    Svc::Error: Debug,
    A: 'static,
{
    while let Some(accept) = listener.next().await {
        match accept {
            Ok(accept) => {
                let svc = handler.clone();
                monoio::spawn(async move {
                    match svc.call(accept).await {
                        Ok(_) => debug!("connection complete"),
                        Err(e) => error!("connection error: {e:?}"),
                    }
                });
            }
            Err(e) => warn!("accept connection failed: {e:?}"),
        }
    }
}

/// Binds one listener per worker on the same address with SO_REUSEPORT so
/// the kernel spreads connections across threads.
#[derive(Debug, Clone, Copy)]
pub struct ReusePortListenerBuilder {
    pub addr: SocketAddr,
}

impl MakeService for ReusePortListenerBuilder {
    type Service = TcpListener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        // default opts carry SO_REUSEADDR and SO_REUSEPORT
        TcpListener::bind_with_config(self.addr, &ListenerOpts::default())
    }
}

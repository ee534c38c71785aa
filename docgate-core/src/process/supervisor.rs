use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{error, info, warn};

use super::{ChildProcess, EngineConfig, Launcher, RestartPolicy, WorkerState};
use crate::error::{Error, ErrorKind};

const OP_ACQUIRE: &str = "supervisor.acquire";

struct Instance {
    engine: usize,
    index: usize,
    port: u16,
    state: WorkerState,
    restarts: u32,
    generation: u64,
    leased: bool,
    poisoned: bool,
}

struct Shared {
    instances: Vec<Instance>,
    stopping: bool,
}

struct Inner {
    engines: Vec<EngineConfig>,
    policy: RestartPolicy,
    shared: Mutex<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: usize, state: WorkerState) {
        self.lock().instances[id].state = state;
    }

    // Takes a pending poison request. A poisoned instance leaves `Healthy`
    // under the same guard, so it is never leased while being killed.
    fn take_poison(&self, id: usize) -> bool {
        let mut shared = self.lock();
        let instance = &mut shared.instances[id];
        if !std::mem::take(&mut instance.poisoned) {
            return false;
        }
        instance.state = WorkerState::Restarting;
        true
    }

    // Records a crash; returns the restart delay, or None when the budget is
    // exhausted and the instance is given up.
    fn crashed(&self, id: usize) -> Option<Duration> {
        let mut shared = self.lock();
        let instance = &mut shared.instances[id];
        instance.state = WorkerState::Crashed;
        if instance.restarts >= self.policy.max_restarts {
            instance.state = WorkerState::PermanentlyFailed;
            error!(
                engine = %self.engines[instance.engine].name,
                index = instance.index,
                restarts = instance.restarts,
                "worker permanently failed"
            );
            return None;
        }
        let delay = self.policy.backoff(instance.restarts);
        instance.restarts += 1;
        instance.state = WorkerState::Restarting;
        Some(delay)
    }
}

/// One instance as reported by the health check.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub engine: String,
    pub index: usize,
    pub port: u16,
    pub state: WorkerState,
    pub restarts: u32,
}

/// Owner of every engine worker process. Cheap to clone; all clones share
/// the same pool.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Starts the supervision thread with one supervision task per instance.
    pub fn start(
        engines: Vec<EngineConfig>,
        policy: RestartPolicy,
        launcher: Arc<dyn Launcher>,
    ) -> std::io::Result<Self> {
        let mut instances = Vec::new();
        for (engine_idx, engine) in engines.iter().enumerate() {
            for index in 0..engine.instances {
                instances.push(Instance {
                    engine: engine_idx,
                    index,
                    port: engine.port(index),
                    state: WorkerState::Starting,
                    restarts: 0,
                    generation: 0,
                    leased: false,
                    poisoned: false,
                });
            }
        }
        let count = instances.len();
        let inner = Arc::new(Inner {
            engines,
            policy,
            shared: Mutex::new(Shared {
                instances,
                stopping: false,
            }),
            thread: Mutex::new(None),
        });

        let task_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("docgate-supervisor".to_string())
            .spawn(move || {
                let mut rt = match crate::runtime::legacy() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("unable to build supervisor runtime: {e}");
                        let mut shared = task_inner.lock();
                        for instance in shared.instances.iter_mut() {
                            instance.state = WorkerState::PermanentlyFailed;
                        }
                        return;
                    }
                };
                rt.block_on(async move {
                    let tasks: Vec<_> = (0..count)
                        .map(|id| monoio::spawn(supervise(task_inner.clone(), launcher.clone(), id)))
                        .collect();
                    for task in tasks {
                        task.await;
                    }
                });
            })?;
        *inner.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(Supervisor { inner })
    }

    pub fn engines(&self) -> &[EngineConfig] {
        &self.inner.engines
    }

    pub fn engine(&self, name: &str) -> Option<&EngineConfig> {
        self.inner.engines.iter().find(|e| e.name == name)
    }

    #[inline]
    pub fn policy(&self) -> &RestartPolicy {
        &self.inner.policy
    }

    /// At least one instance of the engine is healthy.
    pub fn healthy(&self, name: &str) -> bool {
        let shared = self.inner.lock();
        shared
            .instances
            .iter()
            .any(|i| self.inner.engines[i.engine].name == name && i.state == WorkerState::Healthy)
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let shared = self.inner.lock();
        shared
            .instances
            .iter()
            .map(|i| InstanceSnapshot {
                engine: self.inner.engines[i.engine].name.clone(),
                index: i.index,
                port: i.port,
                state: i.state,
                restarts: i.restarts,
            })
            .collect()
    }

    /// Leases an idle healthy instance of `name`, waiting at most `timeout`.
    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<WorkerHandle, Error> {
        let Some(engine) = self.inner.engines.iter().position(|e| e.name == name) else {
            return Err(Error::new(
                OP_ACQUIRE,
                ErrorKind::Internal,
                format!("unknown engine '{name}'"),
            ));
        };
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_lease(engine) {
                Lease::Leased(handle) => return Ok(handle),
                Lease::Unavailable => {
                    return Err(Error::timeout(
                        OP_ACQUIRE,
                        format!("no '{name}' worker can become available"),
                    ))
                }
                Lease::Busy => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::timeout(
                    OP_ACQUIRE,
                    format!("no healthy '{name}' worker available within {timeout:?}"),
                ));
            }
            monoio::time::sleep(self.inner.policy.poll().min(deadline - now)).await;
        }
    }

    fn try_lease(&self, engine: usize) -> Lease {
        let mut shared = self.inner.lock();
        if shared.stopping {
            return Lease::Unavailable;
        }
        let mut alive = false;
        for (id, instance) in shared.instances.iter_mut().enumerate() {
            if instance.engine != engine {
                continue;
            }
            if instance.state != WorkerState::PermanentlyFailed {
                alive = true;
            }
            if instance.state == WorkerState::Healthy && !instance.leased && !instance.poisoned {
                instance.leased = true;
                return Lease::Leased(WorkerHandle {
                    inner: self.inner.clone(),
                    id,
                    generation: instance.generation,
                    name: self.inner.engines[engine].name.clone(),
                    port: instance.port,
                });
            }
        }
        if alive {
            Lease::Busy
        } else {
            Lease::Unavailable
        }
    }

    /// Kills every worker and joins the supervision thread.
    pub fn shutdown(&self) {
        self.inner.lock().stopping = true;
        let handle = self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("supervisor thread panicked");
            }
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("engines", &self.inner.engines.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

enum Lease {
    Leased(WorkerHandle),
    Busy,
    Unavailable,
}

/// Exclusive use of one worker instance, given back on drop.
pub struct WorkerHandle {
    inner: Arc<Inner>,
    id: usize,
    generation: u64,
    name: String,
    port: u16,
}

impl WorkerHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Asks the supervisor to kill and restart the instance, for example
    /// after it blew a conversion deadline.
    pub fn poison(&self) {
        let mut shared = self.inner.lock();
        let instance = &mut shared.instances[self.id];
        if instance.generation == self.generation {
            instance.poisoned = true;
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.inner.lock().instances[self.id].leased = false;
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish()
    }
}

enum Poll {
    Running,
    Exited(String),
    Poisoned,
}

async fn supervise(inner: Arc<Inner>, launcher: Arc<dyn Launcher>, id: usize) {
    let (engine, index, port) = {
        let shared = inner.lock();
        let instance = &shared.instances[id];
        (&inner.engines[instance.engine], instance.index, instance.port)
    };
    let policy = inner.policy;
    let mut child: Option<Box<dyn ChildProcess>> = None;
    let mut started_at = Instant::now();

    loop {
        if inner.lock().stopping {
            if let Some(mut child) = child.take() {
                let _ = child.kill();
            }
            return;
        }

        if child.is_none() {
            match launcher.launch(engine, port) {
                Ok(spawned) => {
                    info!(engine = %engine.name, index, port, pid = ?spawned.id(), "worker started");
                    {
                        let mut shared = inner.lock();
                        let instance = &mut shared.instances[id];
                        instance.state = WorkerState::Starting;
                        instance.generation += 1;
                        instance.poisoned = false;
                    }
                    child = Some(spawned);
                    started_at = Instant::now();
                }
                Err(e) => {
                    warn!(engine = %engine.name, index, "unable to launch worker: {e}");
                    match inner.crashed(id) {
                        Some(delay) => monoio::time::sleep(delay).await,
                        None => return,
                    }
                }
            }
            continue;
        }
        let Some(running) = child.as_mut() else {
            continue;
        };

        let poll = if inner.take_poison(id) {
            Poll::Poisoned
        } else {
            match running.try_wait() {
                Ok(None) => Poll::Running,
                Ok(Some(exit)) => Poll::Exited(exit.to_string()),
                Err(e) => Poll::Exited(e.to_string()),
            }
        };

        match poll {
            Poll::Running => {
                let starting = inner.lock().instances[id].state == WorkerState::Starting;
                if starting && ready(engine, port, started_at, &policy).await {
                    inner.set_state(id, WorkerState::Healthy);
                    info!(engine = %engine.name, index, port, "worker healthy");
                }
            }
            Poll::Poisoned => {
                warn!(engine = %engine.name, index, "restarting poisoned worker");
                // already Restarting; not a crash, the restart budget is left alone
                if let Some(mut child) = child.take() {
                    let _ = child.kill();
                }
                continue;
            }
            Poll::Exited(reason) => {
                child = None;
                warn!(engine = %engine.name, index, "worker exited: {reason}");
                match inner.crashed(id) {
                    Some(delay) => {
                        monoio::time::sleep(delay).await;
                        continue;
                    }
                    None => return,
                }
            }
        }
        monoio::time::sleep(policy.poll()).await;
    }
}

async fn ready(engine: &EngineConfig, port: u16, started_at: Instant, policy: &RestartPolicy) -> bool {
    if !engine.probe {
        return started_at.elapsed() >= policy.startup_grace();
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    matches!(
        monoio::time::timeout(policy.poll(), monoio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

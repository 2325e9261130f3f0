//! Service supervisor - owns the auxiliary processes of a browser instance.
//!
//! Flow:
//! 1. A bind request names a service kind and carries a ChannelEndpoint
//! 2. The launcher starts the process; the endpoint is delivered over the
//!    control channel (descriptor by inheritance, path by message)
//! 3. A watcher task waits for Ready, then watches the channel for EOF
//! 4. On disconnect: the death observer fires and the restart policy
//!    decides whether to relaunch, re-delivering the retained endpoint
//!
//! All handle state lives on a single event-loop task; the public
//! [`Supervisor`] talks to it over an mpsc channel, so there is exactly one
//! writer and observer callbacks are serialized.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ControlRequest, ControlResponse, HandleId, ServiceKind};
use crate::death::DeathObserver;
use crate::handoff::ChannelEndpoint;
use crate::launcher::{LaunchError, ServiceLauncher};

type ControlTx = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, JsonCodec<ControlRequest>>;
type ControlRx = FramedRead<Box<dyn AsyncRead + Send + Unpin>, JsonCodec<ControlResponse>>;

/// Liveness of one bound service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Launched, endpoint delivered, Ready not yet reported.
    Starting,
    /// Serving on its endpoint.
    Bound,
    /// Peer terminated or never became ready.
    Disconnected,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Bound => "bound",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Snapshot of one service for callers to query.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub handle: HandleId,
    pub state: ServiceState,
    /// Supervisor-side descriptor of the delivered endpoint.
    pub ipc_fd: i32,
    /// Completed restarts across this binding's lifetime.
    pub restarts: u32,
    /// When the current state was entered (RFC 3339).
    pub since: String,
}

/// What to do when a bound service's peer terminates unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Log the disconnect and leave the handle in `Disconnected`.
    Never,
    /// Relaunch with doubling delays, giving up after `max_attempts`
    /// consecutive failures. The counter resets once a relaunch reaches
    /// `Bound`.
    ExponentialBackoff {
        initial: Duration,
        max: Duration,
        max_attempts: u32,
    },
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (zero-based), or None when
    /// the policy says to stop.
    fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Never => None,
            Self::ExponentialBackoff {
                initial,
                max,
                max_attempts,
            } => {
                if attempt >= max_attempts {
                    return None;
                }
                let delay = initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
                Some(delay.min(max))
            }
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

pub struct SupervisorConfig {
    launcher: Arc<dyn ServiceLauncher>,
    bind_timeout: Duration,
    release_grace: Duration,
    restart_policy: RestartPolicy,
}

impl SupervisorConfig {
    pub fn new(launcher: Arc<dyn ServiceLauncher>) -> Self {
        Self {
            launcher,
            bind_timeout: Duration::from_secs(30),
            release_grace: Duration::from_secs(5),
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Bound on the `Starting` state: a service that does not report Ready
    /// within this window is treated as disconnected.
    pub fn with_bind_timeout(mut self, timeout: Duration) -> Self {
        self.bind_timeout = timeout;
        self
    }

    /// How long a released service gets to exit before it is killed.
    pub fn with_release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("unknown service kind: {0:?}")]
    UnknownKind(String),
    #[error("service kind {0} is already bound")]
    AlreadyBound(ServiceKind),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("supervisor is shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("service kind {0} is not bound")]
    NotBound(ServiceKind),
    #[error("supervisor is shut down")]
    Closed,
}

enum Command {
    Bind {
        kind: ServiceKind,
        endpoint: ChannelEndpoint,
        reply: oneshot::Sender<Result<HandleId, BindError>>,
    },
    Release {
        kind: ServiceKind,
        reply: oneshot::Sender<Result<(), ReleaseError>>,
    },
    Observe {
        kind: ServiceKind,
        callback: Box<dyn FnOnce() + Send>,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Event {
    BindReady {
        kind: ServiceKind,
        handle: HandleId,
    },
    Disconnected {
        kind: ServiceKind,
        handle: HandleId,
        reason: String,
    },
    RestartDue {
        kind: ServiceKind,
        handle: HandleId,
    },
}

/// Handle to the supervisor event loop.
#[derive(Clone)]
pub struct Supervisor {
    cmd_tx: mpsc::Sender<Command>,
    statuses: Arc<DashMap<ServiceKind, ServiceStatus>>,
}

impl Supervisor {
    /// Start the supervisor event loop.
    pub fn spawn(config: SupervisorConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(16);
        let statuses: Arc<DashMap<ServiceKind, ServiceStatus>> = Arc::new(DashMap::new());

        let event_loop = SupervisorLoop {
            config,
            services: HashMap::new(),
            statuses: Arc::clone(&statuses),
            event_tx,
        };
        tokio::spawn(event_loop.run(cmd_rx, event_rx));

        Self { cmd_tx, statuses }
    }

    /// Launch (if possible) the process for `kind` and deliver `endpoint`
    /// to it. Launch and delivery failures surface here; the
    /// Starting -> Bound transition is asynchronous and observable through
    /// [`Supervisor::status`].
    pub async fn request_bind(
        &self,
        kind: ServiceKind,
        endpoint: ChannelEndpoint,
    ) -> Result<HandleId, BindError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Bind {
                kind,
                endpoint,
                reply,
            })
            .await
            .map_err(|_| BindError::Closed)?;
        response.await.map_err(|_| BindError::Closed)?
    }

    /// String-keyed variant of [`Supervisor::request_bind`]; unrecognized
    /// kinds fail before anything is launched or registered.
    pub async fn request_bind_named(
        &self,
        kind: &str,
        endpoint: ChannelEndpoint,
    ) -> Result<HandleId, BindError> {
        let kind = ServiceKind::parse(kind).map_err(|e| BindError::UnknownKind(e.0))?;
        self.request_bind(kind, endpoint).await
    }

    /// Tear down the binding for `kind`: graceful shutdown request, bounded
    /// kill fallback, endpoint dropped with the handle. A released service
    /// is never restarted.
    pub async fn release_bind(&self, kind: ServiceKind) -> Result<(), ReleaseError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(Command::Release { kind, reply })
            .await
            .map_err(|_| ReleaseError::Closed)?;
        response.await.map_err(|_| ReleaseError::Closed)?
    }

    /// Register the disconnect callback for the current incarnation of
    /// `kind`, overwriting any prior registration. Returns false when the
    /// kind is not bound.
    pub async fn on_disconnect<F>(&self, kind: ServiceKind, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Observe {
                kind,
                callback: Box::new(callback),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub fn status(&self, kind: ServiceKind) -> Option<ServiceStatus> {
        self.statuses.get(&kind).map(|s| s.clone())
    }

    /// Release every bound service and stop the event loop.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = response.await;
        }
    }
}

/// One tracked service. Owned exclusively by the event loop.
struct ServiceHandle {
    id: HandleId,
    kind: ServiceKind,
    state: ServiceState,
    endpoint: ChannelEndpoint,
    ctrl_tx: ControlTx,
    child: Option<Child>,
    observer: DeathObserver,
    /// Completed restarts across this binding's lifetime.
    restarts: u32,
    /// Consecutive restart attempts since the service was last Bound.
    attempt: u32,
}

struct Incarnation {
    id: HandleId,
    ctrl_tx: ControlTx,
    child: Option<Child>,
}

struct SupervisorLoop {
    config: SupervisorConfig,
    services: HashMap<ServiceKind, ServiceHandle>,
    statuses: Arc<DashMap<ServiceKind, ServiceStatus>>,
    event_tx: mpsc::Sender<Event>,
}

impl SupervisorLoop {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut event_rx: mpsc::Receiver<Event>) {
        loop {
            tokio::select! {
                biased;

                Some(event) = event_rx.recv() => match event {
                    Event::BindReady { kind, handle } => self.on_bind_ready(kind, handle),
                    Event::Disconnected { kind, handle, reason } => {
                        self.on_disconnected(kind, handle, reason);
                    }
                    Event::RestartDue { kind, handle } => self.on_restart_due(kind, handle).await,
                },

                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Bind { kind, endpoint, reply }) => {
                        self.bind(kind, endpoint, reply).await;
                    }
                    Some(Command::Release { kind, reply }) => {
                        self.release(kind, reply).await;
                    }
                    Some(Command::Observe { kind, callback, reply }) => {
                        let registered = match self.services.get_mut(&kind) {
                            Some(handle) => {
                                handle.observer.on_disconnect(callback);
                                true
                            }
                            None => false,
                        };
                        let _ = reply.send(registered);
                    }
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        tracing::debug!("supervisor event loop exiting");
    }

    /// Launch one process for `kind` and deliver the endpoint to it. The
    /// returned incarnation has a watcher task already running.
    async fn launch_incarnation(
        &mut self,
        kind: ServiceKind,
        endpoint: &ChannelEndpoint,
    ) -> Result<Incarnation, BindError> {
        let launched = self.config.launcher.launch(kind, endpoint)?;

        let mut ctrl_tx: ControlTx = FramedWrite::new(launched.control_tx, JsonCodec::new());
        let init = ControlRequest::Init {
            ipc_fd: endpoint.ipc_fd(),
            resource_dir: endpoint.resource_dir().to_path_buf(),
        };
        if let Err(e) = ctrl_tx.send(init).await {
            if let Some(mut child) = launched.child {
                let _ = child.start_kill();
            }
            return Err(BindError::Protocol(format!(
                "failed to deliver endpoint: {e}"
            )));
        }

        let id = HandleId::new();
        let reader: ControlRx = FramedRead::new(launched.control_rx, JsonCodec::new());
        tokio::spawn(watch_service(
            kind,
            id,
            reader,
            self.config.bind_timeout,
            self.event_tx.clone(),
        ));

        Ok(Incarnation {
            id,
            ctrl_tx,
            child: launched.child,
        })
    }

    async fn bind(
        &mut self,
        kind: ServiceKind,
        endpoint: ChannelEndpoint,
        reply: oneshot::Sender<Result<HandleId, BindError>>,
    ) {
        if self.services.contains_key(&kind) {
            let _ = reply.send(Err(BindError::AlreadyBound(kind)));
            return;
        }

        tracing::info!(%kind, ipc_fd = endpoint.ipc_fd(), "bind requested");
        match self.launch_incarnation(kind, &endpoint).await {
            Ok(incarnation) => {
                let mut observer = DeathObserver::new();
                observer.watch();
                let handle = ServiceHandle {
                    id: incarnation.id,
                    kind,
                    state: ServiceState::Starting,
                    endpoint,
                    ctrl_tx: incarnation.ctrl_tx,
                    child: incarnation.child,
                    observer,
                    restarts: 0,
                    attempt: 0,
                };
                self.publish_status(&handle);
                self.services.insert(kind, handle);
                let _ = reply.send(Ok(incarnation.id));
            }
            Err(e) => {
                tracing::warn!(%kind, error = %e, "bind failed");
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn release(&mut self, kind: ServiceKind, reply: oneshot::Sender<Result<(), ReleaseError>>) {
        let Some(mut handle) = self.services.remove(&kind) else {
            let _ = reply.send(Err(ReleaseError::NotBound(kind)));
            return;
        };

        tracing::info!(%kind, handle = %handle.id, "releasing service");
        let _ = handle.ctrl_tx.send(ControlRequest::Shutdown).await;
        self.statuses.remove(&kind);

        let grace = self.config.release_grace;
        tokio::spawn(async move {
            if let Some(mut child) = handle.child.take()
                && tokio::time::timeout(grace, child.wait()).await.is_err()
            {
                tracing::warn!(%kind, "released service did not exit, killing it");
                let _ = child.kill().await;
            }
            // Dropping the handle closes the supervisor-side endpoint.
            drop(handle);
        });

        let _ = reply.send(Ok(()));
    }

    fn on_bind_ready(&mut self, kind: ServiceKind, id: HandleId) {
        let Some(handle) = self.services.get_mut(&kind) else {
            tracing::debug!(%kind, handle = %id, "ready for untracked service, ignoring");
            return;
        };
        if handle.id != id || handle.state != ServiceState::Starting {
            tracing::debug!(%kind, handle = %id, "stale ready event, ignoring");
            return;
        }

        handle.state = ServiceState::Bound;
        handle.attempt = 0;
        tracing::info!(%kind, handle = %id, "service bound");
        let status = Self::status_of(handle);
        self.statuses.insert(kind, status);
    }

    fn on_disconnected(&mut self, kind: ServiceKind, id: HandleId, reason: String) {
        let Some(handle) = self.services.get_mut(&kind) else {
            tracing::debug!(%kind, handle = %id, "disconnect for untracked service, ignoring");
            return;
        };
        if handle.id != id {
            tracing::debug!(%kind, handle = %id, "stale disconnect event, ignoring");
            return;
        }
        if handle.state == ServiceState::Disconnected {
            return;
        }

        handle.state = ServiceState::Disconnected;
        tracing::error!(%kind, handle = %id, %reason, "service connection lost");
        handle.observer.fire();

        match self.config.restart_policy.delay_for(handle.attempt) {
            Some(delay) => {
                handle.attempt += 1;
                tracing::info!(
                    %kind,
                    delay_ms = delay.as_millis() as u64,
                    attempt = handle.attempt,
                    "scheduling service restart"
                );
                let event_tx = self.event_tx.clone();
                let handle_id = handle.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = event_tx
                        .send(Event::RestartDue {
                            kind,
                            handle: handle_id,
                        })
                        .await;
                });
            }
            None => {
                tracing::warn!(%kind, "service will not be restarted");
            }
        }
        let status = Self::status_of(handle);
        self.statuses.insert(kind, status);
    }

    async fn on_restart_due(&mut self, kind: ServiceKind, id: HandleId) {
        // Take the handle out while relaunching so the borrow does not
        // overlap with the launch call.
        let Some(mut handle) = self.services.remove(&kind) else {
            return;
        };
        if handle.id != id || handle.state != ServiceState::Disconnected {
            self.services.insert(kind, handle);
            return;
        }

        tracing::info!(%kind, "restarting service");
        match self.launch_incarnation(kind, &handle.endpoint).await {
            Ok(incarnation) => {
                handle.id = incarnation.id;
                handle.ctrl_tx = incarnation.ctrl_tx;
                handle.child = incarnation.child;
                handle.state = ServiceState::Starting;
                handle.restarts += 1;
                let mut observer = DeathObserver::new();
                observer.watch();
                handle.observer = observer;
                self.publish_status(&handle);
            }
            Err(e) => {
                tracing::error!(%kind, error = %e, "service relaunch failed");
                match self.config.restart_policy.delay_for(handle.attempt) {
                    Some(delay) => {
                        handle.attempt += 1;
                        let event_tx = self.event_tx.clone();
                        let handle_id = handle.id;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = event_tx
                                .send(Event::RestartDue {
                                    kind,
                                    handle: handle_id,
                                })
                                .await;
                        });
                    }
                    None => {
                        tracing::warn!(%kind, "giving up on service restart");
                    }
                }
            }
        }
        self.services.insert(kind, handle);
    }

    async fn shutdown(&mut self) {
        for (kind, mut handle) in self.services.drain() {
            tracing::info!(%kind, "shutting down service");
            let _ = handle.ctrl_tx.send(ControlRequest::Shutdown).await;
            if let Some(mut child) = handle.child.take() {
                let _ = child.start_kill();
            }
        }
        self.statuses.clear();
    }

    fn publish_status(&self, handle: &ServiceHandle) {
        self.statuses.insert(handle.kind, Self::status_of(handle));
    }

    fn status_of(handle: &ServiceHandle) -> ServiceStatus {
        ServiceStatus {
            handle: handle.id,
            state: handle.state,
            ipc_fd: handle.endpoint.ipc_fd(),
            restarts: handle.restarts,
            since: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Watch one service's control channel: first the Ready handshake (bounded
/// by the bind timeout), then liveness until the channel closes.
async fn watch_service(
    kind: ServiceKind,
    handle: HandleId,
    mut reader: ControlRx,
    bind_timeout: Duration,
    event_tx: mpsc::Sender<Event>,
) {
    let disconnect = |reason: String| Event::Disconnected {
        kind,
        handle,
        reason,
    };

    match tokio::time::timeout(bind_timeout, reader.next()).await {
        Ok(Some(Ok(ControlResponse::Ready))) => {
            let _ = event_tx.send(Event::BindReady { kind, handle }).await;
        }
        Ok(Some(Ok(ControlResponse::Failed { error }))) => {
            let _ = event_tx
                .send(disconnect(format!("service failed to start: {error}")))
                .await;
            return;
        }
        Ok(Some(Ok(ControlResponse::ShuttingDown))) => {
            let _ = event_tx
                .send(disconnect("service shut down before ready".to_string()))
                .await;
            return;
        }
        Ok(Some(Err(e))) => {
            let _ = event_tx
                .send(disconnect(format!("control channel error: {e}")))
                .await;
            return;
        }
        Ok(None) => {
            let _ = event_tx
                .send(disconnect("control channel closed before ready".to_string()))
                .await;
            return;
        }
        Err(_) => {
            let _ = event_tx
                .send(disconnect("timed out waiting for service to become ready".to_string()))
                .await;
            return;
        }
    }

    loop {
        match reader.next().await {
            Some(Ok(ControlResponse::ShuttingDown)) => {
                tracing::debug!(%kind, "service acknowledged shutdown");
            }
            Some(Ok(other)) => {
                tracing::warn!(%kind, ?other, "unexpected control message");
            }
            Some(Err(e)) => {
                let _ = event_tx
                    .send(disconnect(format!("control channel error: {e}")))
                    .await;
                return;
            }
            None => {
                let _ = event_tx
                    .send(disconnect("control channel closed".to_string()))
                    .await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::handoff;
    use crate::launcher::LaunchedService;
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum FakeBehavior {
        /// Reply Ready, then serve until killed or shut down.
        Ready,
        /// Accept the handoff but never reply.
        NeverReady,
        /// Refuse to start a process at all.
        FailLaunch,
    }

    struct FakeLauncher {
        behavior: FakeBehavior,
        launches: Arc<AtomicUsize>,
        kill: Arc<Notify>,
    }

    impl FakeLauncher {
        fn new(behavior: FakeBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                launches: Arc::new(AtomicUsize::new(0)),
                kill: Arc::new(Notify::new()),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        /// Terminate the most recently launched fake service.
        fn kill_one(&self) {
            self.kill.notify_one();
        }
    }

    impl ServiceLauncher for FakeLauncher {
        fn launch(
            &self,
            _kind: ServiceKind,
            _endpoint: &ChannelEndpoint,
        ) -> Result<LaunchedService, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if matches!(self.behavior, FakeBehavior::FailLaunch) {
                return Err(LaunchError::Other("host refused to start process".to_string()));
            }

            let (supervisor_side, service_side) = tokio::io::duplex(4096);
            tokio::spawn(fake_service(service_side, self.behavior, Arc::clone(&self.kill)));

            let (rx, tx) = tokio::io::split(supervisor_side);
            Ok(LaunchedService {
                control_rx: Box::new(rx),
                control_tx: Box::new(tx),
                child: None,
            })
        }
    }

    async fn fake_service(stream: DuplexStream, behavior: FakeBehavior, kill: Arc<Notify>) {
        let (rx, tx) = tokio::io::split(stream);
        let mut reader = FramedRead::new(rx, JsonCodec::<ControlRequest>::new());
        let mut writer = FramedWrite::new(tx, JsonCodec::<ControlResponse>::new());

        match reader.next().await {
            Some(Ok(ControlRequest::Init { .. })) => {}
            _ => return,
        }

        if matches!(behavior, FakeBehavior::NeverReady) {
            loop {
                tokio::select! {
                    _ = kill.notified() => return,
                    msg = reader.next() => {
                        if msg.is_none() {
                            return;
                        }
                    }
                }
            }
        }

        let _ = writer.send(ControlResponse::Ready).await;
        loop {
            tokio::select! {
                _ = kill.notified() => return,
                msg = reader.next() => match msg {
                    Some(Ok(ControlRequest::Shutdown)) => {
                        let _ = writer.send(ControlResponse::ShuttingDown).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                },
            }
        }
    }

    fn test_endpoint(resource_dir: &Path) -> (ChannelEndpoint, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        let endpoint = handoff(ours.into_raw_fd(), resource_dir).unwrap();
        (endpoint, peer)
    }

    async fn wait_for_state(
        supervisor: &Supervisor,
        kind: ServiceKind,
        state: ServiceState,
    ) -> ServiceStatus {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(status) = supervisor.status(kind)
                    && status.state == state
                {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind} to reach {}", state.as_str()))
    }

    fn no_restart_config(launcher: Arc<FakeLauncher>) -> SupervisorConfig {
        SupervisorConfig::new(launcher)
            .with_bind_timeout(Duration::from_millis(200))
            .with_restart_policy(RestartPolicy::Never)
    }

    #[tokio::test]
    async fn every_kind_binds_starting_to_bound() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(Arc::clone(&launcher)));

        let mut peers = Vec::new();
        for kind in ServiceKind::ALL {
            let (endpoint, peer) = test_endpoint(resources.path());
            peers.push(peer);
            let handle = supervisor.request_bind(kind, endpoint).await.unwrap();

            let status = wait_for_state(&supervisor, kind, ServiceState::Bound).await;
            assert_eq!(status.handle, handle);
            assert_eq!(status.restarts, 0);
        }
        assert_eq!(launcher.launches(), ServiceKind::ALL.len());
    }

    #[tokio::test]
    async fn bound_status_names_the_delivered_endpoint() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(launcher));

        let (endpoint, _peer) = test_endpoint(resources.path());
        let ipc_fd = endpoint.ipc_fd();
        supervisor
            .request_bind(ServiceKind::WebContent, endpoint)
            .await
            .unwrap();

        let status = wait_for_state(&supervisor, ServiceKind::WebContent, ServiceState::Bound).await;
        assert_eq!(status.ipc_fd, ipc_fd);
    }

    #[tokio::test]
    async fn peer_death_fires_observer_once_and_does_not_restart() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(Arc::clone(&launcher)));

        let (endpoint, _peer) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::RequestServer, endpoint)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::RequestServer, ServiceState::Bound).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        assert!(
            supervisor
                .on_disconnect(ServiceKind::RequestServer, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );

        launcher.kill_one();
        wait_for_state(&supervisor, ServiceKind::RequestServer, ServiceState::Disconnected).await;

        // Give any stray restart or duplicate fire a chance to happen.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.launches(), 1);
        let status = supervisor.status(ServiceKind::RequestServer).unwrap();
        assert_eq!(status.state, ServiceState::Disconnected);
    }

    #[tokio::test]
    async fn backoff_policy_relaunches_after_death() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let config = SupervisorConfig::new(Arc::clone(&launcher) as Arc<dyn ServiceLauncher>)
            .with_bind_timeout(Duration::from_millis(500))
            .with_restart_policy(RestartPolicy::ExponentialBackoff {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                max_attempts: 3,
            });
        let supervisor = Supervisor::spawn(config);

        let (endpoint, _peer) = test_endpoint(resources.path());
        let first = supervisor
            .request_bind(ServiceKind::ImageDecoder, endpoint)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::ImageDecoder, ServiceState::Bound).await;

        launcher.kill_one();

        let status = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(status) = supervisor.status(ServiceKind::ImageDecoder)
                    && status.state == ServiceState::Bound
                    && status.restarts == 1
                {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("service was not relaunched");

        assert_ne!(status.handle, first);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn unknown_kind_fails_without_launching() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(Arc::clone(&launcher)));

        let (endpoint, _peer) = test_endpoint(resources.path());
        let err = supervisor
            .request_bind_named("clipboard", endpoint)
            .await
            .unwrap_err();

        assert!(matches!(err, BindError::UnknownKind(name) if name == "clipboard"));
        assert_eq!(launcher.launches(), 0);
        for kind in ServiceKind::ALL {
            assert!(supervisor.status(kind).is_none());
        }
    }

    #[tokio::test]
    async fn launch_failure_surfaces_and_registers_nothing() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::FailLaunch);
        let supervisor = Supervisor::spawn(no_restart_config(Arc::clone(&launcher)));

        let (endpoint, _peer) = test_endpoint(resources.path());
        let err = supervisor
            .request_bind(ServiceKind::WebContent, endpoint)
            .await
            .unwrap_err();

        assert!(matches!(err, BindError::Launch(_)));
        assert!(supervisor.status(ServiceKind::WebContent).is_none());
    }

    #[tokio::test]
    async fn double_bind_is_rejected() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(launcher));

        let (first, _peer_a) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::WebContent, first)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::WebContent, ServiceState::Bound).await;

        let (second, _peer_b) = test_endpoint(resources.path());
        let err = supervisor
            .request_bind(ServiceKind::WebContent, second)
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::AlreadyBound(ServiceKind::WebContent)));
    }

    #[tokio::test]
    async fn release_tears_down_and_allows_rebind() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(Arc::clone(&launcher)));

        let (endpoint, _peer) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::RequestServer, endpoint)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::RequestServer, ServiceState::Bound).await;

        supervisor
            .release_bind(ServiceKind::RequestServer)
            .await
            .unwrap();
        assert!(supervisor.status(ServiceKind::RequestServer).is_none());

        // The released service's shutdown must not be treated as a death.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.status(ServiceKind::RequestServer).is_none());

        let (endpoint, _peer) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::RequestServer, endpoint)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::RequestServer, ServiceState::Bound).await;
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn releasing_unbound_kind_fails() {
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(launcher));

        let err = supervisor
            .release_bind(ServiceKind::ImageDecoder)
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotBound(ServiceKind::ImageDecoder)));
    }

    #[tokio::test]
    async fn silent_service_trips_bind_timeout() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::NeverReady);
        let config = SupervisorConfig::new(Arc::clone(&launcher) as Arc<dyn ServiceLauncher>)
            .with_bind_timeout(Duration::from_millis(50))
            .with_restart_policy(RestartPolicy::Never);
        let supervisor = Supervisor::spawn(config);

        let (endpoint, _peer) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::WebContent, endpoint)
            .await
            .unwrap();

        let status =
            wait_for_state(&supervisor, ServiceKind::WebContent, ServiceState::Disconnected).await;
        assert_eq!(status.restarts, 0);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_the_supervisor() {
        let resources = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new(FakeBehavior::Ready);
        let supervisor = Supervisor::spawn(no_restart_config(launcher));

        let (endpoint, _peer) = test_endpoint(resources.path());
        supervisor
            .request_bind(ServiceKind::WebContent, endpoint)
            .await
            .unwrap();
        wait_for_state(&supervisor, ServiceKind::WebContent, ServiceState::Bound).await;

        supervisor.shutdown().await;
        assert!(supervisor.status(ServiceKind::WebContent).is_none());

        let (endpoint, _peer) = test_endpoint(resources.path());
        let err = supervisor
            .request_bind(ServiceKind::WebContent, endpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Closed));
    }

    #[test]
    fn backoff_delays_double_and_cap() {
        let policy = RestartPolicy::ExponentialBackoff {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(2),
            max_attempts: 4,
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn never_policy_never_restarts() {
        assert_eq!(RestartPolicy::Never.delay_for(0), None);
    }
}

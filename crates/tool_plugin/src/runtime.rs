//! Worker-side runtime: the code that runs inside a tool's isolated process.
//!
//! Tool binaries hand a loader to [`run`]:
//! ```ignore
//! use tool_plugin::{ToolModule, runtime::run};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run(|_identity| Ok(ToolModule::new().sync_method("echo", |args| Ok(args[0].clone())))).await
//! }
//! ```
//!
//! The runtime connects back to the host, sends the `ready` handshake and then
//! translates lifecycle and request messages into calls on the loaded module.

use std::{
    any::Any,
    env,
    future::Future,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver};
use tracing::{debug, error, info, warn};

use crate::api::ToolApi;
use crate::channel::{self, CHANNEL_ENV, ChannelSender, TOKEN_ENV};
use crate::context::WorkerContext;
use crate::error::ToolHostError;
use crate::logging::init_worker_tracing;
use crate::message::{Message, MessageType};
use crate::module::{DeactivateHandler, ToolLoader, ToolModule};
use crate::protocol::DEFAULT_REQUEST_TIMEOUT;

pub const TOOL_ID_ENV: &str = "TOOL_ID";
pub const TOOL_ENTRY_ENV: &str = "TOOL_ENTRY";
pub const TOOL_ROOT_ENV: &str = "TOOL_ROOT";
/// Window for the worker's own API calls, in milliseconds.
pub const API_TIMEOUT_ENV: &str = "TOOL_HOST_API_TIMEOUT_MS";
/// Exit status of a worker brought down by an uncaught panic.
pub const PANIC_EXIT_CODE: i32 = 101;

tokio::task_local! {
    /// Set while plugin code runs under `guarded`, whose `catch_unwind` owns
    /// any panic raised there.
    static GUARDED: ();
}

/// Who this worker is, as told by the host through the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolIdentity {
    pub tool_id: String,
    pub entry: PathBuf,
    pub root: PathBuf,
}

impl ToolIdentity {
    pub fn new(tool_id: impl Into<String>, entry: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self { tool_id: tool_id.into(), entry: entry.into(), root: root.into() }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let tool_id = env::var(TOOL_ID_ENV).with_context(|| format!("{TOOL_ID_ENV} is not set"))?;
        let entry = env::var(TOOL_ENTRY_ENV).with_context(|| format!("{TOOL_ENTRY_ENV} is not set"))?;
        let root = env::var(TOOL_ROOT_ENV).with_context(|| format!("{TOOL_ROOT_ENV} is not set"))?;
        Ok(Self::new(tool_id, entry, root))
    }
}

/// State of one activation. Built on ACTIVATE, torn down on DEACTIVATE.
struct WorkerSession {
    module: ToolModule,
    context: WorkerContext,
    deactivate: Option<DeactivateHandler>,
}

#[derive(Clone)]
pub struct WorkerRuntime {
    identity: Arc<ToolIdentity>,
    loader: ToolLoader,
    sender: ChannelSender,
    api: ToolApi,
    session: Arc<Mutex<Option<WorkerSession>>>,
}

/// Entry point for tool binaries. Returns when the host closes the channel.
pub async fn run<F>(loader: F) -> anyhow::Result<()>
where
    F: Fn(&ToolIdentity) -> anyhow::Result<ToolModule> + Send + Sync + 'static,
{
    init_worker_tracing();
    install_panic_hook();

    let identity = ToolIdentity::from_env()?;
    let address = env::var(CHANNEL_ENV).with_context(|| format!("{CHANNEL_ENV} is not set"))?;
    let token = env::var(TOKEN_ENV).with_context(|| format!("{TOKEN_ENV} is not set"))?;
    let api_timeout = env::var(API_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

    let (sender, inbound) = channel::connect(&address, &token, identity.tool_id.clone()).await?;
    WorkerRuntime::new(identity, Arc::new(loader), sender, api_timeout)
        .serve(inbound)
        .await
}

impl WorkerRuntime {
    pub fn new(identity: ToolIdentity, loader: ToolLoader, sender: ChannelSender, api_timeout: Duration) -> Self {
        let api = ToolApi::new(identity.tool_id.clone(), sender.clone(), api_timeout);
        Self {
            identity: Arc::new(identity),
            loader,
            sender,
            api,
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn api(&self) -> &ToolApi {
        &self.api
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Announce readiness, then process messages until the channel closes.
    pub async fn serve(self, mut inbound: UnboundedReceiver<Message>) -> anyhow::Result<()> {
        let tool_id = self.identity.tool_id.clone();
        self.sender.send(Message::ready(&tool_id))?;
        info!(%tool_id, "worker ready");

        while let Some(message) = inbound.recv().await {
            self.dispatch(message);
        }

        info!(%tool_id, "channel closed, shutting down");
        self.api.dispose();
        if let Some(session) = self.session.lock().await.take() {
            session.context.dispose_subscriptions();
        }
        Ok(())
    }

    /// Route one inbound message. Lifecycle and requests run on their own
    /// task so replies to the tool's own API calls keep flowing meanwhile.
    pub fn dispatch(&self, message: Message) {
        match message.kind {
            MessageType::Activate => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let outcome = runtime.handle_activate().await;
                    runtime.reply(&message, outcome);
                });
            }
            MessageType::Deactivate => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let outcome = runtime.handle_deactivate().await.map(|_| Value::Null);
                    runtime.reply(&message, outcome);
                });
            }
            MessageType::Request => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let outcome = runtime.handle_request(message.method_name(), message.args.clone()).await;
                    runtime.reply(&message, outcome);
                });
            }
            MessageType::Response | MessageType::Error => {
                if !self.api.handle_response(message) {
                    debug!(tool_id = %self.identity.tool_id, "reply for unknown API call dropped");
                }
            }
            MessageType::Event => {
                let data = message.args.first().cloned().unwrap_or(Value::Null);
                self.api.dispatch_event(message.method_name(), &data);
            }
            MessageType::ApiCall => {
                warn!(tool_id = %self.identity.tool_id, method = message.method_name(), "workers do not serve API calls");
                self.reply(&message, Err(ToolHostError::UnknownApiMethod(message.method_name().to_string())));
            }
        }
    }

    fn reply(&self, request: &Message, outcome: Result<Value, ToolHostError>) {
        let tool_id = &self.identity.tool_id;
        let reply = match outcome {
            Ok(result) => Message::response(&request.id, tool_id, result),
            Err(err) => {
                debug!(%tool_id, method = request.method_name(), "replying with error: {err}");
                Message::error(&request.id, tool_id, err.to_string())
            }
        };
        if let Err(err) = self.sender.send(reply) {
            warn!(%tool_id, "could not send reply: {err}");
        }
    }

    /// Load the module fresh and run its activate hook.
    pub async fn handle_activate(&self) -> Result<Value, ToolHostError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            warn!(tool_id = %self.identity.tool_id, "activate while active, tearing down previous session");
            Self::teardown(&self.identity.tool_id, previous).await;
        }

        let loader = self.loader.clone();
        let identity = self.identity.clone();
        let module = match catch_plugin_panic(|| loader(&*identity)) {
            Ok(Ok(module)) => module,
            Ok(Err(err)) => return Err(ToolHostError::Remote(format!("Failed to load tool module: {err}"))),
            Err(panic) => {
                return Err(ToolHostError::Remote(format!(
                    "Failed to load tool module: {}",
                    panic_message(panic.as_ref())
                )));
            }
        };

        let context = WorkerContext::new((*self.identity).clone(), self.api.clone());
        match module.activate_handler() {
            Some(activate) => {
                if let Err(err) = guarded(|| activate(context.clone())).await {
                    context.dispose_subscriptions();
                    return Err(err);
                }
            }
            None => warn!(tool_id = %self.identity.tool_id, "tool module exports no activate hook"),
        }

        let deactivate = module.deactivate_handler();
        info!(tool_id = %self.identity.tool_id, methods = ?module.method_names(), "tool activated");
        *session = Some(WorkerSession { module, context, deactivate });
        Ok(Value::Null)
    }

    /// Run the deactivate hook, dispose every subscription, drop the session.
    /// An error from the hook is reported, but the session is gone either way.
    pub async fn handle_deactivate(&self) -> Result<(), ToolHostError> {
        let Some(session) = self.session.lock().await.take() else {
            debug!(tool_id = %self.identity.tool_id, "deactivate without active session");
            return Ok(());
        };
        let outcome = Self::teardown(&self.identity.tool_id, session).await;
        info!(tool_id = %self.identity.tool_id, "tool deactivated");
        outcome
    }

    async fn teardown(tool_id: &str, session: WorkerSession) -> Result<(), ToolHostError> {
        let WorkerSession { module, context, deactivate } = session;
        let outcome = match deactivate {
            Some(hook) => guarded(|| hook()).await,
            None => Ok(()),
        };
        if let Err(err) = &outcome {
            warn!(%tool_id, "deactivate hook failed: {err}");
        }
        let failures = context.dispose_subscriptions();
        if failures > 0 {
            warn!(%tool_id, failures, "some subscriptions failed to dispose");
        }
        drop(module);
        outcome
    }

    /// Invoke an exported method by name with positional arguments.
    pub async fn handle_request(&self, method: &str, args: Vec<Value>) -> Result<Value, ToolHostError> {
        let handler = {
            let session = self.session.lock().await;
            let Some(session) = session.as_ref() else {
                return Err(ToolHostError::NotReady(self.identity.tool_id.clone(), "inactive".into()));
            };
            session
                .module
                .handler(method)
                .ok_or_else(|| ToolHostError::MethodNotFound(method.to_string()))?
        };
        guarded(|| handler(args)).await
    }
}

/// Run plugin code, turning both errors and panics into `ToolHostError`.
///
/// The future is built inside the guard too, since synchronous handlers do
/// their work when called rather than when polled.
async fn guarded<T, F, Fut>(call: F) -> Result<T, ToolHostError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let outcome = match catch_plugin_panic(call) {
        Ok(fut) => AssertUnwindSafe(GUARDED.scope((), fut)).catch_unwind().await,
        Err(panic) => Err(panic),
    };
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(ToolHostError::Remote(format!("{err:#}"))),
        Err(panic) => Err(ToolHostError::Remote(format!("Tool panicked: {}", panic_message(panic.as_ref())))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run synchronous plugin code, catching a panic instead of exiting.
pub(crate) fn catch_plugin_panic<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    std::panic::catch_unwind(AssertUnwindSafe(|| GUARDED.sync_scope((), f)))
}

fn in_guarded_call() -> bool {
    GUARDED.try_with(|_| ()).is_ok()
}

/// Panics inside a handler become ERROR replies. Anything else (a detached
/// plugin task, the runtime loop) leaves the worker in an unknown state, so
/// the process exits and the host sees it go.
fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if in_guarded_call() {
            warn!("handler panic: {info}");
            return;
        }
        error!("uncaught worker panic, exiting: {info}");
        previous(info);
        std::process::exit(PANIC_EXIT_CODE);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Disposable;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn runtime_with<F>(loader: F) -> (WorkerRuntime, mpsc::UnboundedReceiver<Message>)
    where
        F: Fn(&ToolIdentity) -> anyhow::Result<ToolModule> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = WorkerRuntime::new(
            ToolIdentity::new("t1", "/tools/t1/tool", "/tools/t1"),
            Arc::new(loader),
            ChannelSender::new(tx, "t1"),
            Duration::from_secs(5),
        );
        (runtime, rx)
    }

    #[tokio::test]
    async fn activate_request_deactivate_cycle() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let (runtime, _sent) = runtime_with(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ToolModule::new()
                .on_activate(|_ctx| async { Ok(()) })
                .sync_method("echo", |args| Ok(args.first().cloned().unwrap_or(Value::Null))))
        });

        runtime.handle_activate().await.unwrap();
        assert!(runtime.is_active().await);
        assert_eq!(runtime.handle_request("echo", vec![json!("hello")]).await.unwrap(), json!("hello"));

        let err = runtime.handle_request("nope", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool does not implement method: nope");

        runtime.handle_deactivate().await.unwrap();
        assert!(!runtime.is_active().await);
        assert!(runtime.handle_request("echo", vec![]).await.is_err());

        // a second activation loads a fresh module
        runtime.handle_activate().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_activate_hook_is_allowed() {
        let (runtime, _sent) = runtime_with(|_| Ok(ToolModule::new().sync_method("ping", |_| Ok(json!("pong")))));
        runtime.handle_activate().await.unwrap();
        assert_eq!(runtime.handle_request("ping", vec![]).await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn deactivate_disposes_all_subscriptions_even_if_one_fails() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let hook_ran = Arc::new(AtomicUsize::new(0));
        let (d, h) = (disposed.clone(), hook_ran.clone());
        let (runtime, _sent) = runtime_with(move |_| {
            let d = d.clone();
            let h = h.clone();
            Ok(ToolModule::new()
                .on_activate(move |ctx| {
                    let d = d.clone();
                    async move {
                        for i in 0..3 {
                            let d = d.clone();
                            ctx.subscribe(Disposable::new(move || {
                                if i == 0 {
                                    anyhow::bail!("first disposer fails");
                                }
                                d.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }));
                        }
                        Ok(())
                    }
                })
                .on_deactivate(move || {
                    let h = h.clone();
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
        });

        runtime.handle_activate().await.unwrap();
        runtime.handle_deactivate().await.unwrap();
        assert_eq!(hook_ran.load(Ordering::SeqCst), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert!(!runtime.is_active().await);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_errors() {
        let (runtime, _sent) = runtime_with(|_| {
            Ok(ToolModule::new()
                .sync_method("fail", |_| anyhow::bail!("bad input"))
                .sync_method("snap", |_| panic!("snapped"))
                .method("explode", |_| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(Value::Null)
                }))
        });
        runtime.handle_activate().await.unwrap();

        let err = runtime.handle_request("fail", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        let err = runtime.handle_request("explode", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        let err = runtime.handle_request("snap", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Tool panicked: snapped");

        // the runtime is still usable
        assert!(runtime.is_active().await);
    }

    #[tokio::test]
    async fn only_code_under_guard_counts_as_handled() {
        assert!(!in_guarded_call());
        assert!(guarded(|| async { anyhow::Ok(in_guarded_call()) }).await.unwrap());
        assert!(catch_plugin_panic(in_guarded_call).unwrap());

        // a task spawned from a handler runs outside the guard
        let detached = guarded(|| async { anyhow::Ok(tokio::spawn(async { in_guarded_call() }).await?) })
            .await
            .unwrap();
        assert!(!detached);
    }

    #[tokio::test]
    async fn failing_activate_leaves_no_session() {
        let (runtime, _sent) = runtime_with(|_| {
            Ok(ToolModule::new().on_activate(|ctx| async move {
                ctx.subscribe(Disposable::noop());
                Err::<(), _>(anyhow::anyhow!("cannot start"))
            }))
        });
        let err = runtime.handle_activate().await.unwrap_err();
        assert!(err.to_string().contains("cannot start"));
        assert!(!runtime.is_active().await);
    }

    #[tokio::test]
    async fn serve_sends_ready_and_replies_to_requests() {
        let (runtime, mut sent) = runtime_with(|_| {
            Ok(ToolModule::new().sync_method("echo", |args| Ok(args[0].clone())))
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(runtime.serve(in_rx));

        assert!(sent.recv().await.unwrap().is_ready_event());

        let activate = Message::call(MessageType::Activate, "t1", "activate", vec![]);
        in_tx.send(activate.clone()).unwrap();
        let reply = sent.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.id, activate.id);

        let request = Message::call(MessageType::Request, "t1", "echo", vec![json!("hello")]);
        in_tx.send(request.clone()).unwrap();
        let reply = sent.recv().await.unwrap();
        assert_eq!(reply.id, request.id);
        assert_eq!(reply.result, Some(json!("hello")));

        let request = Message::call(MessageType::Request, "t1", "missing", vec![]);
        in_tx.send(request.clone()).unwrap();
        let reply = sent.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.error.as_deref(), Some("Tool does not implement method: missing"));

        drop(in_tx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn host_events_reach_listeners() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let (runtime, _sent) = runtime_with(move |_| {
            let counter = counter.clone();
            Ok(ToolModule::new().on_activate(move |ctx| {
                let counter = counter.clone();
                async move {
                    let sub = ctx.api().events().on("saved", move |data| {
                        if data == &json!({"path": "a.txt"}) {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                    ctx.subscribe(sub);
                    Ok(())
                }
            }))
        });
        runtime.handle_activate().await.unwrap();
        runtime.dispatch(Message::event("host", "saved", vec![json!({"path": "a.txt"})]));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // deactivation unsubscribes
        runtime.handle_deactivate().await.unwrap();
        runtime.dispatch(Message::event("host", "saved", vec![json!({"path": "a.txt"})]));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

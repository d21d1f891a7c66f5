use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::{ToolApi, UPDATE_GLOBAL_STATE};
use crate::runtime::{ToolIdentity, catch_plugin_panic};

/// Something that must be released when the tool deactivates.
pub struct Disposable {
    dispose: Box<dyn FnOnce() -> anyhow::Result<()> + Send>,
}

impl Disposable {
    pub fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self { dispose: Box::new(dispose) }
    }

    pub fn noop() -> Self {
        Self::new(|| Ok(()))
    }

    pub fn dispose(self) -> anyhow::Result<()> {
        (self.dispose)()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposable")
    }
}

/// Key-value store handed to a tool. Lives in worker memory only; the global
/// flavour also mirrors updates to the host.
#[derive(Clone)]
pub struct Memento {
    values: Arc<DashMap<String, Value>>,
    host_sync: Option<ToolApi>,
}

impl Memento {
    pub fn local() -> Self {
        Self { values: Arc::new(DashMap::new()), host_sync: None }
    }

    pub fn synced(api: ToolApi) -> Self {
        Self { values: Arc::new(DashMap::new()), host_sync: Some(api) }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|guard| guard.value().clone())
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Store `value` under `key`; `null` removes the key.
    pub async fn update(&self, key: &str, value: Value) -> anyhow::Result<()> {
        if value.is_null() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), value.clone());
        }
        if let Some(api) = &self.host_sync {
            api.call(UPDATE_GLOBAL_STATE, vec![Value::String(key.to_string()), value])
                .await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Memento {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memento")
            .field("keys", &self.keys())
            .field("synced", &self.host_sync.is_some())
            .finish()
    }
}

/// Per-activation state handed to a tool's activate hook.
///
/// One context exists per activation and is discarded on deactivation.
#[derive(Clone)]
pub struct WorkerContext {
    identity: Arc<ToolIdentity>,
    pub global_state: Memento,
    pub workspace_state: Memento,
    subscriptions: Arc<Mutex<Vec<Disposable>>>,
    api: ToolApi,
}

impl WorkerContext {
    pub fn new(identity: ToolIdentity, api: ToolApi) -> Self {
        Self {
            identity: Arc::new(identity),
            global_state: Memento::synced(api.clone()),
            workspace_state: Memento::local(),
            subscriptions: Arc::new(Mutex::new(vec![])),
            api,
        }
    }

    pub fn tool_id(&self) -> &str {
        &self.identity.tool_id
    }

    pub fn entry_path(&self) -> &Path {
        &self.identity.entry
    }

    pub fn root_path(&self) -> &Path {
        &self.identity.root
    }

    pub fn api(&self) -> &ToolApi {
        &self.api
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Disposable>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register something to release on deactivation.
    pub fn subscribe(&self, disposable: Disposable) {
        self.subscriptions().push(disposable);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions().len()
    }

    /// Dispose every subscription in registration order.
    ///
    /// A failing or panicking disposer is logged and skipped; the rest still
    /// run. Returns the number of failures.
    pub fn dispose_subscriptions(&self) -> usize {
        let subs = std::mem::take(&mut *self.subscriptions());
        let total = subs.len();
        let mut failures = 0;
        for (index, disposable) in subs.into_iter().enumerate() {
            match catch_plugin_panic(|| disposable.dispose()) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(tool_id = %self.tool_id(), index, "subscription dispose failed: {err}");
                }
                Err(_) => {
                    failures += 1;
                    warn!(tool_id = %self.tool_id(), index, "subscription dispose panicked");
                }
            }
        }
        debug!(tool_id = %self.tool_id(), total, failures, "subscriptions disposed");
        failures
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("tool_id", &self.identity.tool_id)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::test_api;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> WorkerContext {
        let (api, _sent) = test_api("t1");
        WorkerContext::new(ToolIdentity::new("t1", "/tools/t1/bin", "/tools/t1"), api)
    }

    #[test]
    fn one_failing_disposer_does_not_block_the_rest() {
        let ctx = context();
        let disposed = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let disposed = disposed.clone();
            ctx.subscribe(Disposable::new(move || {
                if i == 1 {
                    anyhow::bail!("dispose {i} failed");
                }
                if i == 2 {
                    panic!("dispose {i} panicked");
                }
                disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        assert_eq!(ctx.subscription_count(), 4);
        assert_eq!(ctx.dispose_subscriptions(), 2);
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.subscription_count(), 0);
        assert_eq!(ctx.dispose_subscriptions(), 0);
    }

    #[test]
    fn poisoned_subscription_list_still_collects_and_disposes() {
        let ctx = context();
        let subs = ctx.subscriptions.clone();
        let poisoner = std::thread::spawn(move || {
            let _held = subs.lock().unwrap();
            panic!("poison the subscription list");
        });
        assert!(poisoner.join().is_err());

        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = disposed.clone();
        ctx.subscribe(Disposable::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(ctx.subscription_count(), 1);
        assert_eq!(ctx.dispose_subscriptions(), 0);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn workspace_state_is_local() {
        let ctx = context();
        ctx.workspace_state.update("count", json!(3)).await.unwrap();
        assert_eq!(ctx.workspace_state.get("count"), Some(json!(3)));
        assert_eq!(ctx.workspace_state.get_or("missing", json!(0)), json!(0));

        ctx.workspace_state.update("count", Value::Null).await.unwrap();
        assert!(ctx.workspace_state.get("count").is_none());
    }

    #[test]
    fn exposes_identity() {
        let ctx = context();
        assert_eq!(ctx.tool_id(), "t1");
        assert_eq!(ctx.root_path(), Path::new("/tools/t1"));
        assert_eq!(ctx.entry_path(), Path::new("/tools/t1/bin"));
    }
}

// crates/tool_plugin/src/module.rs

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

use crate::context::WorkerContext;
use crate::runtime::ToolIdentity;

pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type ActivateHandler = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type DeactivateHandler = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Builds a fresh [`ToolModule`] each time the host activates the tool.
pub type ToolLoader = Arc<dyn Fn(&ToolIdentity) -> anyhow::Result<ToolModule> + Send + Sync>;

/// Everything a tool exports to the runtime: optional lifecycle hooks and an
/// explicit table of named methods the host may invoke.
#[derive(Clone, Default)]
pub struct ToolModule {
    activate: Option<ActivateHandler>,
    deactivate: Option<DeactivateHandler>,
    methods: HashMap<String, MethodHandler>,
}

impl ToolModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_activate<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.activate = Some(Arc::new(move |ctx| handler(ctx).boxed()));
        self
    }

    pub fn on_deactivate<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.deactivate = Some(Arc::new(move || handler().boxed()));
        self
    }

    /// Export an async method. Arguments arrive positionally.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |args| handler(args).boxed()));
        self
    }

    /// Export a synchronous method; it is awaited like any other.
    pub fn sync_method<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.method(name, move |args| future::ready(handler(args)))
    }

    pub fn activate_handler(&self) -> Option<ActivateHandler> {
        self.activate.clone()
    }

    pub fn deactivate_handler(&self) -> Option<DeactivateHandler> {
        self.deactivate.clone()
    }

    pub fn handler(&self, name: &str) -> Option<MethodHandler> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ToolModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolModule")
            .field("activate", &self.activate.is_some())
            .field("deactivate", &self.deactivate.is_some())
            .field("methods", &self.method_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sync_and_async_methods_share_a_table() {
        let module = ToolModule::new()
            .sync_method("echo", |args| Ok(args.first().cloned().unwrap_or(Value::Null)))
            .method("sum", |args| async move {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            });

        assert_eq!(module.method_names(), vec!["echo".to_string(), "sum".to_string()]);
        let echo = module.handler("echo").unwrap();
        assert_eq!(echo(vec![json!("hi")]).await.unwrap(), json!("hi"));
        let sum = module.handler("sum").unwrap();
        assert_eq!(sum(vec![json!(2), json!(3)]).await.unwrap(), json!(5));
        assert!(module.handler("missing").is_none());
    }

    #[test]
    fn lifecycle_hooks_are_optional() {
        let module = ToolModule::new();
        assert!(module.activate_handler().is_none());
        assert!(module.deactivate_handler().is_none());

        let module = module.on_deactivate(|| async { Ok(()) });
        assert!(module.deactivate_handler().is_some());
    }
}

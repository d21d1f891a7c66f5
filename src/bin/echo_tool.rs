//! Demo tool used by the integration tests and as a template for tool authors.

use std::{
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, anyhow};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use tool_plugin::{Disposable, ToolIdentity, ToolModule, WorkerContext, runtime::run};
use tracing::info;

/// Events this tool listens for; whatever arrives is kept for `seen`.
const WATCHED_EVENTS: [&str; 2] = ["greet", "theme"];

/// Activations across every module the loader built in this process.
static ACTIVATIONS: AtomicUsize = AtomicUsize::new(0);
/// Armed by `fail_next_deactivate`; the next deactivate hook errors once.
static FAIL_DEACTIVATE: AtomicBool = AtomicBool::new(false);

type Slot = Arc<OnceLock<WorkerContext>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(load).await
}

fn load(identity: &ToolIdentity) -> anyhow::Result<ToolModule> {
    info!(tool_id = %identity.tool_id, root = %identity.root.display(), "loading echo tool");
    let slot: Slot = Arc::new(OnceLock::new());
    let seen: Arc<DashMap<String, Vec<Value>>> = Arc::new(DashMap::new());

    let on_activate = {
        let slot = slot.clone();
        let seen = seen.clone();
        move |ctx: WorkerContext| {
            let slot = slot.clone();
            let seen = seen.clone();
            async move {
                ACTIVATIONS.fetch_add(1, Ordering::SeqCst);
                for name in WATCHED_EVENTS {
                    let seen = seen.clone();
                    let sub = ctx.api().events().on(name, move |data| {
                        seen.entry(name.to_string()).or_default().push(data.clone());
                    });
                    ctx.subscribe(sub);
                }
                let shout = ctx.api().commands().register("shout", |args| async move {
                    let text = args.first().and_then(Value::as_str).unwrap_or_default();
                    Ok(json!(text.to_uppercase()))
                });
                ctx.subscribe(shout);
                ctx.subscribe(Disposable::new(|| {
                    info!("echo tool released");
                    Ok(())
                }));
                slot.set(ctx).map_err(|_| anyhow!("activated twice without reload"))?;
                anyhow::Ok(())
            }
        }
    };

    Ok(ToolModule::new()
        .on_activate(on_activate)
        .on_deactivate(|| async {
            info!("echo tool deactivating");
            if FAIL_DEACTIVATE.swap(false, Ordering::SeqCst) {
                anyhow::bail!("refusing to deactivate");
            }
            Ok(())
        })
        .sync_method("fail_next_deactivate", |_| {
            FAIL_DEACTIVATE.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        })
        .sync_method("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        .sync_method("add", |args| {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok(json!(sum))
        })
        .sync_method("fail", |args| {
            let reason = args.first().and_then(Value::as_str).unwrap_or("failed on purpose");
            Err(anyhow!("{reason}"))
        })
        .method("sleep", |args| async move {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        })
        .method("hang", |_| futures::future::pending())
        .sync_method("explode", |_| panic!("kaboom"))
        .sync_method("panic_detached", |_| {
            tokio::spawn(async { detonate() });
            Ok(Value::Null)
        })
        .sync_method("crash", |args| {
            let code = args.first().and_then(Value::as_i64).unwrap_or(101) as i32;
            std::process::exit(code)
        })
        .method(
            "notify",
            with_context(&slot, |ctx, args| async move {
                let text = args.first().and_then(Value::as_str).unwrap_or("hello").to_string();
                let picked = ctx.api().window().show_information_message(&text, &["Ok"]).await?;
                Ok(json!(picked))
            }),
        )
        .method(
            "copy",
            with_context(&slot, |ctx, args| async move {
                let text = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
                ctx.api().window().write_clipboard(&text).await?;
                Ok(Value::Null)
            }),
        )
        .method(
            "save",
            with_context(&slot, |ctx, args| async move {
                let path = args.first().and_then(Value::as_str).context("path required")?.to_string();
                let content = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
                Ok(json!(ctx.api().workspace().save_file(&path, &content).await?))
            }),
        )
        .method(
            "emit",
            with_context(&slot, |ctx, args| async move {
                let name = args.first().and_then(Value::as_str).context("event name required")?.to_string();
                let data = args.get(1).cloned().unwrap_or(Value::Null);
                ctx.api().events().emit(&name, data).await?;
                Ok(Value::Null)
            }),
        )
        .method(
            "history",
            with_context(&slot, |ctx, args| async move {
                let limit = args.first().and_then(Value::as_u64).map(|l| l as usize);
                Ok(Value::Array(ctx.api().events().history(limit).await?))
            }),
        )
        .method(
            "remember",
            with_context(&slot, |ctx, args| async move {
                let key = args.first().and_then(Value::as_str).context("key required")?.to_string();
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                ctx.global_state.update(&key, value).await?;
                Ok(json!(ctx.global_state.get(&key)))
            }),
        )
        .method(
            "forbidden",
            with_context(&slot, |ctx, args| async move {
                let method = args.first().and_then(Value::as_str).unwrap_or("notAllowedMethod").to_string();
                Ok(ctx.api().call(&method, vec![]).await?)
            }),
        )
        .method(
            "run_command",
            with_context(&slot, |ctx, args| async move {
                let mut args = args.into_iter();
                let name = args.next().and_then(|v| v.as_str().map(str::to_string)).context("command required")?;
                Ok(ctx.api().commands().execute(&name, args.collect()).await?)
            }),
        )
        .sync_method("activations", |_| Ok(json!(ACTIVATIONS.load(Ordering::SeqCst))))
        .sync_method("seen", move |args| {
            let name = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(seen.get(name).map(|v| v.value().clone()).unwrap_or_default()))
        }))
}

fn detonate() {
    panic!("detached kaboom")
}

/// Adapt a handler that needs the activation context.
fn with_context<F, Fut>(
    slot: &Slot,
    handler: F,
) -> impl Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static
where
    F: Fn(WorkerContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    let slot = slot.clone();
    let handler = Arc::new(handler);
    move |args| {
        let slot = slot.clone();
        let handler = handler.clone();
        async move {
            let ctx = slot.get().cloned().context("tool is not activated")?;
            handler(ctx, args).await
        }
        .boxed()
    }
}

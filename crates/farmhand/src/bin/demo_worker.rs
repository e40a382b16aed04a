//! Demo worker: the child binary the integration tests (and the README
//! examples) spawn. Registers a handful of methods exercising the forward
//! call path, reverse handles, master-calls, and log forwarding.

use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use farmhand_proto::LogLevel;
use farmhand_worker::{WorkerModule, run_worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Frames own stdout; logs go to stderr, which the parent inherits.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    run_worker(demo_module()).await
}

fn demo_module() -> WorkerModule {
    WorkerModule::new()
        .method("run", |_ctx, args| async move {
            // Sum every integer argument; the trailing warmup flag is a
            // bool and falls through the filter.
            let total: i64 = args
                .iter()
                .filter_map(|arg| arg.as_data().and_then(Value::as_i64))
                .sum();
            Ok(json!(total))
        })
        .method("slow", |_ctx, args| async move {
            let ms = args
                .first()
                .and_then(|arg| arg.as_data())
                .and_then(Value::as_u64)
                .unwrap_or(500);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(json!("slept"))
        })
        .method("flaky", |_ctx, args| async move {
            // Dies on first sight of the marker path, succeeds once the
            // marker exists. Exercises requeue-with-retry.
            let marker = args
                .first()
                .and_then(|arg| arg.as_data())
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("expected a marker path"))?;
            if std::fs::metadata(marker).is_err() {
                std::fs::write(marker, b"seen")?;
                std::process::exit(1);
            }
            Ok(json!("recovered"))
        })
        .method("call_handle", |ctx, args| async move {
            let handle = args
                .first()
                .and_then(|arg| arg.as_handle())
                .ok_or_else(|| anyhow::anyhow!("expected a handle"))?;
            let value = args
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("expected a value"))?;
            ctx.call_handle(handle, vec![value]).await
        })
        .method("ping_master", |ctx, _args| async move {
            ctx.call_master("util", "ping", Vec::new()).await
        })
        .method("shout", |ctx, args| async move {
            let message = args
                .first()
                .and_then(|arg| arg.as_data())
                .and_then(Value::as_str)
                .unwrap_or("worker checking in");
            ctx.log(LogLevel::Info, message).await?;
            Ok(json!("logged"))
        })
}

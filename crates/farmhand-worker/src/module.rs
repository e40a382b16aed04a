use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use farmhand_proto::WireValue;

use crate::context::WorkerContext;

pub type MethodFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;

pub type MethodFn = Arc<dyn Fn(WorkerContext, Vec<WireValue>) -> MethodFuture + Send + Sync>;

/// A named bundle of worker methods. Method-name resolution on the request
/// path is a lookup in this table.
#[derive(Clone, Default)]
pub struct WorkerModule {
    methods: HashMap<String, MethodFn>,
}

impl WorkerModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkerContext, Vec<WireValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Arc::new(move |ctx, args| f(ctx, args).boxed()));
        self
    }

    pub fn get(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }

    pub async fn invoke(
        &self,
        ctx: WorkerContext,
        method: &str,
        args: Vec<WireValue>,
    ) -> anyhow::Result<serde_json::Value> {
        let Some(f) = self.get(method) else {
            anyhow::bail!("unknown method `{method}`");
        };
        f(ctx, args).await
    }
}

/// Modules the parent can resolve: the user worker module plus any
/// master-call targets, keyed by location id. Populated by the embedder at
/// startup; there is no dynamic loading.
#[derive(Clone)]
pub struct ModuleRegistry {
    worker: Arc<WorkerModule>,
    locations: HashMap<String, Arc<WorkerModule>>,
}

impl ModuleRegistry {
    pub fn new(worker: WorkerModule) -> Self {
        Self {
            worker: Arc::new(worker),
            locations: HashMap::new(),
        }
    }

    pub fn register(mut self, location: impl Into<String>, module: WorkerModule) -> Self {
        self.locations.insert(location.into(), Arc::new(module));
        self
    }

    pub fn worker(&self) -> Arc<WorkerModule> {
        Arc::clone(&self.worker)
    }

    pub fn location(&self, id: &str) -> Option<Arc<WorkerModule>> {
        self.locations.get(id).cloned()
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use farmhand_proto::{Handle, WireValue};

pub(crate) type ReverseFn =
    Arc<dyn Fn(Vec<WireValue>) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Parent-side functions addressable by handle id. Ids are farm-unique and
/// survive the round trip to a worker; the worker only ever sends the id
/// back, it never executes the function.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, ReverseFn>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create<F, Fut>(&self, f: F) -> Handle
    where
        F: Fn(Vec<WireValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .insert(id, Arc::new(move |args| f(args).boxed()));
        Handle::new(id)
    }

    pub fn resolve(&self, id: u64) -> Option<ReverseFn> {
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .get(&id)
            .cloned()
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use cxo_registry::SchemaRegistry;
use cxo_store::ObjectStore;
use cxo_types::Hash;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{FillError, FillResult};
use crate::filler::Filler;

/// Where missing objects come from: a peer connection, another store.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn fetch(&self, hash: Hash) -> FillResult<Vec<u8>>;
}

/// Serves objects out of a store, e.g. a peer in the same process.
#[derive(Debug)]
pub struct StoreSource<S> {
    store: Arc<S>,
}

impl<S> StoreSource<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ObjectStore + 'static> ObjectSource for StoreSource<S> {
    async fn fetch(&self, hash: Hash) -> FillResult<Vec<u8>> {
        self.store
            .get(&hash)?
            .ok_or_else(|| FillError::Remote(format!("peer has no object {}", hash.short_hex())))
    }
}

/// Answer the want stream of `filler` from `source` until the fill is over.
///
/// Each want is fetched on its own task. A fetch error fails the fill.
pub fn serve_wants<S, R, Src>(
    filler: Filler<S, R>,
    mut wants: mpsc::UnboundedReceiver<Hash>,
    source: Arc<Src>,
) -> JoinHandle<()>
where
    S: ObjectStore + 'static,
    R: SchemaRegistry + 'static,
    Src: ObjectSource + ?Sized + 'static,
{
    tokio::spawn(async move {
        loop {
            let hash = tokio::select! {
                biased;
                _ = filler.finished() => break,
                want = wants.recv() => match want {
                    Some(hash) => hash,
                    None => break,
                },
            };
            let filler = filler.clone();
            let source = Arc::clone(&source);
            tokio::spawn(async move {
                let delivered = match source.fetch(hash).await {
                    Ok(bytes) => filler.deliver(hash, bytes),
                    Err(err) => Err(err),
                };
                if let Err(err) = delivered {
                    filler.fail(err);
                }
            });
        }
        debug!("want stream closed");
    })
}

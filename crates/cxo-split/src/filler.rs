//! Concurrent materialization of an object graph.
//!
//! A [`Filler`] walks the graph below a set of [`Dynamic`] references the
//! way `walk` does, but objects may be missing locally. A missing object is
//! announced once on the want stream and the task that needs it waits until
//! [`Filler::deliver`] hands it over or the fill ends.
//!
//! Every object the fill reads or stores gets its reference count bumped.
//! On success those counts stay: the new owner now holds the graph. On
//! failure or termination they are reversed once every task has stopped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cxo_registry::codec::{self, read_length, LENGTH_PREFIX};
use cxo_registry::{Dynamic, EncodedRefs, EncodedRefsNode, Ref, Root, Schema, SchemaRegistry};
use cxo_store::ObjectStore;
use cxo_types::Hash;
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::FillConfig;
use crate::error::{FillError, FillResult};
use crate::types::{FillReport, FillState};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Waiter = oneshot::Sender<(Vec<u8>, u32)>;

/// A unit of traversal: one object and what it is.
#[derive(Debug)]
enum Job {
    Dynamic(Dynamic),
    Object { schema: Arc<Schema>, hash: Hash },
    Refs { elem: Arc<Schema>, hash: Hash },
    RefsNode {
        elem: Arc<Schema>,
        hash: Hash,
        depth: usize,
        degree: usize,
    },
}

/// Handle on one fill. Clones share the fill.
pub struct Filler<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> Clone for Filler<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, R> {
    store: Arc<S>,
    registry: Arc<R>,
    config: FillConfig,
    limit: Option<Arc<Semaphore>>,

    /// Waiters per missing hash.
    wanted: Mutex<HashMap<Hash, Vec<Waiter>>>,
    wants: mpsc::UnboundedSender<Hash>,
    /// Every reference count increment made by this fill, in order.
    incs: Mutex<Vec<Hash>>,

    started: AtomicBool,
    state: Mutex<FillState>,
    error: Mutex<Option<FillError>>,
    done: watch::Sender<bool>,

    /// Spawned tasks still running.
    pending: AtomicUsize,
    idle: Notify,

    fetched: AtomicUsize,
    local: AtomicUsize,
    skipped: AtomicUsize,
}

/// Counts a spawned task until it is dropped.
struct PendingGuard<S, R> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R> PendingGuard<S, R> {
    fn new(inner: Arc<Inner<S, R>>) -> Self {
        inner.pending.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl<S, R> Drop for PendingGuard<S, R> {
    fn drop(&mut self) {
        if self.inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_one();
        }
    }
}

impl<S, R> Filler<S, R>
where
    S: ObjectStore + 'static,
    R: SchemaRegistry + 'static,
{
    /// Create a filler and the stream on which it announces missing
    /// objects. Each hash appears on the stream once.
    pub fn new(
        store: Arc<S>,
        registry: Arc<R>,
        config: FillConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Hash>) {
        let (wants, rx) = mpsc::unbounded_channel();
        let (done, _) = watch::channel(false);
        let limit = (config.max_parallel > 0).then(|| Arc::new(Semaphore::new(config.max_parallel)));
        let inner = Inner {
            store,
            registry,
            config,
            limit,
            wanted: Mutex::new(HashMap::new()),
            wants,
            incs: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            state: Mutex::new(FillState::Running),
            error: Mutex::new(None),
            done,
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            fetched: AtomicUsize::new(0),
            local: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Fill the graphs below every reference of a root.
    pub async fn fill_root(&self, root: &Root) -> FillResult<FillReport> {
        root.validate()?;
        self.fill_dynamics(&root.refs).await
    }

    /// Fill the graphs below the given references and wait for the result.
    ///
    /// Blank references are ignored. On error every reference count this
    /// fill changed is restored before returning.
    pub async fn fill_dynamics(&self, dynamics: &[Dynamic]) -> FillResult<FillReport> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(FillError::AlreadyStarted);
        }
        info!(
            roots = dynamics.len(),
            max_parallel = inner.config.max_parallel,
            "fill started"
        );
        for d in dynamics.iter().filter(|d| !d.is_blank()) {
            Inner::spawn(inner, Inner::run(Arc::clone(inner), Job::Dynamic(*d))).await;
        }
        inner.wait_idle().await;
        inner.finish()
    }

    /// Hand over an object announced on the want stream.
    ///
    /// Returns `false` if nobody waits for it (never wanted, already
    /// delivered, or the fill is over). Bytes that do not hash to `hash`
    /// are rejected.
    pub fn deliver(&self, hash: Hash, bytes: Vec<u8>) -> FillResult<bool> {
        self.inner.deliver(hash, bytes)
    }

    /// Abort the fill with an error. Only the first error is kept.
    pub fn fail(&self, err: FillError) {
        self.inner.fail(err);
    }

    /// Cancel the fill. Pending waits return promptly.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    pub fn state(&self) -> FillState {
        *self.inner.state.lock().expect("lock poisoned")
    }

    /// Counters so far.
    pub fn report(&self) -> FillReport {
        self.inner.report()
    }

    /// Hashes currently waited for.
    pub fn pending_wants(&self) -> Vec<Hash> {
        let mut out: Vec<Hash> = self
            .inner
            .wanted
            .lock()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        out.sort();
        out
    }

    /// Resolves once the fill has stopped taking work.
    pub async fn finished(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|d| *d).await;
    }

    pub fn config(&self) -> &FillConfig {
        &self.inner.config
    }
}

impl<S, R> Inner<S, R>
where
    S: ObjectStore + 'static,
    R: SchemaRegistry + 'static,
{
    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    fn report(&self) -> FillReport {
        FillReport {
            fetched: self.fetched.load(Ordering::Acquire),
            local: self.local.load(Ordering::Acquire),
            skipped: self.skipped.load(Ordering::Acquire),
        }
    }

    // -----------------------------------------------------------------------
    // Task control
    // -----------------------------------------------------------------------

    /// Run a task concurrently if the ceiling allows it, inline otherwise.
    /// Nothing new starts once the fill is done.
    async fn spawn(this: &Arc<Self>, task: Task) {
        if this.is_done() {
            return;
        }
        match &this.limit {
            None => Self::launch(this, None, task),
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Self::launch(this, Some(permit), task),
                Err(_) => task.await,
            },
        }
    }

    fn launch(this: &Arc<Self>, permit: Option<OwnedSemaphorePermit>, task: Task) {
        let guard = PendingGuard::new(Arc::clone(this));
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            task.await;
        });
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn fail(&self, err: FillError) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state != FillState::Running {
                return;
            }
            warn!(error = %err, "fill failed");
            *state = FillState::Failed;
            *self.error.lock().expect("lock poisoned") = Some(err);
        }
        self.done.send_replace(true);
    }

    fn terminate(&self) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state != FillState::Running {
                return;
            }
            *state = FillState::Terminated;
        }
        info!("fill terminated");
        self.done.send_replace(true);
    }

    /// Settle the final state once no task is running.
    fn finish(&self) -> FillResult<FillReport> {
        let state = {
            let mut state = self.state.lock().expect("lock poisoned");
            if *state == FillState::Running {
                *state = FillState::Success;
            }
            *state
        };
        self.done.send_replace(true);
        match state {
            FillState::Success => {
                let report = self.report();
                info!(
                    fetched = report.fetched,
                    local = report.local,
                    skipped = report.skipped,
                    "fill finished"
                );
                Ok(report)
            }
            FillState::Terminated => {
                self.rollback();
                Err(FillError::Terminated)
            }
            FillState::Failed | FillState::Running => {
                self.rollback();
                Err(self
                    .error
                    .lock()
                    .expect("lock poisoned")
                    .take()
                    .unwrap_or(FillError::Terminated))
            }
        }
    }

    /// Reverse every increment made by this fill, newest first.
    fn rollback(&self) {
        let mut wanted = self.wanted.lock().expect("lock poisoned");
        wanted.clear();
        let incs = std::mem::take(&mut *self.incs.lock().expect("lock poisoned"));
        for hash in incs.iter().rev() {
            if let Err(err) = self.store.increment(hash, -1) {
                warn!(hash = %hash.short_hex(), error = %err, "rollback decrement failed");
            }
        }
        warn!(objects = incs.len(), "fill rolled back");
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    fn take_local(&self, hash: &Hash) -> FillResult<Option<(Vec<u8>, u32)>> {
        let Some((bytes, rc)) = self.store.get_inc(hash, 1)? else {
            return Ok(None);
        };
        self.incs.lock().expect("lock poisoned").push(*hash);
        self.local.fetch_add(1, Ordering::AcqRel);
        Ok(Some((bytes, rc)))
    }

    /// Object bytes and the reference count after this fill's increment.
    /// Waits for a delivery if the object is not stored yet.
    async fn get(&self, hash: Hash) -> FillResult<(Vec<u8>, u32)> {
        if self.is_done() {
            return Err(FillError::Terminated);
        }
        if let Some(found) = self.take_local(&hash)? {
            return Ok(found);
        }
        let rx = {
            let mut wanted = self.wanted.lock().expect("lock poisoned");
            // a delivery may have landed since the first look
            if let Some(found) = self.take_local(&hash)? {
                return Ok(found);
            }
            let (tx, rx) = oneshot::channel();
            let waiters = wanted.entry(hash).or_default();
            waiters.push(tx);
            if waiters.len() == 1 {
                debug!(hash = %hash.short_hex(), "requesting missing object");
                self.wants
                    .send(hash)
                    .map_err(|_| FillError::Remote("want stream closed".into()))?;
            }
            rx
        };
        let mut done = self.done.subscribe();
        tokio::select! {
            got = rx => got.map_err(|_| FillError::Terminated),
            _ = done.wait_for(|d| *d) => Err(FillError::Terminated),
        }
    }

    fn deliver(&self, hash: Hash, bytes: Vec<u8>) -> FillResult<bool> {
        let actual = Hash::digest(&bytes);
        if actual != hash {
            warn!(
                expected = %hash.short_hex(),
                actual = %actual.short_hex(),
                "rejected delivery"
            );
            return Err(FillError::HashMismatch {
                expected: hash,
                actual,
            });
        }
        let mut wanted = self.wanted.lock().expect("lock poisoned");
        if self.is_done() {
            return Ok(false);
        }
        let Some(waiters) = wanted.remove(&hash) else {
            return Ok(false);
        };
        let n = u32::try_from(waiters.len()).unwrap_or(u32::MAX);
        let after = self.store.set(hash, bytes.clone(), n)?;
        self.incs
            .lock()
            .expect("lock poisoned")
            .extend(std::iter::repeat(hash).take(waiters.len()));
        self.fetched.fetch_add(1, Ordering::AcqRel);
        debug!(hash = %hash.short_hex(), waiters = n, "object delivered");

        // each waiter sees the count as if it had stored the object itself
        let before = after.saturating_sub(n);
        for (i, tx) in waiters.into_iter().enumerate() {
            let rc = before.saturating_add(i as u32 + 1);
            let _ = tx.send((bytes.clone(), rc));
        }
        Ok(true)
    }

    /// Object bytes, or `None` if the object was already owned by someone
    /// else and so is complete.
    async fn fetch(&self, hash: Hash) -> FillResult<Option<Vec<u8>>> {
        let (bytes, rc) = self.get(hash).await?;
        if rc > 1 {
            self.skipped.fetch_add(1, Ordering::AcqRel);
            trace!(hash = %hash.short_hex(), refcount = rc, "subtree already present");
            return Ok(None);
        }
        Ok(Some(bytes))
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    fn run(this: Arc<Self>, job: Job) -> Task {
        Box::pin(async move {
            if let Err(err) = Self::process(&this, job).await {
                this.fail(err);
            }
        })
    }

    async fn process(this: &Arc<Self>, job: Job) -> FillResult<()> {
        match job {
            Job::Dynamic(d) => {
                d.validate()?;
                if d.hash.is_zero() {
                    return Ok(());
                }
                let schema = this.registry.schema_by_ref(&d.schema)?;
                Self::process_object(this, schema, d.hash).await
            }
            Job::Object { schema, hash } => Self::process_object(this, schema, hash).await,
            Job::Refs { elem, hash } => {
                let Some(bytes) = this.fetch(hash).await? else {
                    return Ok(());
                };
                let root: EncodedRefs = codec::decode(&bytes)?;
                root.validate()?;
                let (depth, degree) = (root.depth as usize, root.degree as usize);
                Self::fan_out(this, &elem, root.elements, depth, degree).await;
                Ok(())
            }
            Job::RefsNode {
                elem,
                hash,
                depth,
                degree,
            } => {
                let Some(bytes) = this.fetch(hash).await? else {
                    return Ok(());
                };
                let node: EncodedRefsNode = codec::decode(&bytes)?;
                node.validate(degree, depth)?;
                Self::fan_out(this, &elem, node.elements, depth, degree).await;
                Ok(())
            }
        }
    }

    async fn process_object(this: &Arc<Self>, schema: Arc<Schema>, hash: Hash) -> FillResult<()> {
        let Some(bytes) = this.fetch(hash).await? else {
            return Ok(());
        };
        let mut jobs = Vec::new();
        collect_jobs(&schema, &bytes, &mut jobs)?;
        for job in jobs {
            Self::spawn(this, Self::run(Arc::clone(this), job)).await;
        }
        Ok(())
    }

    /// Children of a `Refs` node at `depth`: element objects at depth 0,
    /// nodes one level down otherwise.
    async fn fan_out(
        this: &Arc<Self>,
        elem: &Arc<Schema>,
        children: Vec<Hash>,
        depth: usize,
        degree: usize,
    ) {
        for hash in children {
            let job = if depth == 0 {
                if hash.is_zero() {
                    continue;
                }
                Job::Object {
                    schema: Arc::clone(elem),
                    hash,
                }
            } else {
                Job::RefsNode {
                    elem: Arc::clone(elem),
                    hash,
                    depth: depth - 1,
                    degree,
                }
            };
            Self::spawn(this, Self::run(Arc::clone(this), job)).await;
        }
    }
}

/// References held inside one encoded value.
fn collect_jobs(schema: &Schema, bytes: &[u8], jobs: &mut Vec<Job>) -> FillResult<()> {
    if !schema.has_references() {
        return Ok(());
    }
    match schema {
        Schema::Ref { elem } => {
            let r: Ref = codec::decode(bytes)?;
            if !r.is_blank() {
                jobs.push(Job::Object {
                    schema: Arc::clone(elem),
                    hash: r.hash,
                });
            }
        }
        Schema::Refs { elem } => {
            let hash: Hash = codec::decode(bytes)?;
            if !hash.is_zero() {
                jobs.push(Job::Refs {
                    elem: Arc::clone(elem),
                    hash,
                });
            }
        }
        Schema::Dynamic => {
            let d: Dynamic = codec::decode(bytes)?;
            if !d.is_blank() {
                jobs.push(Job::Dynamic(d));
            }
        }
        Schema::Array { len, elem } => {
            for part in Schema::split_elements(elem, *len, bytes)? {
                collect_jobs(elem, part, jobs)?;
            }
        }
        Schema::Slice { elem } => {
            let len = read_length(bytes)?;
            for part in Schema::split_elements(elem, len, &bytes[LENGTH_PREFIX..])? {
                collect_jobs(elem, part, jobs)?;
            }
        }
        Schema::Struct { .. } => {
            for (field, part) in schema.split_fields(bytes)? {
                collect_jobs(&field.schema, part, jobs)?;
            }
        }
        Schema::Scalar(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use cxo_registry::{
        Pack, PackConfig, Refs, RefsFlags, Registry, RegistryError, ScalarKind, StorePack, WalkStep,
    };
    use cxo_store::InMemoryObjectStore;
    use cxo_types::SchemaRef;
    use serde::Serialize;

    use super::*;
    use crate::source::{serve_wants, ObjectSource, StoreSource};

    type TestFiller = Filler<InMemoryObjectStore, Registry>;

    #[derive(Serialize)]
    struct Post {
        title: String,
        body: Ref,
    }

    #[derive(Serialize)]
    struct Feed {
        name: String,
        posts: Refs,
    }

    #[derive(Serialize)]
    struct Bundle {
        items: Vec<Dynamic>,
        pinned: [Ref; 2],
    }

    fn text() -> Schema {
        Schema::scalar(ScalarKind::String)
    }

    fn post_schema() -> Schema {
        Schema::structure("Post", vec![("title", text()), ("body", Schema::ref_to(text()))])
    }

    fn feed_schema() -> Schema {
        Schema::structure(
            "Feed",
            vec![("name", text()), ("posts", Schema::refs_of(post_schema()))],
        )
    }

    fn bundle_schema() -> Schema {
        Schema::structure(
            "Bundle",
            vec![
                ("items", Schema::slice(Schema::Dynamic)),
                ("pinned", Schema::array(2, Schema::ref_to(text()))),
            ],
        )
    }

    fn config(degree: usize) -> PackConfig {
        PackConfig {
            degree,
            flags: RefsFlags::default(),
        }
    }

    /// A peer holding complete graphs and a local store filled from it.
    struct World {
        registry: Arc<Registry>,
        remote: Arc<InMemoryObjectStore>,
        local: Arc<InMemoryObjectStore>,
        pack: StorePack<InMemoryObjectStore, Registry>,
        post: SchemaRef,
        feed: SchemaRef,
        bundle: SchemaRef,
    }

    impl World {
        fn new() -> Self {
            let mut registry = Registry::new();
            let post = registry.register(post_schema()).unwrap();
            let feed = registry.register(feed_schema()).unwrap();
            let bundle = registry.register(bundle_schema()).unwrap();
            let registry = Arc::new(registry);
            let remote = Arc::new(InMemoryObjectStore::new());
            let pack = StorePack::new(Arc::clone(&remote), Arc::clone(&registry), config(2)).unwrap();
            Self {
                registry,
                remote,
                local: Arc::new(InMemoryObjectStore::new()),
                pack,
                post,
                feed,
                bundle,
            }
        }

        fn local_pack(&self) -> StorePack<InMemoryObjectStore, Registry> {
            StorePack::new(Arc::clone(&self.local), Arc::clone(&self.registry), config(2)).unwrap()
        }

        fn post(&self, title: &str) -> Post {
            let body = Ref::new(self.pack.add_value(&format!("{title} body")).unwrap());
            Post {
                title: title.to_string(),
                body,
            }
        }

        fn feed_of(&self, name: &str, posts: Vec<Post>) -> Dynamic {
            let values: Vec<Option<Post>> = posts.into_iter().map(Some).collect();
            let mut refs = Refs::default();
            refs.append_values(&self.pack, &values).unwrap();
            let feed = Feed {
                name: name.to_string(),
                posts: refs,
            };
            Dynamic::new(self.pack.add_value(&feed).unwrap(), self.feed)
        }

        fn feed(&self, name: &str, count: usize) -> Dynamic {
            let posts = (0..count).map(|i| self.post(&format!("post {i}"))).collect();
            self.feed_of(name, posts)
        }

        fn filler(&self, config: FillConfig) -> (TestFiller, mpsc::UnboundedReceiver<Hash>) {
            Filler::new(Arc::clone(&self.local), Arc::clone(&self.registry), config)
        }

        fn assert_complete(&self, d: &Dynamic) {
            d.walk(&self.local_pack(), &mut |_, _| Ok(WalkStep::Deeper))
                .unwrap();
        }
    }

    struct CountingSource {
        inner: StoreSource<InMemoryObjectStore>,
        requested: Mutex<Vec<Hash>>,
    }

    impl CountingSource {
        fn new(store: Arc<InMemoryObjectStore>) -> Self {
            Self {
                inner: StoreSource::new(store),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<Hash> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ObjectSource for CountingSource {
        async fn fetch(&self, hash: Hash) -> FillResult<Vec<u8>> {
            self.requested.lock().unwrap().push(hash);
            self.inner.fetch(hash).await
        }
    }

    struct LyingSource;

    #[async_trait]
    impl ObjectSource for LyingSource {
        async fn fetch(&self, _hash: Hash) -> FillResult<Vec<u8>> {
            Ok(b"garbage".to_vec())
        }
    }

    async fn run_fill(
        world: &World,
        config: FillConfig,
        dynamics: &[Dynamic],
    ) -> (FillResult<FillReport>, Vec<Hash>) {
        let (filler, wants) = world.filler(config);
        let source = Arc::new(CountingSource::new(Arc::clone(&world.remote)));
        let server = serve_wants(filler.clone(), wants, Arc::clone(&source));
        let result = tokio::time::timeout(Duration::from_secs(10), filler.fill_dynamics(dynamics))
            .await
            .expect("fill timed out");
        server.await.unwrap();
        (result, source.requested())
    }

    fn keys(store: &InMemoryObjectStore) -> BTreeSet<Hash> {
        store.all_keys().into_iter().collect()
    }

    // ---------------------------------------------------------------------------
    // Complete fills
    // ---------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fills_missing_graph() {
        let world = World::new();
        let feed = world.feed("news", 9);

        let (result, requested) = run_fill(&world, FillConfig::default(), &[feed]).await;
        let report = result.unwrap();

        let remote = keys(&world.remote);
        assert_eq!(keys(&world.local), remote);
        assert_eq!(report.fetched, remote.len());
        assert_eq!(report.local, 0);
        assert_eq!(report.skipped, 0);
        assert_eq!(requested.len(), remote.len());
        assert!(world.local.refcounts().iter().all(|(_, rc)| *rc == 1));
        world.assert_complete(&feed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn any_parallelism_completes() {
        for max_parallel in [1, 2, 0] {
            let world = World::new();
            let feed = world.feed("news", 20);
            let config = FillConfig { max_parallel };
            let (result, _) = run_fill(&world, config, &[feed]).await;
            assert_eq!(result.unwrap().fetched, world.remote.len());
            world.assert_complete(&feed);
        }
    }

    #[tokio::test]
    async fn single_threaded_runtime_completes() {
        let world = World::new();
        let feed = world.feed("news", 6);
        let (result, _) = run_fill(&world, FillConfig { max_parallel: 1 }, &[feed]).await;
        result.unwrap();
        world.assert_complete(&feed);
    }

    #[tokio::test]
    async fn follows_dynamics_slices_and_arrays() {
        let world = World::new();
        let first = world.pack.add_value(&world.post("first")).unwrap();
        let second = world.pack.add_value(&world.post("second")).unwrap();
        let feed = world.feed("news", 3);
        let bundle = Bundle {
            items: vec![
                Dynamic::new(first, world.post),
                Dynamic::default(),
                Dynamic::new(second, world.post),
                feed,
            ],
            pinned: [
                Ref::new(world.pack.add_value(&"pinned".to_string()).unwrap()),
                Ref::default(),
            ],
        };
        let root = Dynamic::new(world.pack.add_value(&bundle).unwrap(), world.bundle);

        let (result, _) = run_fill(&world, FillConfig::default(), &[root]).await;
        result.unwrap();
        assert_eq!(keys(&world.local), keys(&world.remote));
        world.assert_complete(&root);
    }

    #[tokio::test]
    async fn fill_root_visits_every_reference() {
        let world = World::new();
        let a = world.feed("a", 2);
        let b = world.feed("b", 3);
        let root = Root {
            refs: vec![a, Dynamic::default(), b],
            seq: 1,
            ..Default::default()
        };
        let (filler, wants) = world.filler(FillConfig::default());
        let server = serve_wants(
            filler.clone(),
            wants,
            Arc::new(StoreSource::new(Arc::clone(&world.remote))),
        );
        filler.fill_root(&root).await.unwrap();
        server.await.unwrap();
        assert_eq!(filler.state(), FillState::Success);
        world.assert_complete(&a);
        world.assert_complete(&b);
    }

    // ---------------------------------------------------------------------------
    // Shared subtrees
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn owned_subtree_is_not_requested() {
        let world = World::new();
        let first = world.feed("news", 8);
        run_fill(&world, FillConfig::default(), &[first]).await.0.unwrap();

        // same posts under a new feed object
        let mirror = world.feed("mirror", 8);
        let (result, requested) = run_fill(&world, FillConfig::default(), &[mirror]).await;
        let report = result.unwrap();

        assert_eq!(requested, vec![mirror.hash]);
        assert_eq!(
            report,
            FillReport {
                fetched: 1,
                local: 1,
                skipped: 1,
            }
        );
        world.assert_complete(&mirror);
    }

    #[tokio::test]
    async fn local_root_with_owner_is_skipped() {
        let world = World::new();
        let feed = world.feed("news", 4);
        run_fill(&world, FillConfig::default(), &[feed]).await.0.unwrap();
        let before = world.local.refcount(&feed.hash).unwrap();

        let (result, requested) = run_fill(&world, FillConfig::default(), &[feed]).await;
        assert_eq!(result.unwrap().skipped, 1);
        assert!(requested.is_empty());
        assert_eq!(world.local.refcount(&feed.hash).unwrap(), before + 1);
    }

    // ---------------------------------------------------------------------------
    // Failure, termination and rollback
    // ---------------------------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_restores_refcounts() {
        let world = World::new();
        let first = world.feed("news", 5);
        run_fill(&world, FillConfig::default(), &[first]).await.0.unwrap();
        let before = world.local.refcounts();

        let mut posts: Vec<Post> = (0..5).map(|i| world.post(&format!("post {i}"))).collect();
        posts.push(Post {
            title: "ghost".into(),
            body: Ref::new(Hash::digest(b"never stored")),
        });
        posts.push(world.post("late"));
        let broken = world.feed_of("broken", posts);

        let (filler, wants) = world.filler(FillConfig::default());
        let source = Arc::new(StoreSource::new(Arc::clone(&world.remote)));
        let server = serve_wants(filler.clone(), wants, source);
        let result = tokio::time::timeout(Duration::from_secs(10), filler.fill_dynamics(&[broken]))
            .await
            .expect("fill timed out");
        server.await.unwrap();

        assert!(matches!(result, Err(FillError::Remote(_))));
        assert_eq!(filler.state(), FillState::Failed);
        assert_eq!(world.local.refcounts(), before);
    }

    #[tokio::test]
    async fn terminate_unblocks_and_rolls_back() {
        let world = World::new();
        let first = world.feed("news", 2);
        run_fill(&world, FillConfig::default(), &[first]).await.0.unwrap();
        let before = world.local.refcounts();

        let second = world.feed("other", 1);
        let (filler, mut wants) = world.filler(FillConfig::default());
        let fill = tokio::spawn({
            let filler = filler.clone();
            async move { filler.fill_dynamics(&[first, second]).await }
        });

        let wanted = tokio::time::timeout(Duration::from_secs(5), wants.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wanted, second.hash);
        assert_eq!(filler.pending_wants(), vec![second.hash]);

        filler.terminate();
        let result = tokio::time::timeout(Duration::from_secs(5), fill)
            .await
            .expect("terminate did not unblock the fill")
            .unwrap();
        assert!(matches!(result, Err(FillError::Terminated)));
        assert_eq!(filler.state(), FillState::Terminated);
        assert_eq!(world.local.refcounts(), before);

        // late deliveries are ignored
        let bytes = world.remote.get(&second.hash).unwrap().unwrap();
        assert!(!filler.deliver(second.hash, bytes).unwrap());
        assert!(!world.local.contains(&second.hash).unwrap());
    }

    #[tokio::test]
    async fn terminated_before_start_does_nothing() {
        let world = World::new();
        let feed = world.feed("news", 2);
        let (filler, mut wants) = world.filler(FillConfig::default());
        filler.terminate();
        assert!(matches!(
            filler.fill_dynamics(&[feed]).await,
            Err(FillError::Terminated)
        ));
        assert!(wants.try_recv().is_err());
        assert!(world.local.is_empty());
    }

    #[tokio::test]
    async fn wrong_bytes_fail_the_fill() {
        let world = World::new();
        let feed = world.feed("news", 2);
        let (filler, wants) = world.filler(FillConfig::default());
        let server = serve_wants(filler.clone(), wants, Arc::new(LyingSource));
        let result = filler.fill_dynamics(&[feed]).await;
        server.await.unwrap();
        assert!(matches!(result, Err(FillError::HashMismatch { .. })));
        assert!(world.local.is_empty());
    }

    #[tokio::test]
    async fn invalid_dynamic_fails() {
        let world = World::new();
        let bad = Dynamic::new(Hash::digest(b"x"), SchemaRef::ZERO);
        let (filler, _wants) = world.filler(FillConfig::default());
        let result = filler.fill_dynamics(&[bad]).await;
        assert!(matches!(
            result,
            Err(FillError::Registry(RegistryError::InvalidDynamicReference))
        ));
        assert_eq!(filler.state(), FillState::Failed);
    }

    // ---------------------------------------------------------------------------
    // Delivery and lifecycle
    // ---------------------------------------------------------------------------

    #[tokio::test]
    async fn deliver_checks_content() {
        let world = World::new();
        let (filler, _wants) = world.filler(FillConfig::default());
        let bytes = b"hello".to_vec();
        assert!(matches!(
            filler.deliver(Hash::digest(b"other"), bytes.clone()),
            Err(FillError::HashMismatch { .. })
        ));
        // nobody asked for it
        assert!(!filler.deliver(Hash::digest(&bytes), bytes).unwrap());
        assert!(world.local.is_empty());
    }

    #[tokio::test]
    async fn filler_runs_once() {
        let world = World::new();
        let (filler, _wants) = world.filler(FillConfig::default());
        assert_eq!(filler.fill_dynamics(&[]).await.unwrap(), FillReport::default());
        assert_eq!(filler.state(), FillState::Success);
        assert!(matches!(
            filler.fill_dynamics(&[]).await,
            Err(FillError::AlreadyStarted)
        ));
        // finished() resolves once the fill is over
        tokio::time::timeout(Duration::from_secs(1), filler.finished())
            .await
            .unwrap();
    }
}

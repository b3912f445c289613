// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage server root object: configuration, the global worker pool, the
//! server-private segment pool backing hidden streams and scratch buffers,
//! the session table and the store manager.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SimutraceError};
use crate::storage::buffer::BufferPool;
use crate::storage::store::Store;
use crate::types::{
    IdAllocator, SessionId, StoreId, StreamId, StreamSegmentId, SERVER_BUFFER_ID,
    SERVER_SESSION_ID,
};
use crate::worker::WorkerPool;

/// Store path prefix selecting the simtrace container format.
const STORE_PREFIX: &str = "simtrace:";
/// Store files carry this extension; enumeration ignores everything else.
const STORE_EXTENSION: &str = "sim";

pub(crate) struct SessionState {
    pub store: Option<StoreId>,
    /// Segment a session reader currently holds open, per stream.
    pub open_segments: HashMap<StreamId, StreamSegmentId>,
    pub config_overrides: HashMap<String, String>,
}

struct SessionTable {
    map: HashMap<SessionId, SessionState>,
    allocator: IdAllocator,
}

struct StoreTable {
    map: HashMap<StoreId, Arc<Store>>,
    by_path: HashMap<PathBuf, StoreId>,
    allocator: IdAllocator,
}

pub struct StorageServer {
    config: Config,
    worker_pool: Arc<WorkerPool>,
    server_pool: Arc<BufferPool>,
    sessions: Mutex<SessionTable>,
    stores: Mutex<StoreTable>,
}

impl StorageServer {
    pub fn new(config: Config) -> Result<Arc<StorageServer>> {
        config.validate()?;

        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        let worker_pool = WorkerPool::new(threads);

        let server_pool = BufferPool::new(
            SERVER_BUFFER_ID,
            config.server_pool_segments(),
            !config.server.memmgmt.disable_cache,
            config.server.memmgmt.retry_count,
            Duration::from_millis(config.server.memmgmt.retry_sleep_ms),
        )?;

        info!(
            workers = threads,
            server_pool_segments = config.server_pool_segments(),
            "Storage server started"
        );

        Ok(Arc::new(StorageServer {
            config,
            worker_pool,
            server_pool,
            sessions: Mutex::new(SessionTable { map: HashMap::new(), allocator: IdAllocator::new() }),
            stores: Mutex::new(StoreTable {
                map: HashMap::new(),
                by_path: HashMap::new(),
                allocator: IdAllocator::new(),
            }),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.worker_pool
    }

    pub fn server_pool(&self) -> &Arc<BufferPool> {
        &self.server_pool
    }

    // ───────────────────────── sessions ─────────────────────────────────

    pub fn create_session(&self) -> SessionId {
        let mut sessions = self.sessions.lock();
        let id = sessions.allocator.next_id();
        sessions.map.insert(
            id,
            SessionState {
                store: None,
                open_segments: HashMap::new(),
                config_overrides: HashMap::new(),
            },
        );
        info!(session = id, "Session created");
        id
    }

    pub fn close_session(&self, session: SessionId) -> Result<()> {
        let state = {
            let mut sessions = self.sessions.lock();
            sessions.map.remove(&session).ok_or_else(|| {
                SimutraceError::NotFound(format!("session {session}"))
            })?
        };

        if state.store.is_some() {
            self.detach_store(session, state.store)?;
        }

        self.sessions.lock().allocator.retire_id(session);
        info!(session, "Session closed");
        Ok(())
    }

    pub(crate) fn with_session<R>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut SessionState) -> Result<R>,
    ) -> Result<R> {
        let mut sessions = self.sessions.lock();
        let state = sessions
            .map
            .get_mut(&session)
            .ok_or_else(|| SimutraceError::NotFound(format!("session {session}")))?;
        f(state)
    }

    // ───────────────────────── store paths ──────────────────────────────

    /// Resolves a `simtrace:<path>` specifier against the configured store
    /// root.
    pub fn resolve_store_path(&self, specifier: &str) -> Result<PathBuf> {
        let raw = match specifier.split_once(':') {
            Some(("simtrace", rest)) => rest,
            Some((prefix, _)) => {
                return Err(SimutraceError::NotSupported(format!(
                    "store provider '{prefix}'"
                )))
            }
            None => specifier,
        };
        if raw.is_empty() {
            return Err(SimutraceError::Argument("path".into(), "empty store path".into()));
        }

        let path = Path::new(raw);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.config.store.simtrace.root.join(path))
        }
    }

    /// Lists the store specifiers available under the configured root.
    pub fn enumerate_stores(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let root = &self.config.store.simtrace.root;
        for entry in std::fs::read_dir(root)
            .map_err(|e| SimutraceError::Config(format!("cannot enumerate {root:?}: {e}")))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STORE_EXTENSION) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    found.push(format!("{STORE_PREFIX}{name}"));
                }
            }
        }
        found.sort();
        Ok(found)
    }

    // ───────────────────────── stores ───────────────────────────────────

    fn attach_store_to_session(&self, session: SessionId, store: StoreId) -> Result<()> {
        self.with_session(session, |state| {
            if state.store.is_some() {
                return Err(SimutraceError::InvalidOperation(format!(
                    "session {session} already has an open store"
                )));
            }
            state.store = Some(store);
            Ok(())
        })
    }

    pub fn create_store(
        &self,
        session: SessionId,
        specifier: &str,
        overwrite: bool,
    ) -> Result<StoreId> {
        let path = self.resolve_store_path(specifier)?;

        let mut stores = self.stores.lock();
        if stores.by_path.contains_key(&path) {
            return Err(SimutraceError::InvalidOperation(format!(
                "store {specifier} is already open"
            )));
        }
        if !overwrite && path.exists() {
            return Err(SimutraceError::InvalidOperation(format!(
                "store {specifier} already exists"
            )));
        }

        let id = stores.allocator.next_id();
        let store = match Store::create(
            id,
            specifier.to_string(),
            &path,
            &self.config,
            self.worker_pool.clone(),
            self.server_pool.clone(),
        ) {
            Ok(store) => store,
            Err(e) => {
                stores.allocator.retire_id(id);
                return Err(e);
            }
        };

        store.attach(session)?;
        stores.map.insert(id, store);
        stores.by_path.insert(path, id);
        drop(stores);

        self.attach_store_to_session(session, id)?;
        Ok(id)
    }

    pub fn open_store(&self, session: SessionId, specifier: &str) -> Result<StoreId> {
        let path = self.resolve_store_path(specifier)?;

        let mut stores = self.stores.lock();
        if let Some(&id) = stores.by_path.get(&path) {
            // Another session already holds the store; share it.
            let store = stores.map.get(&id).cloned().ok_or_else(|| {
                SimutraceError::NotFound(format!("store {specifier}"))
            })?;
            store.attach(session)?;
            drop(stores);
            self.attach_store_to_session(session, id)?;
            return Ok(id);
        }

        let id = stores.allocator.next_id();
        let store = match Store::open(
            id,
            specifier.to_string(),
            &path,
            &self.config,
            self.worker_pool.clone(),
            self.server_pool.clone(),
        ) {
            Ok(store) => store,
            Err(e) => {
                stores.allocator.retire_id(id);
                return Err(e);
            }
        };

        store.attach(session)?;
        stores.map.insert(id, store);
        stores.by_path.insert(path, id);
        drop(stores);

        self.attach_store_to_session(session, id)?;
        Ok(id)
    }

    pub fn close_store(&self, session: SessionId) -> Result<()> {
        let store_id = self.with_session(session, |state| {
            state.open_segments.clear();
            Ok(state.store.take())
        })?;
        self.detach_store(session, store_id)
    }

    fn detach_store(&self, session: SessionId, store_id: Option<StoreId>) -> Result<()> {
        let store_id = store_id.ok_or_else(|| {
            SimutraceError::InvalidOperation(format!("session {session} has no open store"))
        })?;

        let store = {
            let stores = self.stores.lock();
            stores
                .map
                .get(&store_id)
                .cloned()
                .ok_or_else(|| SimutraceError::NotFound(format!("store {store_id}")))?
        };

        let released = store.detach(session)?;
        if released {
            let mut stores = self.stores.lock();
            stores.map.remove(&store_id);
            stores.by_path.retain(|_, &mut id| id != store_id);
            stores.allocator.retire_id(store_id);
        }
        Ok(())
    }

    pub fn session_store(&self, session: SessionId) -> Result<Arc<Store>> {
        let store_id = self.with_session(session, |state| {
            state.store.ok_or_else(|| {
                SimutraceError::InvalidOperation(format!("session {session} has no open store"))
            })
        })?;
        let stores = self.stores.lock();
        stores
            .map
            .get(&store_id)
            .cloned()
            .ok_or_else(|| SimutraceError::NotFound(format!("store {store_id}")))
    }

    /// Closes every session and store and stops the worker pool.
    pub fn shutdown(&self) {
        let sessions: Vec<SessionId> = self.sessions.lock().map.keys().copied().collect();
        for session in sessions {
            if let Err(e) = self.close_session(session) {
                warn!(session, error = %e, "Session close during shutdown failed");
            }
        }

        // Stores that never had a session keep their provider reference;
        // detach it on their behalf.
        let stores: Vec<Arc<Store>> = self.stores.lock().map.values().cloned().collect();
        for store in stores {
            match store.detach(SERVER_SESSION_ID) {
                Ok(true) => {
                    let mut table = self.stores.lock();
                    let id = store.id();
                    table.map.remove(&id);
                    table.by_path.retain(|_, &mut sid| sid != id);
                }
                Ok(false) => {}
                Err(e) => warn!(store = %store.name(), error = %e, "Store close during shutdown failed"),
            }
        }

        self.worker_pool.shutdown();
        info!("Storage server stopped");
    }
}

impl Drop for StorageServer {
    fn drop(&mut self) {
        // Pending encode jobs drain before the workers exit; stores left
        // attached keep their dirty flag and are refused on reopen.
        self.worker_pool.shutdown();
    }
}

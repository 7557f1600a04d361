//! `MemoryBackend` - in-process storage backend.
//!
//! Containers and objects live in ordered maps, so listings are lexicographic
//! by name. Every capability call is counted and one-shot faults can be queued
//! per call, which makes the backend useful for exercising the transfer
//! facade's retry and partial-failure paths.

use crate::backend::StorageBackend;
use crate::error::{Error, Result};
use crate::types::{BackendKind, ByteSource, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Capability calls the backend counts and can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    ListContainers,
    CreateContainer,
    ListObjects,
    Upload,
    Download,
}

/// Failure injected into the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// HTTP 503-equivalent; retryable
    Transient,
    /// HTTP 400-equivalent; never retried
    Permanent,
    /// Download only: the stream yields the first chunk, then fails
    Interrupted,
}

#[derive(Debug, Clone)]
struct Fault {
    call: BackendCall,
    key: Option<String>,
    kind: FaultKind,
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, BTreeMap<String, Bytes>>,
    calls: HashMap<BackendCall, usize>,
    faults: VecDeque<Fault>,
}

/// In-memory storage backend.
///
/// Cloning shares the underlying store, so a test can keep a handle for
/// inspection after moving another into a `DataTransfer`.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    chunk_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            chunk_size: 64 * 1024,
        }
    }

    /// Split downloads into chunks of at most `chunk_size` bytes
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Store an object directly, creating the container if needed.
    /// Not counted as a capability call.
    pub fn insert_object(&self, container: &str, key: &str, data: impl Into<Bytes>) {
        self.write()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    /// Current content of `container/key`
    pub fn object(&self, container: &str, key: &str) -> Option<Bytes> {
        self.read()
            .containers
            .get(container)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    /// How many times `call` was invoked
    pub fn call_count(&self, call: BackendCall) -> usize {
        self.read().calls.get(&call).copied().unwrap_or(0)
    }

    /// Fail the next `call` with `kind`
    pub fn inject_fault(&self, call: BackendCall, kind: FaultKind) {
        self.write().faults.push_back(Fault {
            call,
            key: None,
            kind,
        });
    }

    /// Fail the next `call` addressing `key` with `kind`
    pub fn inject_fault_for_key(&self, call: BackendCall, key: &str, kind: FaultKind) {
        self.write().faults.push_back(Fault {
            call,
            key: Some(key.to_string()),
            kind,
        });
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and pop the first queued fault that matches it
    fn enter(&self, call: BackendCall, key: Option<&str>) -> Option<FaultKind> {
        let mut state = self.write();
        *state.calls.entry(call).or_insert(0) += 1;

        let position = state.faults.iter().position(|fault| {
            fault.call == call
                && match (&fault.key, key) {
                    (None, _) => true,
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (Some(_), None) => false,
                }
        })?;
        state.faults.remove(position).map(|fault| fault.kind)
    }
}

fn injected(kind: FaultKind) -> Error {
    match kind {
        FaultKind::Transient | FaultKind::Interrupted => Error::Status {
            status: 503,
            message: "injected transient fault".to_string(),
        },
        FaultKind::Permanent => Error::Status {
            status: 400,
            message: "injected permanent fault".to_string(),
        },
    }
}

/// Turn an injected fault into an early error, except `Interrupted` on downloads
fn fail_fast(fault: Option<FaultKind>) -> Result<()> {
    match fault {
        Some(kind) => Err(injected(kind)),
        None => Ok(()),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        fail_fast(self.enter(BackendCall::ListContainers, None))?;
        Ok(self.read().containers.keys().cloned().collect())
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        fail_fast(self.enter(BackendCall::CreateContainer, Some(name)))?;

        let mut state = self.write();
        if state.containers.contains_key(name) {
            return Err(Error::ContainerConflict(name.to_string()));
        }
        state.containers.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<String>> {
        fail_fast(self.enter(BackendCall::ListObjects, Some(container)))?;

        self.read()
            .containers
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))
    }

    async fn upload(&self, container: &str, key: &str, source: &ByteSource) -> Result<()> {
        fail_fast(self.enter(BackendCall::Upload, Some(key)))?;

        let data = source.read_all().await?;
        let mut state = self.write();
        let objects = state
            .containers
            .get_mut(container)
            .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn download(&self, container: &str, key: &str) -> Result<ByteStream> {
        let fault = self.enter(BackendCall::Download, Some(key));
        if fault != Some(FaultKind::Interrupted) {
            fail_fast(fault)?;
        }

        let data = {
            let state = self.read();
            let objects = state
                .containers
                .get(container)
                .ok_or_else(|| Error::ContainerNotFound(container.to_string()))?;
            objects
                .get(key)
                .cloned()
                .ok_or_else(|| Error::ObjectNotFound {
                    container: container.to_string(),
                    key: key.to_string(),
                })?
        };

        let mut chunks: Vec<Result<Bytes>> = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }

        if fault == Some(FaultKind::Interrupted) {
            chunks.truncate(1);
            chunks.push(Err(injected(FaultKind::Interrupted)));
        }

        Ok(stream::iter(chunks).boxed())
    }
}

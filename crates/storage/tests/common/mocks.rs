//! Failure-injecting backends for orchestrator tests.

use super::memory::MemoryBackend;
use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wraps a memory backend and fails operations while `failing` is set.
/// Note: #[allow(dead_code)] because each test file compiles common/
/// separately.
#[allow(dead_code)]
pub struct FlakyBackend {
    pub inner: Arc<MemoryBackend>,
    failing: AtomicBool,
    pub write_attempts: AtomicUsize,
    pub read_attempts: AtomicUsize,
    pub probe_attempts: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBackend::new(),
            failing: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
            read_attempts: AtomicUsize::new(0),
            probe_attempts: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend {
                backend: "flaky",
                message: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.check()?;
        self.inner.head(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.read_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get_stream(key).await
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        self.read_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get_range(key, start, end).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put_stream(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.probe_attempts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

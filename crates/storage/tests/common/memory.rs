//! In-memory object store for tests.

use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// HashMap-backed object store. Note: #[allow(dead_code)] because each test
/// file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryBackend {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
}

#[allow(dead_code)]
impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
        })
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = {
            let objects = self.objects.lock().unwrap();
            objects
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        if end < start {
            return Err(StorageError::InvalidRange(format!("{start}-{end}")));
        }
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        if end >= data.len() as u64 {
            return Err(StorageError::InvalidRange(format!(
                "{start}-{end} out of bounds for {} bytes",
                data.len()
            )));
        }
        Ok(data.slice(start as usize..=end as usize))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        Ok(Box::new(MemoryUpload {
            objects: self.objects.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryUpload {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let len = self.buffer.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(self.key, Bytes::from(self.buffer));
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

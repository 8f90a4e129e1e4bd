//! In-memory [`S3Api`] for engine tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bucketry_core::{Error, Result};
use bytes::Bytes;
use jiff::Timestamp;

use crate::api::{
    CompleteMultipartRequest, CopyObjectRequest, CreateMultipartRequest, DeleteFailure,
    GetObjectResponse, ListPage, ListedObject, ObjectHead, PutObjectRequest, S3Api,
};

#[derive(Debug, Clone)]
pub(crate) struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub checksum_sha256: Option<String>,
    pub last_modified: Timestamp,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    content_type: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    aborted: Vec<String>,
    completed_parts: Vec<usize>,
    delete_batches: Vec<usize>,
}

/// Object store kept in a map, with counters for assertions
#[derive(Debug)]
pub(crate) struct MemoryApi {
    state: Mutex<State>,
    page_size: usize,
    next_upload: AtomicUsize,
    list_calls: AtomicUsize,
    copy_calls: AtomicUsize,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::default(),
            page_size,
            next_upload: AtomicUsize::new(1),
            list_calls: AtomicUsize::new(0),
            copy_calls: AtomicUsize::new(0),
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Replace an object's bytes, keeping its stored checksum
    pub fn corrupt(&self, bucket: &str, key: &str, data: Bytes) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&(bucket.to_string(), key.to_string())) {
            object.data = data;
        }
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn copy_calls(&self) -> usize {
        self.copy_calls.load(Ordering::SeqCst)
    }

    pub fn delete_batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().delete_batches.clone()
    }

    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Part count of every completed multipart upload, in order
    pub fn completed_part_counts(&self) -> Vec<usize> {
        self.state.lock().unwrap().completed_parts.clone()
    }

    fn store(
        state: &mut State,
        bucket: &str,
        key: &str,
        object: StoredObject,
        if_none_match: bool,
    ) -> Result<()> {
        let id = (bucket.to_string(), key.to_string());
        if if_none_match && state.objects.contains_key(&id) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        state.objects.insert(id, object);
        Ok(())
    }
}

#[async_trait]
impl S3Api for MemoryApi {
    async fn head_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead> {
        self.object(bucket, key)
            .map(|o| ObjectHead {
                size: o.data.len() as u64,
                etag: None,
            })
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let object = StoredObject {
            data: request.body,
            content_type: request.content_type,
            checksum_sha256: request.checksum_sha256,
            last_modified: Timestamp::now(),
        };
        Self::store(
            &mut state,
            &request.bucket,
            &request.key,
            object,
            request.if_none_match,
        )
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        checksum_mode: bool,
    ) -> Result<GetObjectResponse> {
        let object = self
            .object(bucket, key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(GetObjectResponse {
            content_length: Some(object.data.len() as u64),
            checksum_sha256: if checksum_mode {
                object.checksum_sha256
            } else {
                None
            },
            body: Box::pin(std::io::Cursor::new(object.data)),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let mut matching = state
            .objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| continuation_token.as_deref().is_none_or(|after| k.as_str() > after));

        let objects: Vec<ListedObject> = matching
            .by_ref()
            .take(self.page_size)
            .map(|((_, key), o)| ListedObject {
                key: key.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
                etag: None,
            })
            .collect();
        let next_token = match (matching.next(), objects.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };
        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteFailure>> {
        let mut state = self.state.lock().unwrap();
        state.delete_batches.push(keys.len());
        for key in keys {
            state.objects.remove(&(bucket.to_string(), key));
        }
        Ok(Vec::new())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<()> {
        self.copy_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let source = state
            .objects
            .get(&(request.source_bucket.clone(), request.source_key.clone()))
            .cloned()
            .ok_or_else(|| Error::NotFound(request.source_key.clone()))?;
        Self::store(&mut state, &request.bucket, &request.key, source, false)
    }

    async fn create_multipart_upload(&self, request: CreateMultipartRequest) -> Result<String> {
        let id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst));
        self.state.lock().unwrap().uploads.insert(
            id.clone(),
            Upload {
                bucket: request.bucket,
                key: request.key,
                content_type: request.content_type,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))?;
        upload.parts.insert(part_number, body);
        Ok(format!("etag-{upload_id}-{part_number}"))
    }

    async fn complete_multipart_upload(&self, request: CompleteMultipartRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let upload = state
            .uploads
            .get(&request.upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {}", request.upload_id)))?;

        let mut data = Vec::new();
        for part in &request.parts {
            let body = upload.parts.get(&part.part_number).ok_or_else(|| {
                Error::Transfer(format!("part {} was never uploaded", part.part_number))
            })?;
            data.extend_from_slice(body);
        }
        let object = StoredObject {
            data: Bytes::from(data),
            content_type: upload.content_type.clone(),
            checksum_sha256: None,
            last_modified: Timestamp::now(),
        };
        let (bucket, key) = (upload.bucket.clone(), upload.key.clone());

        Self::store(&mut state, &bucket, &key, object, request.if_none_match)?;
        state.uploads.remove(&request.upload_id);
        state.completed_parts.push(request.parts.len());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }
}

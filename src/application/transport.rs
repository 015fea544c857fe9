// Bundle transfers and the "save blob to local disk" primitive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::api::{ApiClient, ApiError};
use crate::domain::AppError;
use crate::utils::sanitize_filename;

pub type TransferId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    Progress { loaded: u64, total: u64 },
    /// The bundle arrived and was written to `path`.
    Finished { path: PathBuf, bytes: u64 },
    /// The bundle arrived but could not be written locally.
    SaveFailed(String),
    Failed(String),
}

/// Callback from an in-flight transfer, tagged with the transfer it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub transfer: TransferId,
    pub kind: TransferEventKind,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub transfer: TransferId,
    pub bundle_name: String,
    pub url: String,
    /// Planner's size estimate, used when the server sends no Content-Length.
    pub expected_size: u64,
}

/// Subscription to one in-flight transfer. `unsubscribe` stops it cooperatively;
/// dropping the handle does the same unless the transfer already `complete`d.
pub struct TransferHandle {
    id: TransferId,
    on_unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TransferHandle {
    pub fn new<F>(id: TransferId, on_unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            on_unsubscribe: Some(Box::new(on_unsubscribe)),
        }
    }

    pub fn detached(id: TransferId) -> Self {
        Self {
            id,
            on_unsubscribe: None,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    /// Release a handle whose transfer already ended, without stopping anything.
    pub fn complete(mut self) {
        self.on_unsubscribe = None;
    }

    fn stop(&mut self) {
        if let Some(stop) = self.on_unsubscribe.take() {
            stop();
        }
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferHandle").field("id", &self.id).finish()
    }
}

pub trait BundleTransport: Send + Sync {
    /// Begin a transfer. Progress and the final outcome arrive on `events`.
    fn start(
        &self,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
    ) -> TransferHandle;
}

/// Streams bundles over HTTP on the tokio runtime and saves them through
/// `sink` from the same task.
#[derive(Clone)]
pub struct HttpTransport {
    client: ApiClient,
    sink: Arc<dyn BlobSink>,
}

impl HttpTransport {
    pub fn new(client: ApiClient, sink: Arc<dyn BlobSink>) -> Self {
        Self { client, sink }
    }
}

impl BundleTransport for HttpTransport {
    fn start(
        &self,
        request: TransferRequest,
        events: UnboundedSender<TransferEvent>,
    ) -> TransferHandle {
        let client = self.client.clone();
        let sink = Arc::clone(&self.sink);
        let id = request.transfer;

        let task = tokio::spawn(async move {
            let kind = match stream_bundle(&client, &request, &events).await {
                Ok(blob) => match sink.save(&request.bundle_name, &blob).await {
                    Ok(path) => TransferEventKind::Finished {
                        path,
                        bytes: blob.len() as u64,
                    },
                    Err(e) => TransferEventKind::SaveFailed(e.to_string()),
                },
                Err(e) => TransferEventKind::Failed(e.to_string()),
            };
            let _ = events.send(TransferEvent {
                transfer: request.transfer,
                kind,
            });
        });

        let abort = task.abort_handle();
        TransferHandle::new(id, move || {
            debug!("aborting transfer {}", id);
            abort.abort();
        })
    }
}

async fn stream_bundle(
    client: &ApiClient,
    request: &TransferRequest,
    events: &UnboundedSender<TransferEvent>,
) -> Result<Bytes, ApiError> {
    let (total_size, stream) = client.download_bundle_stream(&request.url).await?;
    let total = total_size.unwrap_or(request.expected_size);
    let mut stream = Box::pin(stream);
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        let _ = events.send(TransferEvent {
            transfer: request.transfer,
            kind: TransferEventKind::Progress {
                loaded: buffer.len() as u64,
                total,
            },
        });
    }

    Ok(buffer.freeze())
}

#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Persist a finished bundle. Returns where it ended up.
    async fn save(&self, bundle_name: &str, blob: &[u8]) -> Result<PathBuf, AppError>;
}

/// Writes bundles as files under one directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, bundle_name: &str) -> PathBuf {
        let mut file_name = sanitize_filename(bundle_name);
        if file_name.is_empty() {
            file_name = "bundle".to_string();
        }
        if !file_name.to_ascii_lowercase().ends_with(".zip") {
            file_name.push_str(".zip");
        }
        self.dir.join(file_name)
    }
}

#[async_trait]
impl BlobSink for DirectorySink {
    async fn save(&self, bundle_name: &str, blob: &[u8]) -> Result<PathBuf, AppError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| storage_error(&self.dir, e))?;
        let path = self.path_for(bundle_name);
        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.write_all(blob)
            .await
            .map_err(|e| storage_error(&path, e))?;
        file.flush().await.map_err(|e| storage_error(&path, e))?;
        debug!("saved bundle {} ({} bytes)", path.display(), blob.len());
        Ok(path)
    }
}

fn storage_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::Storage(format!("Failed to write {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Notify};

    #[derive(Default)]
    struct MemorySink {
        saved: Mutex<Vec<(String, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl BlobSink for MemorySink {
        async fn save(&self, bundle_name: &str, blob: &[u8]) -> Result<PathBuf, AppError> {
            if self.fail {
                return Err(AppError::Storage("disk full".to_string()));
            }
            self.saved.lock().push((bundle_name.to_string(), blob.len()));
            Ok(PathBuf::from(bundle_name))
        }
    }

    /// Holds back saves of `held` until `release` is notified.
    struct GatedSink {
        held: String,
        release: Notify,
    }

    #[async_trait]
    impl BlobSink for GatedSink {
        async fn save(&self, bundle_name: &str, _blob: &[u8]) -> Result<PathBuf, AppError> {
            if bundle_name == self.held {
                self.release.notified().await;
            }
            Ok(PathBuf::from(bundle_name))
        }
    }

    fn request(
        transfer: TransferId,
        name: &str,
        url: String,
        expected_size: u64,
    ) -> TransferRequest {
        TransferRequest {
            transfer,
            bundle_name: name.to_string(),
            url,
            expected_size,
        }
    }

    fn client() -> ApiClient {
        ApiClient::new(ApiConfig::default())
    }

    #[tokio::test]
    async fn test_directory_sink_names_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("out"));

        assert!(sink.path_for("a/b").ends_with("a_b.zip"));
        assert!(sink.path_for("x.ZIP").ends_with("x.ZIP"));

        let path = sink.save("bundle-1.zip", b"PK\x03\x04").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"PK\x03\x04");
    }

    #[test]
    fn test_unsubscribe_runs_once() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stopped);
        let handle = TransferHandle::new(7, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(handle.id(), 7);
        handle.unsubscribe();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        TransferHandle::detached(8).unsubscribe();
    }

    #[test]
    fn test_drop_stops_unless_completed() {
        let stopped = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&stopped);
        drop(TransferHandle::new(1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&stopped);
        TransferHandle::new(2, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .complete();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_transport_reports_progress_then_saves() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zips/b1.zip")
            .with_status(200)
            .with_body(vec![1u8; 2048])
            .create_async()
            .await;

        let sink = Arc::new(MemorySink::default());
        let transport = HttpTransport::new(client(), sink.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.start(
            request(1, "b1.zip", format!("{}/zips/b1.zip", server.url()), 2048),
            tx,
        );

        let mut last_loaded = 0;
        loop {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.transfer, 1);
            match event.kind {
                TransferEventKind::Progress { loaded, total } => {
                    assert!(loaded >= last_loaded);
                    assert_eq!(total, 2048);
                    last_loaded = loaded;
                }
                TransferEventKind::Finished { path, bytes } => {
                    assert_eq!(bytes, 2048);
                    assert_eq!(path, PathBuf::from("b1.zip"));
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(sink.saved.lock().as_slice(), &[("b1.zip".to_string(), 2048)]);
    }

    #[tokio::test]
    async fn test_http_transport_reports_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zips/missing.zip")
            .with_status(404)
            .create_async()
            .await;

        let transport = HttpTransport::new(client(), Arc::new(MemorySink::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.start(
            request(2, "missing.zip", format!("{}/zips/missing.zip", server.url()), 10),
            tx,
        );

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, TransferEventKind::Failed(_)));
    }

    #[tokio::test]
    async fn test_http_transport_reports_save_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zips/b3.zip")
            .with_status(200)
            .with_body("PK")
            .create_async()
            .await;

        let sink = Arc::new(MemorySink {
            fail: true,
            ..Default::default()
        });
        let transport = HttpTransport::new(client(), sink);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.start(
            request(3, "b3.zip", format!("{}/zips/b3.zip", server.url()), 2),
            tx,
        );

        loop {
            match rx.recv().await.unwrap().kind {
                TransferEventKind::Progress { .. } => continue,
                TransferEventKind::SaveFailed(message) => {
                    assert!(message.contains("disk full"));
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_save_does_not_hold_back_other_transfers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/zips/big.zip")
            .with_status(200)
            .with_body(vec![7u8; 4 * 1024 * 1024])
            .create_async()
            .await;
        server
            .mock("GET", "/zips/small.zip")
            .with_status(200)
            .with_body("PK")
            .create_async()
            .await;

        let sink = Arc::new(GatedSink {
            held: "big.zip".to_string(),
            release: Notify::new(),
        });
        let transport = HttpTransport::new(client(), sink.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _big = transport.start(
            request(1, "big.zip", format!("{}/zips/big.zip", server.url()), 0),
            tx.clone(),
        );
        let _small = transport.start(
            request(2, "small.zip", format!("{}/zips/small.zip", server.url()), 2),
            tx,
        );

        loop {
            let event = rx.recv().await.unwrap();
            if let TransferEventKind::Finished { .. } = event.kind {
                assert_eq!(event.transfer, 2);
                break;
            }
        }

        sink.release.notify_one();
        loop {
            let event = rx.recv().await.unwrap();
            if let TransferEventKind::Finished { bytes, .. } = event.kind {
                assert_eq!(event.transfer, 1);
                assert_eq!(bytes, 4 * 1024 * 1024);
                break;
            }
        }
    }
}

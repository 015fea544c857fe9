// Concurrency-bounded executor for bundle transfers.
//
// All state changes happen on the single consumer that owns the queue; transfers
// only report back through `TransferEvent`s. An event whose transfer handle is no
// longer attached to a task is dropped, so a canceled transfer can never mutate
// task state after the fact.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc::UnboundedSender};
use tracing::{debug, info, warn};

use super::cart::Cart;
use super::cart_status::CartStatusRegistry;
use super::transport::{
    BundleTransport, TransferEvent, TransferEventKind, TransferHandle, TransferId,
    TransferRequest,
};
use crate::domain::{Bundle, DownloadStatus, TaskStatus};
use crate::utils::percent;

const EVENT_CAPACITY: usize = 1024;

/// Outward notifications for UIs and the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    TaskStarted {
        index: usize,
    },
    TaskProgress {
        index: usize,
        percent: u8,
    },
    TaskFinished {
        index: usize,
        status: TaskStatus,
        error: Option<String>,
    },
    Progress {
        percent: u8,
    },
    ProcessComplete {
        all_downloaded: bool,
    },
    Canceled,
}

/// Fired once each time every task reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub all_downloaded: bool,
}

#[derive(Debug)]
pub struct ZipDownloadTask {
    pub bundle: Bundle,
    pub url: String,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub loaded_bytes: u64,
    pub error_message: Option<String>,
    /// Cart keys of the files this bundle covers.
    pub file_keys: Vec<String>,
    handle: Option<TransferHandle>,
}

impl ZipDownloadTask {
    pub fn new(bundle: Bundle, url: impl Into<String>, file_keys: Vec<String>) -> Self {
        Self {
            bundle,
            url: url.into(),
            status: TaskStatus::Pending,
            progress_percent: 0,
            loaded_bytes: 0,
            error_message: None,
            file_keys,
            handle: None,
        }
    }

    /// Whether a transfer handle is still attached.
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }
}

pub struct DownloadQueue {
    tasks: Vec<ZipDownloadTask>,
    max_concurrent: usize,
    active: usize,
    total_bytes: u64,
    completion_signaled: bool,
    next_transfer: TransferId,
    transport: Arc<dyn BundleTransport>,
    transfer_events: UnboundedSender<TransferEvent>,
    cart: Arc<Mutex<Cart>>,
    registry: Arc<Mutex<CartStatusRegistry>>,
    bus: broadcast::Sender<QueueEvent>,
}

impl DownloadQueue {
    pub fn new(
        max_concurrent: usize,
        transport: Arc<dyn BundleTransport>,
        transfer_events: UnboundedSender<TransferEvent>,
        cart: Arc<Mutex<Cart>>,
        registry: Arc<Mutex<CartStatusRegistry>>,
    ) -> Self {
        let (bus, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tasks: Vec::new(),
            max_concurrent: max_concurrent.max(1),
            active: 0,
            total_bytes: 0,
            completion_signaled: false,
            next_transfer: 1,
            transport,
            transfer_events,
            cart,
            registry,
            bus,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.bus.subscribe()
    }

    pub fn tasks(&self) -> &[ZipDownloadTask] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&ZipDownloadTask> {
        self.tasks.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// `round(100 * loaded / total)` over all tasks, clamped to `[0, 100]`.
    /// Not monotonic: canceling or retrying a task drops its bytes.
    pub fn overall_percent(&self) -> u8 {
        if self.tasks.is_empty() {
            return 0;
        }
        let loaded: u64 = self.tasks.iter().map(|t| t.loaded_bytes).sum();
        if self.total_bytes == 0 {
            return if self.all_downloaded() { 100 } else { 0 };
        }
        percent(loaded, self.total_bytes)
    }

    pub fn all_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub fn all_downloaded(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Downloaded)
    }

    /// Replace the task list with a fresh batch. Any running transfers are
    /// canceled first.
    pub fn load(&mut self, tasks: Vec<ZipDownloadTask>) {
        if !self.tasks.is_empty() {
            self.detach_all();
        }
        self.total_bytes = tasks.iter().map(|t| t.bundle.bundle_size).sum();
        self.tasks = tasks;
        self.active = 0;
        self.completion_signaled = false;
        info!(
            "queued {} bundles ({} bytes), max {} concurrent",
            self.tasks.len(),
            self.total_bytes,
            self.max_concurrent
        );
    }

    /// Drop all tasks without emitting anything. Cart statuses are left as they are.
    pub fn reset(&mut self) {
        self.detach_all();
        self.tasks.clear();
        self.active = 0;
        self.total_bytes = 0;
        self.completion_signaled = false;
    }

    /// Promote the first pending task if a slot is free. Returns whether one started.
    pub fn download_next(&mut self) -> bool {
        if self.active >= self.max_concurrent {
            return false;
        }
        match self
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::Pending)
        {
            Some(index) => {
                self.start_download(index);
                true
            }
            None => false,
        }
    }

    /// Start pending tasks until the concurrency bound is reached.
    pub fn fill_slots(&mut self) -> usize {
        let mut started = 0;
        while self.download_next() {
            started += 1;
        }
        started
    }

    fn start_download(&mut self, index: usize) {
        let transfer = self.next_transfer;
        self.next_transfer += 1;

        let task = &mut self.tasks[index];
        task.status = TaskStatus::Downloading;
        task.progress_percent = 0;
        task.loaded_bytes = 0;
        task.error_message = None;
        self.active += 1;

        debug!(
            "starting bundle {} as transfer {} ({}/{} active)",
            task.bundle.bundle_name, transfer, self.active, self.max_concurrent
        );

        let handle = self.transport.start(
            TransferRequest {
                transfer,
                bundle_name: task.bundle.bundle_name.clone(),
                url: task.url.clone(),
                expected_size: task.bundle.bundle_size,
            },
            self.transfer_events.clone(),
        );
        task.handle = Some(handle);

        let keys = task.file_keys.clone();
        self.update_cart(&keys, DownloadStatus::Downloading);
        self.emit(QueueEvent::TaskStarted { index });
        self.debug_check_bound();
    }

    /// Apply a transfer callback. Events for transfers no longer attached to a
    /// task are ignored.
    pub fn handle_transfer_event(&mut self, event: TransferEvent) -> Option<Completion> {
        let Some(index) = self.index_of_transfer(event.transfer) else {
            debug!("ignoring event for detached transfer {}", event.transfer);
            return None;
        };

        match event.kind {
            TransferEventKind::Progress { loaded, total } => {
                let task = &mut self.tasks[index];
                let total = if total > 0 { total } else { task.bundle.bundle_size };
                task.loaded_bytes = loaded;
                task.progress_percent = if total > 0 { percent(loaded, total) } else { 0 };
                let task_percent = task.progress_percent;
                self.emit(QueueEvent::TaskProgress {
                    index,
                    percent: task_percent,
                });
                self.emit(QueueEvent::Progress {
                    percent: self.overall_percent(),
                });
                None
            }
            TransferEventKind::Finished { path, bytes } => {
                let task = &mut self.tasks[index];
                info!("bundle {} saved to {}", task.bundle.bundle_name, path.display());
                task.status = TaskStatus::Downloaded;
                task.progress_percent = 100;
                task.loaded_bytes = if task.bundle.bundle_size > 0 {
                    task.bundle.bundle_size
                } else {
                    bytes
                };
                self.finish_task(index, DownloadStatus::Downloaded)
            }
            TransferEventKind::SaveFailed(message) => {
                let task = &mut self.tasks[index];
                warn!("bundle {} could not be saved: {}", task.bundle.bundle_name, message);
                task.status = TaskStatus::Error;
                task.error_message = Some(message);
                self.finish_task(index, DownloadStatus::Error)
            }
            TransferEventKind::Failed(message) => {
                let task = &mut self.tasks[index];
                warn!("bundle {} failed: {}", task.bundle.bundle_name, message);
                task.status = TaskStatus::Error;
                task.error_message = Some(message);
                self.finish_task(index, DownloadStatus::Failed)
            }
        }
    }

    // Order matters: task state, then cart, then slot release, then registry.
    fn finish_task(&mut self, index: usize, file_status: DownloadStatus) -> Option<Completion> {
        let task = &mut self.tasks[index];
        if let Some(handle) = task.handle.take() {
            handle.complete();
        }
        let keys = task.file_keys.clone();
        let status = task.status;
        let error = task.error_message.clone();

        self.update_cart(&keys, file_status);
        self.active = self.active.saturating_sub(1);
        self.download_next();
        self.update_registry();

        self.emit(QueueEvent::TaskFinished {
            index,
            status,
            error,
        });
        self.emit(QueueEvent::Progress {
            percent: self.overall_percent(),
        });
        self.check_completion()
    }

    /// Cancel one task. Pending tasks are canceled without a transfer; terminal
    /// tasks are left alone.
    pub fn cancel_one(&mut self, index: usize) -> Option<Completion> {
        if self.tasks.get(index)?.status.is_terminal() {
            return None;
        }

        let was_downloading = self.cancel_task(index);
        let keys = self.tasks[index].file_keys.clone();
        self.update_cart(&keys, DownloadStatus::Canceled);
        if was_downloading {
            self.active = self.active.saturating_sub(1);
        }
        self.download_next();

        self.emit(QueueEvent::TaskFinished {
            index,
            status: TaskStatus::Canceled,
            error: None,
        });
        self.emit(QueueEvent::Progress {
            percent: self.overall_percent(),
        });
        self.check_completion()
    }

    /// Cancel every task, clear the list, and emit a single `Canceled`.
    pub fn cancel_all(&mut self) {
        let mut keys = Vec::new();
        for index in 0..self.tasks.len() {
            if !self.tasks[index].status.is_terminal() {
                self.cancel_task(index);
                keys.extend(self.tasks[index].file_keys.iter().cloned());
            }
        }
        if !keys.is_empty() {
            self.update_cart(&keys, DownloadStatus::Canceled);
        }

        info!("canceled all downloads ({} tasks)", self.tasks.len());
        self.tasks.clear();
        self.active = 0;
        self.total_bytes = 0;
        self.completion_signaled = false;
        self.emit(QueueEvent::Canceled);
    }

    /// Put a failed or canceled task back in line.
    pub fn retry(&mut self, index: usize) -> bool {
        let Some(task) = self.tasks.get_mut(index) else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Error | TaskStatus::Canceled) {
            return false;
        }
        debug!("retrying bundle {}", task.bundle.bundle_name);
        task.status = TaskStatus::Pending;
        task.progress_percent = 0;
        task.loaded_bytes = 0;
        task.error_message = None;
        self.completion_signaled = false;
        self.download_next();
        true
    }

    /// Detach the handle and mark canceled. Returns whether it was downloading.
    fn cancel_task(&mut self, index: usize) -> bool {
        let task = &mut self.tasks[index];
        let was_downloading = task.status == TaskStatus::Downloading;
        if let Some(handle) = task.handle.take() {
            handle.unsubscribe();
        }
        task.status = TaskStatus::Canceled;
        task.loaded_bytes = 0;
        task.progress_percent = 0;
        debug!("canceled bundle {}", task.bundle.bundle_name);
        was_downloading
    }

    fn detach_all(&mut self) {
        for task in &mut self.tasks {
            if let Some(handle) = task.handle.take() {
                handle.unsubscribe();
            }
        }
    }

    fn index_of_transfer(&self, transfer: TransferId) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.handle.as_ref().map(TransferHandle::id) == Some(transfer))
    }

    fn check_completion(&mut self) -> Option<Completion> {
        if self.completion_signaled || !self.all_terminal() {
            return None;
        }
        self.completion_signaled = true;
        let completion = Completion {
            all_downloaded: self.all_downloaded(),
        };
        info!(
            "download process complete (all downloaded: {})",
            completion.all_downloaded
        );
        self.emit(QueueEvent::ProcessComplete {
            all_downloaded: completion.all_downloaded,
        });
        Some(completion)
    }

    fn update_cart(&self, keys: &[String], status: DownloadStatus) {
        if keys.is_empty() {
            return;
        }
        let mut cart = self.cart.lock();
        cart.set_download_status(keys, status);
        if let Err(e) = cart.save() {
            warn!("failed to persist cart {}: {}", cart.name(), e);
        }
    }

    fn update_registry(&self) {
        let cart_name = self.cart.lock().name().to_string();
        let percentage = f64::from(self.overall_percent());
        if let Err(e) = self
            .registry
            .lock()
            .update_download_percentage(&cart_name, percentage, None)
        {
            warn!("failed to update cart status for {}: {}", cart_name, e);
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.bus.send(event);
    }

    fn debug_check_bound(&self) {
        debug_assert!(self.active <= self.max_concurrent);
        debug_assert_eq!(
            self.active,
            self.tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Downloading)
                .count()
        );
    }
}

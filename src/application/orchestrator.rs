// End-to-end "download selected files" workflow.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver},
};
use tracing::{debug, info, warn};

use super::bundle_planner::BundlePlanner;
use super::cart::Cart;
use super::cart_status::CartStatusRegistry;
use super::download_queue::{Completion, DownloadQueue, QueueEvent, ZipDownloadTask};
use super::transport::{BundleTransport, TransferEvent};
use crate::api::bundle_url;
use crate::config::AppConfig;
use crate::domain::{
    AppError, CartItem, DownloadCommand, IncludedFile, TaskStatus, WorkflowState,
};
use crate::storage::{StorageChange, StorageSubscription};
use crate::utils::bundle_base_name;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_downloads: usize,
    pub bundle_prefix: String,
    /// Name shown in the cart status registry. Defaults to the cart name.
    pub display_name: Option<String>,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent_downloads: config.max_concurrent_downloads,
            bundle_prefix: config.bundle_prefix.clone(),
            display_name: None,
        }
    }
}

/// What the user is asked to confirm before any transfer starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanConfirmation {
    pub bundle_base_name: String,
    pub bundles: usize,
    pub total_size: u64,
    pub files_count: u64,
    pub warning: Option<String>,
}

struct PendingPlan {
    confirmation: PlanConfirmation,
    tasks: Vec<ZipDownloadTask>,
}

pub struct Orchestrator {
    state: WorkflowState,
    settings: OrchestratorSettings,
    planner: BundlePlanner,
    queue: DownloadQueue,
    cart: Arc<Mutex<Cart>>,
    registry: Arc<Mutex<CartStatusRegistry>>,
    transfer_events: UnboundedReceiver<TransferEvent>,
    storage_events: StorageSubscription,
    pending: Option<PendingPlan>,
    /// Bundles the last run did not download, kept for `retry_failed`.
    leftovers: Vec<ZipDownloadTask>,
    failures: Vec<AppError>,
    completion: Option<Completion>,
    last_error: Option<AppError>,
}

impl Orchestrator {
    /// Wire up the workflow for one cart and mark the cart as in use.
    pub fn new(
        cart: Arc<Mutex<Cart>>,
        registry: Arc<Mutex<CartStatusRegistry>>,
        planner: BundlePlanner,
        transport: Arc<dyn BundleTransport>,
        settings: OrchestratorSettings,
    ) -> Result<Self, AppError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let storage_events = cart.lock().storage().subscribe();
        let queue = DownloadQueue::new(
            settings.max_concurrent_downloads,
            transport,
            tx,
            Arc::clone(&cart),
            Arc::clone(&registry),
        );

        let orchestrator = Self {
            state: WorkflowState::Idle,
            settings,
            planner,
            queue,
            cart,
            registry,
            transfer_events: rx,
            storage_events,
            pending: None,
            leftovers: Vec::new(),
            failures: Vec::new(),
            completion: None,
            last_error: None,
        };

        let cart_name = orchestrator.cart_name();
        orchestrator.registry.lock().update_in_use(
            &cart_name,
            true,
            Some(orchestrator.display_name(&cart_name)),
        )?;
        Ok(orchestrator)
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    pub fn pending_confirmation(&self) -> Option<&PlanConfirmation> {
        self.pending.as_ref().map(|p| &p.confirmation)
    }

    /// Bundles that ended in error or were canceled during the last run.
    pub fn leftover_bundles(&self) -> Vec<&str> {
        self.leftovers
            .iter()
            .map(|t| t.bundle.bundle_name.as_str())
            .collect()
    }

    /// Per-bundle errors from the last run.
    pub fn failures(&self) -> &[AppError] {
        &self.failures
    }

    fn cart_name(&self) -> String {
        self.cart.lock().name().to_string()
    }

    fn display_name<'a>(&'a self, cart_name: &'a str) -> &'a str {
        self.settings.display_name.as_deref().unwrap_or(cart_name)
    }

    fn set_state(&mut self, state: WorkflowState) {
        debug!("workflow {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn invalid(&self, action: &str) -> AppError {
        AppError::InvalidState(format!("cannot {} while {:?}", action, self.state))
    }

    /// Snapshot the selected files and ask the planner for bundles.
    pub async fn request_plan(&mut self) -> Result<PlanConfirmation, AppError> {
        if !matches!(
            self.state,
            WorkflowState::Idle | WorkflowState::Completed | WorkflowState::Canceled
        ) {
            return Err(self.invalid("request a plan"));
        }

        let selected: Vec<CartItem> = self
            .cart
            .lock()
            .get_selected_files()
            .into_iter()
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(AppError::InvalidState("no files selected".to_string()));
        }

        self.last_error = None;
        self.completion = None;
        self.leftovers.clear();
        self.failures.clear();
        self.set_state(WorkflowState::PlanRequested);

        let base_name = bundle_base_name(&self.settings.bundle_prefix);
        info!("requesting plan {} for {} files", base_name, selected.len());

        let outcome = match self.planner.request_plan(&base_name, &selected).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abandon(e)),
        };

        let plan = outcome.plan;
        let mut tasks = Vec::with_capacity(plan.bundles.len());
        for bundle in &plan.bundles {
            let url = match bundle_url(&plan.post_each_to, &bundle.bundle_name) {
                Ok(url) => url,
                Err(e) => {
                    return Err(self.abandon(AppError::PlanContent {
                        status: plan.status.as_str().to_string(),
                        message: e.to_string(),
                        diagnostics: plan.diagnostics.clone(),
                    }))
                }
            };
            let file_keys = self.resolve_keys(&bundle.include_files);
            tasks.push(ZipDownloadTask::new(bundle.clone(), url.as_str(), file_keys));
        }

        let confirmation = PlanConfirmation {
            bundle_base_name: base_name,
            bundles: tasks.len(),
            total_size: plan.size,
            files_count: plan.files_count,
            warning: outcome.warning,
        };
        self.pending = Some(PendingPlan {
            confirmation: confirmation.clone(),
            tasks,
        });
        self.set_state(WorkflowState::PlanReady);
        Ok(confirmation)
    }

    fn resolve_keys(&self, files: &[IncludedFile]) -> Vec<String> {
        let cart = self.cart.lock();
        files
            .iter()
            .filter_map(|file| {
                let key = cart
                    .resolve_key(file.file_path())
                    .or_else(|| file.download_url().and_then(|url| cart.resolve_key(url)));
                if key.is_none() {
                    debug!("bundle file {} is not in the cart", file.file_path());
                }
                key
            })
            .collect()
    }

    fn abandon(&mut self, error: AppError) -> AppError {
        warn!("abandoning download workflow: {}", error);
        self.pending = None;
        self.last_error = Some(error.clone());
        self.set_state(WorkflowState::Canceled);
        error
    }

    /// The user accepted the plan: hand the tasks to the queue and start.
    pub fn confirm(&mut self) -> Result<(), AppError> {
        if self.state != WorkflowState::PlanReady {
            return Err(self.invalid("confirm"));
        }
        let pending = self.pending.take().ok_or_else(|| self.invalid("confirm"))?;
        self.start(pending.tasks);
        Ok(())
    }

    /// The user declined the plan. The queue is never touched.
    pub fn reject(&mut self) -> Result<(), AppError> {
        if self.state != WorkflowState::PlanReady {
            return Err(self.invalid("reject"));
        }
        self.pending = None;
        info!("bundle plan rejected");
        self.set_state(WorkflowState::Canceled);
        Ok(())
    }

    fn start(&mut self, tasks: Vec<ZipDownloadTask>) {
        let empty = tasks.is_empty();
        self.queue.load(tasks);
        self.set_state(WorkflowState::Downloading);
        if empty {
            self.on_complete(Completion {
                all_downloaded: true,
            });
            return;
        }
        let started = self.queue.fill_slots();
        debug!("started {} transfers", started);
    }

    pub fn cancel_all(&mut self) -> Result<(), AppError> {
        match self.state {
            WorkflowState::PlanReady => self.reject(),
            WorkflowState::Downloading => {
                self.queue.cancel_all();
                let cart_name = self.cart_name();
                self.registry.lock().update_download_percentage(
                    &cart_name,
                    0.0,
                    Some(self.display_name(&cart_name)),
                )?;
                self.set_state(WorkflowState::Canceled);
                Ok(())
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    pub fn dispatch(&mut self, command: DownloadCommand) -> Result<(), AppError> {
        debug!("dispatching {:?}", command);
        match command {
            DownloadCommand::CancelAll => self.cancel_all(),
            DownloadCommand::CancelBundle(index) => {
                if self.state != WorkflowState::Downloading {
                    return Err(self.invalid("cancel a bundle"));
                }
                if let Some(completion) = self.queue.cancel_one(index) {
                    self.on_complete(completion);
                }
                Ok(())
            }
            DownloadCommand::RetryBundle(index) => {
                if self.state != WorkflowState::Downloading {
                    return Err(self.invalid("retry a bundle"));
                }
                if self.queue.retry(index) {
                    Ok(())
                } else {
                    Err(AppError::InvalidState(format!(
                        "bundle {} is not failed or canceled",
                        index
                    )))
                }
            }
        }
    }

    pub fn handle_transfer_event(&mut self, event: TransferEvent) {
        if self.state != WorkflowState::Downloading {
            debug!("dropping transfer event while {:?}", self.state);
            return;
        }
        if let Some(completion) = self.queue.handle_transfer_event(event) {
            self.on_complete(completion);
        }
    }

    fn on_complete(&mut self, completion: Completion) {
        // The run is over even when some bundles failed; those stay in `failures`.
        let cart_name = self.cart_name();
        if let Err(e) = self.registry.lock().update_download_percentage(
            &cart_name,
            100.0,
            Some(self.display_name(&cart_name)),
        ) {
            warn!("failed to record completion for {}: {}", cart_name, e);
        }

        self.failures = self
            .queue
            .tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Error)
            .map(|t| AppError::Download {
                bundle: t.bundle.bundle_name.clone(),
                message: t.error_message.clone().unwrap_or_default(),
            })
            .collect();
        self.leftovers = self
            .queue
            .tasks()
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Error | TaskStatus::Canceled))
            .map(|t| ZipDownloadTask::new(t.bundle.clone(), t.url.clone(), t.file_keys.clone()))
            .collect();
        self.queue.reset();
        self.completion = Some(completion);
        info!(
            "downloads finished for {} ({} bundles left over)",
            cart_name,
            self.leftovers.len()
        );
        self.set_state(WorkflowState::Completed);
    }

    /// Queue again every bundle the last run did not download.
    pub fn retry_failed(&mut self) -> Result<usize, AppError> {
        if self.state != WorkflowState::Completed || self.leftovers.is_empty() {
            return Err(self.invalid("retry failed bundles"));
        }
        let tasks = std::mem::take(&mut self.leftovers);
        self.failures.clear();
        let count = tasks.len();
        self.completion = None;
        self.start(tasks);
        Ok(count)
    }

    /// Restore the cart or the registry after another tab changed them.
    pub fn on_storage_change(&mut self, change: &StorageChange) {
        if let Err(e) = self.cart.lock().on_storage_change(change) {
            warn!("failed to restore cart: {}", e);
        }
        if let Err(e) = self.registry.lock().on_storage_change(change) {
            warn!("failed to restore cart status: {}", e);
        }
    }

    /// Drive transfers until the workflow completes or is canceled. Commands
    /// from `commands` are applied between transfer events.
    pub async fn run(
        &mut self,
        commands: &mut UnboundedReceiver<DownloadCommand>,
    ) -> WorkflowState {
        let mut commands_open = true;
        while self.state == WorkflowState::Downloading {
            tokio::select! {
                Some(event) = self.transfer_events.recv() => {
                    self.handle_transfer_event(event);
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if let Err(e) = self.dispatch(command) {
                            warn!("command {:?} rejected: {}", command, e);
                        }
                    }
                    None => commands_open = false,
                },
                Some(change) = self.storage_events.recv() => {
                    self.on_storage_change(&change);
                }
            }
        }
        self.state
    }

    /// Mark the cart as no longer in use so cleanup may collect it.
    pub fn close(&mut self) -> Result<(), AppError> {
        if self.state == WorkflowState::Downloading {
            self.cancel_all()?;
        }
        let cart_name = self.cart_name();
        self.registry.lock().update_in_use(&cart_name, false, None)?;
        Ok(())
    }

    /// Forget the persisted cart and release its registry entry.
    pub fn discard_cart(&mut self) -> Result<(), AppError> {
        self.close()?;
        self.cart.lock().forget()?;
        Ok(())
    }
}

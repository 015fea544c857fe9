pub mod bundle_planner;
pub mod cart;
pub mod cart_status;
pub mod download_queue;
pub mod orchestrator;
pub mod transport;

pub use bundle_planner::{BundlePlanner, PlanOutcome, PlanService};
pub use cart::{Cart, SubscriptionId};
pub use cart_status::CartStatusRegistry;
pub use download_queue::{Completion, DownloadQueue, QueueEvent, ZipDownloadTask};
pub use orchestrator::{Orchestrator, OrchestratorSettings, PlanConfirmation};
pub use transport::{
    BlobSink, BundleTransport, DirectorySink, HttpTransport, TransferEvent, TransferEventKind,
    TransferHandle, TransferId, TransferRequest,
};

pub mod command;
pub mod error;
pub mod model;

pub use command::{CartCommand, DownloadCommand};
pub use error::{AppError, PlanDiagnostics};
pub use model::{
    item_key, Bundle, BundlePlan, CartItem, CartStatusEntry, DownloadStatus, FileData,
    IncludedFile, PlanStatus, TaskStatus, WorkflowState,
};

/// Bulk cart edits that other components can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartCommand {
    RemoveSelected,
    RemoveDownloaded,
    SelectAll,
    DeselectAll,
}

/// Control requests for a running download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadCommand {
    CancelAll,
    CancelBundle(usize),
    RetryBundle(usize),
}

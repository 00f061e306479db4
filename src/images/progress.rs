//! Phase-tagged progress events for image pulls.

/// Emitted by both image backends while a pull runs. Consumers (the CLI)
/// render these; backends never print.
#[derive(Debug, Clone)]
pub enum PullEvent {
    /// Pull accepted; `total` is the layer count (OCI) or 1 (cloudimg).
    Start { total: usize },
    /// One OCI layer finished converting (or was found cached).
    LayerDone {
        index: usize,
        total: usize,
        digest: String,
    },
    /// Cloud-image download progress. `total` is 0 when unknown.
    Download { done: u64, total: u64 },
    /// qcow2 conversion started.
    Convert,
    /// Index update started.
    Commit,
    /// Pull finished (including "already up to date").
    Done,
}

/// Callback invoked with each event. Backends call it from async context;
/// it must not block.
pub type Tracker = Box<dyn Fn(PullEvent) + Send + Sync>;

/// A tracker that ignores everything, for callers without a UI.
pub fn null_tracker() -> Tracker {
    Box::new(|_| {})
}

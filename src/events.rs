use std::path::PathBuf;
use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly is not acceptable for
/// production. Callers provide an implementation that forwards these events
/// to `tracing`, `log`, metrics, or custom sinks.
pub trait EventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

/// Structured events emitted by the storage core.
#[derive(Debug, Clone)]
pub enum Event {
    StorageOpened {
        volumes: usize,
        active_index: usize,
    },
    StorageClosed,

    /// The active page had unpublished entries rolled back / re-published
    /// during startup.
    PageRestored {
        page_id: u32,
        entries: u32,
    },

    CheckpointMerged {
        sequence: usize,
    },

    VolumeAdvanced {
        old_page_id: u32,
        new_page_id: u32,
    },
    VolumeRecycled {
        path: PathBuf,
    },

    FlushFailed {
        error: String,
    },
    SearchFailed {
        code: u32,
    },
}

#[derive(Debug)]
pub struct NoopListener;

impl EventListener for NoopListener {
    #[inline]
    fn on_event(&self, _event: Event) {}
}

pub fn noop_listener() -> Arc<dyn EventListener> {
    Arc::new(NoopListener)
}

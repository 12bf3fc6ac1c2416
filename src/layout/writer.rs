//! Debounced layout writer
//!
//! A single task owns the in-memory layout. Mutations arrive as messages and
//! re-arm one timer; the file is written once the layout has been quiet for
//! the debounce period. Writes happen inside the task, one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{LayoutError, LayoutStore, PersistedCategory, PersistedLayout, PersistedNode, Position};

/// Destination for layout snapshots
pub trait LayoutSink: Send + Sync + 'static {
    fn save(&self, layout: &PersistedLayout) -> Result<(), LayoutError>;
}

impl LayoutSink for LayoutStore {
    fn save(&self, layout: &PersistedLayout) -> Result<(), LayoutError> {
        self.save_layout(layout)
    }
}

type Mutation = Box<dyn FnOnce(&mut PersistedLayout) + Send>;

enum LayoutCommand {
    Mutate(Mutation),
    Snapshot(oneshot::Sender<PersistedLayout>),
    Flush(oneshot::Sender<bool>),
}

/// Handle to the layout writer task
#[derive(Clone)]
pub struct LayoutWriter {
    tx: mpsc::UnboundedSender<LayoutCommand>,
}

impl LayoutWriter {
    /// Start the writer task with `initial` as the current layout
    pub fn spawn(sink: Arc<dyn LayoutSink>, initial: PersistedLayout, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(sink, initial, debounce, rx));
        Self { tx }
    }

    fn mutate(&self, mutation: impl FnOnce(&mut PersistedLayout) + Send + 'static) {
        if self.tx.send(LayoutCommand::Mutate(Box::new(mutation))).is_err() {
            warn!("Layout writer stopped; dropping layout change");
        }
    }

    pub fn upsert_node(&self, node: PersistedNode) {
        self.mutate(move |layout| layout.upsert_node(node));
    }

    /// Modify a saved node in place; unknown ids are ignored
    pub fn update_node(
        &self,
        node_id: impl Into<String>,
        update: impl FnOnce(&mut PersistedNode) + Send + 'static,
    ) {
        let node_id = node_id.into();
        self.mutate(move |layout| {
            if let Some(node) = layout.node_mut(&node_id) {
                update(node);
            }
        });
    }

    pub fn remove_node(&self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        self.mutate(move |layout| {
            layout.remove_node(&node_id);
        });
    }

    pub fn set_positions(&self, positions: HashMap<String, Position>) {
        self.mutate(move |layout| layout.set_positions(&positions));
    }

    pub fn set_categories(&self, categories: Vec<PersistedCategory>) {
        self.mutate(move |layout| layout.categories = categories);
    }

    /// Fold restored nodes and categories into the current layout
    pub fn merge(&self, restored: PersistedLayout) {
        self.mutate(move |layout| layout.merge(restored));
    }

    /// Current in-memory layout, including unsaved changes
    pub async fn snapshot(&self) -> PersistedLayout {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LayoutCommand::Snapshot(reply)).is_err() {
            return PersistedLayout::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Write any pending change now. Returns false if the write failed.
    pub async fn flush(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LayoutCommand::Flush(reply)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

async fn write(sink: &Arc<dyn LayoutSink>, layout: &PersistedLayout) -> bool {
    let sink = Arc::clone(sink);
    let layout = layout.clone();
    let result = tokio::task::spawn_blocking(move || sink.save(&layout)).await;

    match result {
        Ok(Ok(())) => {
            debug!("Layout saved");
            true
        }
        Ok(Err(e)) => {
            warn!("Failed to save layout, will retry: {}", e);
            false
        }
        Err(e) => {
            warn!("Layout save task failed, will retry: {}", e);
            false
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run(
    sink: Arc<dyn LayoutSink>,
    mut layout: PersistedLayout,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<LayoutCommand>,
) {
    // Set while there are unsaved changes
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(LayoutCommand::Mutate(mutation)) => {
                    mutation(&mut layout);
                    deadline = Some(Instant::now() + debounce);
                }
                Some(LayoutCommand::Snapshot(reply)) => {
                    let _ = reply.send(layout.clone());
                }
                Some(LayoutCommand::Flush(reply)) => {
                    let saved = deadline.is_none() || write(&sink, &layout).await;
                    if saved {
                        deadline = None;
                    }
                    let _ = reply.send(saved);
                }
                None => {
                    if deadline.is_some() {
                        write(&sink, &layout).await;
                    }
                    break;
                }
            },
            _ = wait_until(deadline), if deadline.is_some() => {
                deadline = if write(&sink, &layout).await {
                    None
                } else {
                    Some(Instant::now() + debounce)
                };
            }
        }
    }

    debug!("Layout writer stopped");
}

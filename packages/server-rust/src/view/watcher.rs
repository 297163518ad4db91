//! View lifecycle dispatch.
//!
//! Components that care about configuration epochs implement
//! [`ViewLifecycleListener`]; a single [`ViewWatcher`] routes
//! created/frozen/finalized events to every subscriber, replacing the
//! per-role virtual-method dispatch of classic designs with one capability
//! trait.
//!
//! Views are kept in a versioned map; old views are retired by the watcher
//! only once finalized, and callers that still hold an `Arc<View>` keep it
//! alive for their in-flight operations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tracing::info;

use crate::view::View;

// ---------------------------------------------------------------------------
// FinalizedView
// ---------------------------------------------------------------------------

/// A view together with the final metalog position of each of its phylogs.
///
/// Components drain their per-phylog state up to these positions; anything
/// beyond them is completed with a retry signal.
#[derive(Debug)]
pub struct FinalizedView {
    view: Arc<View>,
    final_metalog_positions: HashMap<u32, u32>,
}

impl FinalizedView {
    #[must_use]
    pub fn new(view: Arc<View>, final_metalog_positions: HashMap<u32, u32>) -> Self {
        Self {
            view,
            final_metalog_positions,
        }
    }

    #[must_use]
    pub fn view(&self) -> &Arc<View> {
        &self.view
    }

    /// Final metalog position for `logspace_id`, zero if the phylog never
    /// produced a metalog entry.
    #[must_use]
    pub fn final_metalog_position(&self, logspace_id: u32) -> u32 {
        self.final_metalog_positions
            .get(&logspace_id)
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// ViewLifecycleListener
// ---------------------------------------------------------------------------

/// Capability implemented by every role that allocates per-view state.
pub trait ViewLifecycleListener: Send + Sync {
    /// A new view was installed; allocate per-phylog state and start serving.
    fn on_view_created(&self, view: &Arc<View>);

    /// The view is frozen; stop accepting new local appends on it.
    fn on_view_frozen(&self, view: &Arc<View>);

    /// The view is finalized; drain and fail stranded operations.
    fn on_view_finalized(&self, finalized: &Arc<FinalizedView>);
}

// ---------------------------------------------------------------------------
// ViewWatcher
// ---------------------------------------------------------------------------

/// Routes view lifecycle events from the membership oracle to subscribers.
pub struct ViewWatcher {
    current: ArcSwapOption<View>,
    views: RwLock<BTreeMap<u16, Arc<View>>>,
    listeners: RwLock<Vec<Arc<dyn ViewLifecycleListener>>>,
}

impl Default for ViewWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::const_empty(),
            views: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a lifecycle listener. Listeners added after a view is
    /// installed do not receive a retroactive `on_view_created`.
    pub fn subscribe(&self, listener: Arc<dyn ViewLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    /// Current view, lock-free.
    #[must_use]
    pub fn current_view(&self) -> Option<Arc<View>> {
        self.current.load_full()
    }

    /// A retained view by id.
    #[must_use]
    pub fn get_view(&self, view_id: u16) -> Option<Arc<View>> {
        self.views.read().get(&view_id).cloned()
    }

    /// Installs a new view and dispatches `on_view_created`.
    pub fn install_view(&self, view: Arc<View>) {
        info!(view_id = view.id(), "install view");
        self.views.write().insert(view.id(), Arc::clone(&view));
        self.current.store(Some(Arc::clone(&view)));
        for listener in self.listeners.read().iter() {
            listener.on_view_created(&view);
        }
    }

    /// Freezes a view and dispatches `on_view_frozen`.
    pub fn freeze_view(&self, view_id: u16) {
        let Some(view) = self.get_view(view_id) else {
            return;
        };
        info!(view_id, "freeze view");
        for listener in self.listeners.read().iter() {
            listener.on_view_frozen(&view);
        }
    }

    /// Finalizes a view, dispatches `on_view_finalized`, and retires it
    /// from the versioned map.
    pub fn finalize_view(&self, finalized: FinalizedView) {
        let view_id = finalized.view().id();
        info!(view_id, "finalize view");
        let finalized = Arc::new(finalized);
        for listener in self.listeners.read().iter() {
            listener.on_view_finalized(&finalized);
        }
        self.views.write().remove(&view_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::sync::{Arc, OnceLock};

use easel_core::ModelLike;

/// Write-once slot for the loaded model, shared by every handler.
///
/// Empty until startup finishes loading; handlers treat an empty slot as
/// "not ready".
#[derive(Clone, Default)]
pub struct AppState {
    model: Arc<OnceLock<Arc<dyn ModelLike>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Arc<dyn ModelLike>) -> Self {
        let state = Self::new();
        // A fresh slot is always empty.
        let _ = state.install(model);
        state
    }

    /// Fills the slot. Fails with the rejected model if it was already filled.
    pub fn install(&self, model: Arc<dyn ModelLike>) -> Result<(), Arc<dyn ModelLike>> {
        self.model.set(model)
    }

    pub fn model(&self) -> Option<Arc<dyn ModelLike>> {
        self.model.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }
}

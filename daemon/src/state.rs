use std::sync::Arc;

use weft_core::Manager;

pub struct AppState {
    pub manager: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

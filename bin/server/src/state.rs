use std::sync::Arc;

use session_core::{Dispatcher, SessionRegistry, Store, SyncHub};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<SessionRegistry>,
    pub sync_hub: Arc<SyncHub>,
    pub dispatcher: Arc<Dispatcher>,
}

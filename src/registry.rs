use crate::orchestrator::{CancelHandle, ProgressView, Services, UploadOrchestrator};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use tracing::info;
use uuid::Uuid;

/// One live session: the orchestrator behind its own lock, plus the pieces that
/// must stay reachable while an action holds that lock.
#[derive(Clone)]
pub struct SessionEntry {
    orchestrator: Arc<Mutex<UploadOrchestrator>>,
    cancel: CancelHandle,
    progress: watch::Receiver<ProgressView>,
}

impl SessionEntry {
    /// Exclusive access for one action. `None` while another action runs.
    pub fn try_claim(&self) -> Option<OwnedMutexGuard<UploadOrchestrator>> {
        self.orchestrator.clone().try_lock_owned().ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn progress(&self) -> ProgressView {
        self.progress.borrow().clone()
    }
}

/// Live sessions addressable by id.
#[derive(Clone)]
pub struct SessionRegistry {
    services: Services,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn create(&self) -> Uuid {
        let orchestrator = UploadOrchestrator::new(self.services.clone());
        let id = orchestrator.id();
        let entry = SessionEntry {
            cancel: orchestrator.cancel_handle(),
            progress: orchestrator.subscribe(),
            orchestrator: Arc::new(Mutex::new(orchestrator)),
        };
        self.sessions.write().await.insert(id, entry);
        info!(target = "shoppable.bridge", session_id = %id, "session_created");
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<SessionEntry> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Drops the session, cancelling whatever it was doing.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(entry) => {
                entry.cancel();
                info!(target = "shoppable.bridge", session_id = %id, "session_removed");
                true
            }
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

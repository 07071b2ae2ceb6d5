use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::MessageKind;

/// Facts other components report about a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ViewerJoined { viewer_key: String },
    ViewerLeft { viewer_key: String, watch_time: Duration },
    MessagePublished { kind: MessageKind },
    DonationSettled { gross: i64 },
}

pub trait SessionObserver: Send + Sync {
    fn observe(&self, session_id: Uuid, event: &SessionEvent);
}

/// Fan-out point for session events; cheap to clone
#[derive(Clone, Default)]
pub struct SessionEventSink {
    observers: Arc<Vec<Arc<dyn SessionObserver>>>,
}

impl SessionEventSink {
    pub fn new(observers: Vec<Arc<dyn SessionObserver>>) -> Self {
        Self {
            observers: Arc::new(observers),
        }
    }

    pub fn emit(&self, session_id: Uuid, event: SessionEvent) {
        for observer in self.observers.iter() {
            observer.observe(session_id, &event);
        }
    }
}

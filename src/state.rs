use std::sync::Arc;

use crate::config::AppConfig;
use crate::gateway::GatewayState;
use crate::media::room::RoomRegistry;
use crate::media::workers::WorkerPool;
use crate::services::jobs_client::JobsClient;
use crate::services::locks::LockService;
use crate::services::msgqueue::MessageQueueManager;
use crate::services::outbox::Outbox;
use crate::services::sessions::SessionRegistry;
use crate::sidetap::SideTapManager;
use crate::sidetap::store::TranscriptStore;

/// Everything a handler needs, constructed once in `main` and injected.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub redis: redis::aio::ConnectionManager,
    pub gateway: Arc<GatewayState>,
    pub sessions: Arc<SessionRegistry>,
    pub locks: Arc<LockService>,
    pub queues: Arc<MessageQueueManager>,
    pub outbox: Arc<Outbox>,
    pub jobs: Arc<JobsClient>,
    pub workers: Arc<WorkerPool>,
    pub rooms: Arc<RoomRegistry>,
    pub sidetap: Arc<SideTapManager>,
    pub transcripts: Arc<TranscriptStore>,
}

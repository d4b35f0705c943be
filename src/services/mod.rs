pub mod jobs_client;
pub mod locks;
pub mod msgqueue;
pub mod outbox;
pub mod sessions;

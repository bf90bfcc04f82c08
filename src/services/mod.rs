// Service exports
pub mod lease;
pub mod memory;
pub mod notifier;
pub mod postgres;
pub mod traits;

pub use lease::RedisLease;
pub use memory::{InMemoryLock, InMemoryStore, RecordingNotifier};
pub use notifier::{LogNotifier, WebhookNotifier};
pub use postgres::PostgresStore;
pub use traits::{
    HistoryStore, Lease, LockError, MatchSink, NotifyError, Notifier, ParticipantSource, RoundLock, StoreError,
};

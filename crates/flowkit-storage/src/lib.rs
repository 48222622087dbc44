pub mod backends;
pub mod queue;
pub mod store;
pub mod topic_bus;

pub use backends::file::{FileQueue, FileStore};
pub use backends::memory::{InMemoryQueue, InMemoryStore, InMemoryTopicBus};
pub use backends::postgres::{PostgresQueue, PostgresStore, PostgresTopicBus};
pub use queue::{
    EnqueueRequest, FailOutcome, Job, JobCounts, JobFilter, JobOptions, JobState, Queue, QueueError, QueueEventKind,
    ScheduleWhen,
};
pub use store::{deep_merge, increment_path, IndexReadQuery, IndexRecord, ReadOrder, Store, StoreError, StreamReadOptions};
pub use topic_bus::{Subscription, TopicBus, TopicBusError, TopicEvent};

//! Cross-interface integration test against the in-memory backend: a job
//! claim/complete cycle alongside the event stream and index writes that
//! would accompany it in the full engine.

use flowkit_core::event::{event_types, NewEvent};
use flowkit_storage::{EnqueueRequest, InMemoryQueue, InMemoryStore, InMemoryTopicBus, Queue, Store, StreamReadOptions, TopicBus};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn enqueue_claim_complete_mirrors_into_stream_and_topic() {
    let queue = InMemoryQueue::new();
    let store = InMemoryStore::new();
    let bus = InMemoryTopicBus::new();
    let run_id = Uuid::new_v4();
    let subject = format!("flowkit:flow:run:{run_id}");
    let topic = format!("flowkit:stream:flow:events:{run_id}");

    let mut subscription = bus.subscribe(&topic).await.unwrap();

    queue.start_processing("sample:entry").await.unwrap();
    queue
        .enqueue("sample:entry", EnqueueRequest::new("entry", json!({"flowId": run_id, "flowName": "sample"})))
        .await
        .unwrap();

    let claimed = queue.claim_jobs("sample:entry", &[], 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let job = &claimed[0];

    let started = store
        .stream_append(&subject, NewEvent::new(event_types::STEP_STARTED, run_id, "sample").with_step("entry", "stub-step-id", 1))
        .await
        .unwrap();
    bus.publish(&topic, json!({"type": started.event_type, "id": started.id})).await.unwrap();

    queue.complete_job("sample:entry", &job.id).await.unwrap();
    let completed = store
        .stream_append(&subject, NewEvent::new(event_types::STEP_COMPLETED, run_id, "sample").with_step("entry", "stub-step-id", 1))
        .await
        .unwrap();
    bus.publish(&topic, json!({"type": completed.event_type, "id": completed.id})).await.unwrap();

    let events = store.stream_read(&subject, StreamReadOptions::default()).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, event_types::STEP_STARTED);
    assert_eq!(events[1].event_type, event_types::STEP_COMPLETED);

    let first = subscription.recv().await.unwrap();
    assert_eq!(first.payload["type"], json!(event_types::STEP_STARTED));
    let second = subscription.recv().await.unwrap();
    assert_eq!(second.payload["type"], json!(event_types::STEP_COMPLETED));

    let counts = queue.get_job_counts("sample:entry").await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn index_update_with_retry_survives_repeated_writers() {
    let store = InMemoryStore::new();
    store.index_add("flowkit:flows", "sample", 0.0, json!({"name": "sample"})).await.unwrap();

    store
        .index_update_with_retry("flowkit:flows", "sample", json!({"stats": {"totalRuns": 1}}), 5)
        .await
        .unwrap();
    store
        .index_update_with_retry("flowkit:flows", "sample", json!({"stats": {"totalRuns": 2}}), 5)
        .await
        .unwrap();

    let record = store.index_get("flowkit:flows", "sample").await.unwrap().unwrap();
    assert_eq!(record.metadata["stats"]["totalRuns"], json!(2));
    assert_eq!(record.metadata["name"], json!("sample"));
}


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diagplane::error::PlaneError;
use diagplane::paging::PagingRequest;
use diagplane::scheduler::FileType;
use diagplane::worker::{
    CapacityError, ElasticState, HeartbeatReceiver, HeartbeatReport, WorkerId, WorkerRecord,
    WorkerRegistry,
};
use test_harness::assert_eventually;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn registry() -> WorkerRegistry {
    WorkerRegistry::new(chrono::Duration::seconds(30), chrono::Duration::seconds(60))
}

fn worker(id: &str, total: u64) -> WorkerRecord {
    WorkerRecord::new_static(id, format!("{}:8102", id), format!("/srv/{}", id), total)
}

#[tokio::test]
async fn test_select_prefers_most_available_space() {
    let registry = registry();
    registry.register(worker("a", 100)).await.unwrap();
    registry.register(worker("b", 50)).await.unwrap();

    assert_eq!(
        registry.select(Some(FileType::HeapDump), 80).await.unwrap(),
        WorkerId::from("a")
    );
    assert_eq!(
        registry.select(Some(FileType::HeapDump), 60).await.unwrap(),
        WorkerId::from("a")
    );

    registry.reserve(&WorkerId::from("a"), 80).await.unwrap();
    assert_eq!(
        registry.select(Some(FileType::HeapDump), 30).await.unwrap(),
        WorkerId::from("b")
    );
    assert!(matches!(
        registry.select(Some(FileType::HeapDump), 60).await,
        Err(CapacityError::NoCapableWorker { required: 60, .. })
    ));
}

#[tokio::test]
async fn test_select_breaks_ties_by_heartbeat_then_id() {
    let registry = registry();
    let now = Utc::now();
    registry
        .register(worker("b", 100).with_last_modified_time(now))
        .await
        .unwrap();
    registry
        .register(worker("c", 100).with_last_modified_time(now - chrono::Duration::seconds(5)))
        .await
        .unwrap();
    assert_eq!(registry.select(None, 10).await.unwrap(), WorkerId::from("b"));

    registry
        .register(worker("a", 100).with_last_modified_time(now))
        .await
        .unwrap();
    assert_eq!(registry.select(None, 10).await.unwrap(), WorkerId::from("a"));

    let excluded = HashSet::from([WorkerId::from("a")]);
    assert_eq!(
        registry.select_excluding(None, 10, &excluded).await.unwrap(),
        WorkerId::from("b")
    );
}

#[tokio::test]
async fn test_concurrent_reservations_never_overcommit() {
    let registry = Arc::new(registry());
    registry.register(worker("w1", 100)).await.unwrap();
    let id = WorkerId::from("w1");

    let first = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.reserve(&id, 80).await })
    };
    let second = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.reserve(&id, 80).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CapacityError::InsufficientSpace { available: 20, requested: 80, .. }))));

    let record = registry.get_worker(&id).await.unwrap();
    assert_eq!(record.available_space, 20);
    assert_eq!(record.reserved, 80);
}

#[tokio::test]
async fn test_release_checks_accounting() {
    let registry = registry();
    registry.register(worker("w1", 100)).await.unwrap();
    let id = WorkerId::from("w1");

    registry.reserve(&id, 40).await.unwrap();
    assert!(matches!(
        registry.release(&id, 50).await,
        Err(PlaneError::SanityCheck(_))
    ));
    registry.release(&id, 40).await.unwrap();
    assert_eq!(registry.get_worker(&id).await.unwrap().available_space, 100);

    assert!(matches!(
        registry.release(&WorkerId::from("ghost"), 1).await,
        Err(PlaneError::WorkerNotFound(_))
    ));
    assert!(matches!(
        registry.reserve(&WorkerId::from("ghost"), 1).await,
        Err(CapacityError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn test_register_rejects_duplicates_and_bad_capacity() {
    let registry = registry();
    registry.register(worker("w1", 100)).await.unwrap();
    assert!(matches!(
        registry.register(worker("w1", 100)).await,
        Err(PlaneError::IllegalArgument(_))
    ));
    assert!(matches!(
        registry
            .register(worker("w2", 100).with_available_space(101))
            .await,
        Err(PlaneError::IllegalArgument(_))
    ));
}

#[tokio::test]
async fn test_heartbeat_refreshes_capacity() {
    let registry = registry();
    registry.register(worker("w1", 100)).await.unwrap();
    let id = WorkerId::from("w1");
    registry.reserve(&id, 30).await.unwrap();

    registry
        .heartbeat(&HeartbeatReport::new(id.clone(), 90, 200))
        .await
        .unwrap();
    let record = registry.get_worker(&id).await.unwrap();
    assert_eq!(record.total_space, 200);
    assert_eq!(record.available_space, 60);

    assert!(matches!(
        registry
            .heartbeat(&HeartbeatReport::new(id.clone(), 300, 200))
            .await,
        Err(PlaneError::IllegalArgument(_))
    ));
    assert!(matches!(
        registry
            .heartbeat(&HeartbeatReport::new(WorkerId::from("ghost"), 1, 2))
            .await,
        Err(PlaneError::WorkerNotFound(_))
    ));
}

#[tokio::test]
async fn test_stale_workers_are_reported_and_skipped() {
    let registry = registry();
    let now = Utc::now();
    registry
        .register(worker("old", 500).with_last_modified_time(now - chrono::Duration::seconds(90)))
        .await
        .unwrap();
    registry.register(worker("new", 100)).await.unwrap();

    assert_eq!(registry.stale_workers(now).await, vec![WorkerId::from("old")]);
    assert_eq!(registry.select(None, 10).await.unwrap(), WorkerId::from("new"));

    // A heartbeat makes it selectable again
    registry
        .heartbeat(&HeartbeatReport::new(WorkerId::from("old"), 500, 500))
        .await
        .unwrap();
    assert_eq!(registry.select(None, 10).await.unwrap(), WorkerId::from("old"));
}

#[tokio::test]
async fn test_elastic_lifecycle() {
    let registry = registry();
    let id = registry.provision_elastic(Some(FileType::GcLog)).await;
    assert!(id.as_str().starts_with("elastic-"));

    assert_eq!(registry.pending_elastic(Some(FileType::GcLog)).await, Some(id.clone()));
    assert_eq!(registry.pending_elastic(Some(FileType::HeapDump)).await, None);
    assert!(matches!(
        registry.reserve(&id, 0).await,
        Err(CapacityError::NotReady(_))
    ));
    assert!(registry.select(Some(FileType::GcLog), 0).await.is_err());

    // Heartbeats while provisioning do not make it ready
    registry
        .heartbeat(&HeartbeatReport::new(id.clone(), 400, 400))
        .await
        .unwrap();
    assert_eq!(
        registry.get_worker(&id).await.unwrap().elastic_state(),
        Some(ElasticState::Provisioning)
    );

    registry
        .mark_ready(&id, "10.0.0.7:8102", "/srv/elastic", 1000)
        .await
        .unwrap();
    assert_eq!(registry.pending_elastic(Some(FileType::GcLog)).await, None);
    assert_eq!(registry.select(Some(FileType::GcLog), 500).await.unwrap(), id);
    registry.reserve(&id, 500).await.unwrap();

    assert!(registry.mark_ready(&id, "x", "/srv/x", 1).await.is_err());

    registry.mark_unreachable(&id).await.unwrap();
    assert!(matches!(
        registry.reserve(&id, 1).await,
        Err(CapacityError::Unreachable(_))
    ));
    // Capacity held before the worker went away can still be returned
    registry.release(&id, 500).await.unwrap();
}

#[tokio::test]
async fn test_static_workers_cannot_change_elastic_state() {
    let registry = registry();
    registry.register(worker("w1", 100)).await.unwrap();
    let id = WorkerId::from("w1");
    assert!(registry.mark_ready(&id, "x", "/srv/x", 1).await.is_err());
    assert!(registry.mark_unreachable(&id).await.is_err());
}

#[tokio::test]
async fn test_expire_provisioning() {
    let registry = registry();
    let id = registry.provision_elastic(None).await;

    assert!(registry.expire_provisioning(Utc::now()).await.is_empty());

    let later = Utc::now() + chrono::Duration::seconds(120);
    assert_eq!(registry.expire_provisioning(later).await, vec![id.clone()]);
    assert_eq!(
        registry.get_worker(&id).await.unwrap().elastic_state(),
        Some(ElasticState::Unreachable)
    );
    // Already expired workers are not reported twice
    assert!(registry.expire_provisioning(later).await.is_empty());
}

#[tokio::test]
async fn test_list_workers_orders_by_id() {
    let registry = registry();
    for id in ["w3", "w1", "w2"] {
        registry.register(worker(id, 100)).await.unwrap();
    }

    let page = registry
        .list_workers(PagingRequest::new(1, 2).unwrap())
        .await;
    assert_eq!(page.total_size, 3);
    let ids: Vec<_> = page.data.iter().map(|w| w.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["w1", "w2"]);
}

#[tokio::test]
async fn test_heartbeat_receiver_applies_reports() {
    let registry = Arc::new(registry());
    registry.register(worker("w1", 100)).await.unwrap();

    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let receiver = HeartbeatReceiver::new(registry.clone());
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { receiver.run(rx, shutdown).await })
    };

    // Unknown workers are logged and skipped
    tx.send(HeartbeatReport::new(WorkerId::from("ghost"), 1, 1))
        .await
        .unwrap();
    tx.send(HeartbeatReport::new(WorkerId::from("w1"), 70, 150))
        .await
        .unwrap();

    assert_eventually(
        || {
            let registry_ref = &registry;
            async move {
                registry_ref
                    .get_worker(&WorkerId::from("w1"))
                    .await
                    .map(|w| w.total_space == 150 && w.available_space == 70)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "heartbeat was not applied",
    )
    .await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}

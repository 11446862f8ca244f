
use std::sync::Arc;
use std::time::Duration;

use diagplane::config::{PlaneConfig, RetryPolicy};
use diagplane::error::ErrorCode;
use diagplane::ingress::{Ingress, IngressCommand, IngressReply};
use diagplane::node::ControlPlane;
use diagplane::scheduler::JobState;
use diagplane::transfer::TransferStrategy;
use diagplane::worker::{ElasticState, LoggingLauncher, WorkerId, WorkerRecord};
use test_harness::{assert_eventually, FakeProvisioner};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn plane(config: PlaneConfig) -> ControlPlane {
    let transfers = TransferStrategy::from_config(&config.transfer);
    ControlPlane::new(
        config,
        transfers,
        Arc::new(LoggingLauncher),
        Some(Arc::new(FakeProvisioner::default())),
    )
}

async fn job_state(ingress: &Ingress, job_id: Uuid) -> JobState {
    match ingress
        .handle(IngressCommand::Status { job_id })
        .await
        .unwrap()
    {
        IngressReply::Job { state, .. } => state,
        other => panic!("unexpected reply {:?}", other),
    }
}

#[tokio::test]
async fn test_upload_job_lifecycle_over_commands() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("uploads")).unwrap();
    std::fs::write(root.path().join("uploads/gc.log"), b"[gc] pause").unwrap();

    let plane = plane(PlaneConfig::default().with_retry(RetryPolicy::immediate(2)));
    plane
        .registry
        .register(WorkerRecord::new_static("w1", "localhost", root.path(), 4096))
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let ingress = Ingress::new(&plane, plane.spawn_heartbeat_receiver(shutdown.clone()));

    let file_id = match ingress
        .handle_line(r#"{"command":"ingest","way":"UPLOAD","path":"uploads/gc.log","size":10}"#)
        .await
    {
        IngressReply::FileIngested { file_id } => file_id,
        other => panic!("unexpected reply {:?}", other),
    };

    let submit = format!(
        r#"{{"command":"submit","job_type":"GCLOG_ANALYSIS","file_id":"{}"}}"#,
        file_id
    );
    let job_id = match ingress.handle_line(&submit).await {
        IngressReply::JobSubmitted { job_id } => job_id,
        other => panic!("unexpected reply {:?}", other),
    };

    assert_eventually(
        || {
            let ingress_ref = &ingress;
            async move { job_state(ingress_ref, job_id).await == JobState::Running }
        },
        Duration::from_secs(5),
        "submitted job was not dispatched",
    )
    .await;

    let complete = format!(r#"{{"command":"complete","job_id":"{}"}}"#, job_id);
    assert_eq!(
        ingress.handle_line(&complete).await,
        IngressReply::Job {
            job_id,
            state: JobState::Succeeded,
            worker_id: Some(WorkerId::from("w1")),
            error: None,
        }
    );

    // A second report is refused
    assert!(matches!(
        ingress.handle_line(&complete).await,
        IngressReply::Error {
            code: ErrorCode::IllegalArgument,
            ..
        }
    ));
    shutdown.cancel();
}

#[tokio::test]
async fn test_heartbeat_command_reaches_registry() {
    let plane = plane(PlaneConfig::default());
    plane
        .registry
        .register(WorkerRecord::new_static("w1", "localhost", "/srv/w1", 100))
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let ingress = Ingress::new(&plane, plane.spawn_heartbeat_receiver(shutdown.clone()));

    assert_eq!(
        ingress
            .handle_line(r#"{"command":"heartbeat","worker_id":"w1","available_space":25,"total_space":100}"#)
            .await,
        IngressReply::Accepted
    );

    assert_eventually(
        || {
            let registry = &plane.registry;
            async move {
                registry
                    .get_worker(&WorkerId::from("w1"))
                    .await
                    .map(|w| w.available_space == 25)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(5),
        "heartbeat did not reach the registry",
    )
    .await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_ready_command_activates_elastic_worker() {
    let plane = plane(PlaneConfig::default().with_elastic(60_000));
    let shutdown = CancellationToken::new();
    let ingress = Ingress::new(&plane, plane.spawn_heartbeat_receiver(shutdown.clone()));
    let worker_id = plane.registry.provision_elastic(None).await;

    let ready = format!(
        r#"{{"command":"ready","worker_id":"{}","address":"10.0.0.4:8102","storage_root":"/srv/e","total_space":2048}}"#,
        worker_id
    );
    assert_eq!(ingress.handle_line(&ready).await, IngressReply::Accepted);

    let worker = plane.registry.get_worker(&worker_id).await.unwrap();
    assert_eq!(worker.elastic_state(), Some(ElasticState::Ready));
    assert_eq!(worker.total_space, 2048);

    // Only provisioning workers accept the callback
    assert!(matches!(
        ingress.handle_line(&ready).await,
        IngressReply::Error { .. }
    ));
    shutdown.cancel();
}

#[tokio::test]
async fn test_bad_commands_are_rejected() {
    let plane = plane(PlaneConfig::default());
    let shutdown = CancellationToken::new();
    let ingress = Ingress::new(&plane, plane.spawn_heartbeat_receiver(shutdown.clone()));

    for line in [
        "not json",
        r#"{"command":"launch_rockets"}"#,
        r#"{"command":"ingest","way":"URL","path":"x","size":1}"#,
    ] {
        assert!(
            matches!(
                ingress.handle_line(line).await,
                IngressReply::Error {
                    code: ErrorCode::IllegalArgument,
                    ..
                }
            ),
            "accepted {}",
            line
        );
    }

    let submit = format!(
        r#"{{"command":"submit","job_type":"GCLOG_ANALYSIS","file_id":"{}"}}"#,
        Uuid::new_v4()
    );
    assert!(matches!(
        ingress.handle_line(&submit).await,
        IngressReply::Error {
            code: ErrorCode::FileDoesNotExist,
            ..
        }
    ));
    shutdown.cancel();
}

#[tokio::test]
async fn test_run_answers_each_line() {
    let plane = plane(PlaneConfig::default());
    let shutdown = CancellationToken::new();
    let ingress = Ingress::new(&plane, plane.spawn_heartbeat_receiver(shutdown.clone()));

    let input = concat!(
        r#"{"command":"ingest","way":"UPLOAD","path":"uploads/a.log","size":1}"#,
        "\n\n",
        "garbage\n",
    );
    let mut output = Vec::new();
    ingress
        .run(input.as_bytes(), &mut output, shutdown.clone())
        .await
        .unwrap();

    let replies: Vec<serde_json::Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["reply"], "file_ingested");
    assert_eq!(replies[1]["reply"], "error");
    assert_eq!(replies[1]["code"], "ILLEGAL_ARGUMENT");
    shutdown.cancel();
}

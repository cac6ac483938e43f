mod common;

use std::sync::Arc;

use common::{clock, date, warehouse, FakeSource};
use serde_json::json;
use workforce_etl::api::{CLIENTS, EMPLOYEES, POSITIONS, REGIONS, SHIFTS};
use workforce_etl::checkpoint::{CheckpointStore, RUN_MANIFEST_KEY};
use workforce_etl::config::PipelineConfig;
use workforce_etl::pipeline::{
    PartitionOutcome, PipelineError, PipelineOrchestrator, RunRequest,
};
use workforce_etl::warehouse::{BatchStatus, MemoryWarehouse, PeriodId, Warehouse};

fn source() -> FakeSource {
    FakeSource::new()
        .with(
            REGIONS,
            vec![
                json!({"id": 2, "name": "South", "timezone": "America/Chicago"}),
                json!({"id": 1, "name": "North", "timezone": "America/New_York"}),
            ],
        )
        .with(
            EMPLOYEES,
            vec![
                json!({"id": 10, "first_name": "Ada", "status": "active", "region_id": 1}),
                json!({"id": 11, "first_name": "Alan", "status": "active", "region_id": 1}),
                json!({"id": 20, "first_name": "Grace", "status": "active", "region_id": 2}),
            ],
        )
        .with(
            CLIENTS,
            vec![
                json!({"id": 100, "name": "Harbor Mall", "region_id": 1}),
                json!({"id": 200, "name": "Airport", "region_id": 2}),
            ],
        )
        .with(
            POSITIONS,
            vec![
                json!({"id": 7, "name": "Guard", "bill_rate": 30, "region_id": 1}),
                json!({"id": 8, "name": "Supervisor", "bill_rate": 40, "region_id": 2}),
            ],
        )
        .with(
            SHIFTS,
            vec![
                json!({"id": 1000, "region_id": 1, "client_id": 100, "employee_id": 10,
                       "status": "approved", "start_time": "2025-01-06T08:00:00Z",
                       "end_time": "2025-01-06T16:00:00Z"}),
                json!({"id": 1001, "region_id": 1, "client_id": 100, "employee_id": 11,
                       "status": "approved", "start_time": "2025-01-20T08:00:00Z"}),
                json!({"id": 1002, "region_id": 1, "client_id": 100,
                       "status": "open"}),
                json!({"id": 2000, "region_id": 2, "client_id": 200, "employee_id": 20,
                       "status": "approved", "start_time": "2025-01-15T20:00:00Z"}),
            ],
        )
}

fn january() -> RunRequest {
    RunRequest::new(date("2025-01-01"), date("2025-01-31"))
}

fn orchestrator(source: FakeSource, warehouse: Arc<MemoryWarehouse>) -> PipelineOrchestrator<FakeSource> {
    let warehouse: Arc<dyn Warehouse> = warehouse;
    PipelineOrchestrator::new(source, warehouse, clock(), PipelineConfig::default())
}

#[test]
fn full_run_loads_every_partition() {
    let warehouse = warehouse();
    let pipeline = orchestrator(source(), warehouse.clone());

    let summary = pipeline.run(&january()).expect("run completes");

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.run_id, "shifts:2025-01-01:2025-01-31");
    let order: Vec<_> = summary.partitions.iter().map(|p| p.partition.as_str()).collect();
    assert_eq!(order, vec!["region:1", "region:2"]);
    assert_eq!(summary.count(PartitionOutcome::Completed), 2);
    assert!(summary.errors.is_empty());

    assert_eq!(warehouse.current_rows("dim_region").len(), 2);
    assert_eq!(warehouse.current_rows("dim_employee").len(), 3);
    assert_eq!(warehouse.current_rows("dim_client").len(), 2);
    assert_eq!(warehouse.current_rows("dim_position").len(), 2);
    assert_eq!(warehouse.fact_rows("fact_shift").len(), 3);
    assert!(warehouse.fact("fact_shift", PeriodId(20250113), 1001).is_some());
    assert!(warehouse.fact("fact_shift", PeriodId(20250113), 2000).is_some());

    // 2 regions, 4 + 3 dimension rows, 3 shifts; the shift without a start is quarantined.
    assert_eq!(summary.records_processed, 12);
    assert_eq!(summary.records_failed, 1);
    let issues = warehouse.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].1.natural_key.as_deref(), Some("1002"));

    let batches = warehouse.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].status, BatchStatus::Completed);
    assert_eq!(batches[0].records_processed, 12);
    assert_eq!(batches[0].records_failed, 1);
    assert!(batches[0].completed_at.is_some());

    assert_eq!(
        warehouse.load(&summary.run_id, RUN_MANIFEST_KEY).unwrap(),
        None
    );
    assert_eq!(warehouse.load(&summary.run_id, "region:1").unwrap(), None);
}

#[test]
fn replaying_a_finished_run_adds_no_rows() {
    let warehouse = warehouse();

    orchestrator(source(), warehouse.clone()).run(&january()).unwrap();
    let dimensions = warehouse.dimension_rows("dim_employee").len();

    let replay = orchestrator(source(), warehouse.clone()).run(&january()).unwrap();

    assert_eq!(replay.status, BatchStatus::Completed);
    assert_eq!(replay.count(PartitionOutcome::Completed), 2);
    assert_eq!(replay.regions.unchanged, 2);
    assert_eq!(warehouse.dimension_rows("dim_employee").len(), dimensions);
    assert_eq!(warehouse.dimension_rows("dim_region").len(), 2);
    assert_eq!(warehouse.fact_rows("fact_shift").len(), 3);
    let stamped: Vec<_> = warehouse
        .fact_rows("fact_shift")
        .into_iter()
        .map(|row| row["etl_batch_id"].clone())
        .collect();
    assert!(stamped.iter().all(|batch| *batch == json!(replay.batch_id.0)));
}

#[test]
fn shifts_are_requested_per_region_and_window() {
    let source = source();
    let warehouse = warehouse();
    let config = PipelineConfig {
        max_range_days: 10,
        ..PipelineConfig::default()
    };
    let pipeline = PipelineOrchestrator::new(source.clone(), warehouse.clone(), clock(), config);

    pipeline.run(&january().with_regions(vec![1])).unwrap();

    let windows: Vec<_> = source
        .calls()
        .into_iter()
        .filter(|(endpoint, _)| endpoint == SHIFTS)
        .map(|(_, params)| params)
        .collect();
    assert_eq!(windows.len(), 4);
    assert_eq!(
        windows[0],
        vec![
            ("region_id".to_string(), "1".to_string()),
            ("start_time:between".to_string(), "2025-01-01|2025-01-10".to_string()),
        ]
    );
    assert_eq!(windows[3][1].1, "2025-01-31|2025-01-31");
    assert_eq!(warehouse.fact_rows("fact_shift").len(), 2);
}

#[test]
fn rejected_credentials_fail_the_batch_before_any_partition() {
    let source = source();
    source.reject_credentials();
    let warehouse = warehouse();
    let pipeline = orchestrator(source.clone(), warehouse.clone());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Failed);
    assert!(summary.partitions.is_empty());
    assert!(source.calls().is_empty());
    let batch = &warehouse.batches()[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("authentication")));
}

#[test]
fn token_rejected_mid_run_aborts_remaining_partitions() {
    let source = source();
    source.expire_token_on(CLIENTS);
    let warehouse = warehouse();
    let pipeline = orchestrator(source, warehouse.clone());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.partitions.len(), 1);
    assert_eq!(summary.partitions[0].outcome, PartitionOutcome::Failed);
    assert!(warehouse.fact_rows("fact_shift").is_empty());
}

#[test]
fn uncovered_range_fails_before_loading() {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let pipeline = orchestrator(source(), warehouse.clone());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Failed);
    assert!(summary.errors[0].contains("2025-01-01"));
    assert!(warehouse.current_rows("dim_region").is_empty());
}

#[test]
fn failed_partition_does_not_stop_the_others() {
    let warehouse = warehouse();
    warehouse.fail_fact_loads_where("region_id", json!(2));
    let pipeline = orchestrator(source(), warehouse.clone());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.count(PartitionOutcome::Completed), 1);
    assert_eq!(summary.count(PartitionOutcome::Failed), 1);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].starts_with("region:2"));
    assert_eq!(warehouse.fact_rows("fact_shift").len(), 2);

    let manifest = warehouse
        .load(&summary.run_id, RUN_MANIFEST_KEY)
        .unwrap()
        .expect("manifest kept for resume");
    assert_eq!(manifest["completed_partitions"], json!(["region:1"]));
}

#[test]
fn every_partition_failing_fails_the_batch() {
    let source = source();
    source.fail(SHIFTS, 1);
    source.fail(SHIFTS, 2);
    let pipeline = orchestrator(source, warehouse());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.count(PartitionOutcome::Failed), 2);
}

#[test]
fn rerun_resumes_after_the_completed_work() {
    let source = source();
    source.fail(SHIFTS, 2);
    let warehouse = warehouse();

    let first = orchestrator(source.clone(), warehouse.clone())
        .run(&january())
        .unwrap();
    assert_eq!(first.count(PartitionOutcome::Failed), 1);

    source.heal();
    source.take_calls();
    let second = orchestrator(source.clone(), warehouse.clone())
        .run(&january())
        .unwrap();

    assert_eq!(second.status, BatchStatus::Completed);
    assert_eq!(second.partitions[0].outcome, PartitionOutcome::Skipped);
    assert_eq!(second.partitions[1].outcome, PartitionOutcome::Completed);
    assert_ne!(first.batch_id, second.batch_id);

    let endpoints: Vec<_> = source
        .calls()
        .into_iter()
        .map(|(endpoint, _)| endpoint)
        .collect();
    assert_eq!(endpoints, vec![REGIONS.to_string(), SHIFTS.to_string()]);
    assert_eq!(warehouse.fact_rows("fact_shift").len(), 3);
    assert_eq!(warehouse.load(&second.run_id, RUN_MANIFEST_KEY).unwrap(), None);
}

#[test]
fn resumed_partition_reports_only_this_batch() {
    let source = source();
    source.fail(SHIFTS, 2);
    let warehouse = warehouse();

    let first = orchestrator(source.clone(), warehouse.clone())
        .run(&january())
        .unwrap();
    // Region 2 got through its three dimension phases before the shift fetch failed.
    assert_eq!(first.partitions[1].records_processed, 3);
    assert_eq!(first.records_processed, 11);

    source.heal();
    let second = orchestrator(source, warehouse.clone())
        .run(&january())
        .unwrap();

    assert_eq!(second.partitions[1].outcome, PartitionOutcome::Completed);
    assert_eq!(second.partitions[1].records_processed, 1);
    assert!(second.partitions[1].dimensions.is_empty());
    // Two unchanged regions plus the one shift loaded on resume.
    assert_eq!(second.records_processed, 3);

    let batches = warehouse.batches();
    assert_eq!(batches[0].records_processed, 11);
    assert_eq!(batches[1].records_processed, 3);
}

#[test]
fn unwritable_run_manifest_still_closes_the_batch() {
    let warehouse = warehouse();
    warehouse.fail_checkpoint_saves_for(RUN_MANIFEST_KEY);
    let pipeline = orchestrator(source(), warehouse.clone());

    let summary = pipeline.run(&january()).expect("checkpoint failures stay in the summary");

    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.count(PartitionOutcome::Failed), 2);
    assert!(summary.errors.iter().all(|error| error.contains("locked")));
    let statuses: Vec<_> = warehouse.batches().into_iter().map(|batch| batch.status).collect();
    assert_eq!(statuses, vec![BatchStatus::Failed]);
}

#[test]
fn progress_write_failure_is_confined_to_its_partition() {
    let warehouse = warehouse();
    warehouse.fail_checkpoint_saves_for("region:2");
    let pipeline = orchestrator(source(), warehouse.clone());

    let summary = pipeline.run(&january()).unwrap();

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.partitions[0].outcome, PartitionOutcome::Completed);
    assert_eq!(summary.partitions[1].outcome, PartitionOutcome::Failed);
    assert!(summary.errors[0].starts_with("region:2"));
    assert_eq!(warehouse.batches()[0].status, BatchStatus::Completed);

    let manifest = warehouse
        .load(&summary.run_id, RUN_MANIFEST_KEY)
        .unwrap()
        .expect("manifest kept for resume");
    assert_eq!(manifest["completed_partitions"], json!(["region:1"]));
}

#[test]
fn inverted_range_is_rejected_up_front() {
    let warehouse = warehouse();
    let pipeline = orchestrator(source(), warehouse.clone());

    let result = pipeline.run(&RunRequest::new(date("2025-02-01"), date("2025-01-01")));

    assert!(matches!(result, Err(PipelineError::InvalidRequest(_))));
    assert!(warehouse.batches().is_empty());
}

use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

use super::plan::{partition_key, RunRequest, BATCH_TYPE};
use super::summary::{PartitionOutcome, PartitionSummary, RunSummary};
use super::{PartitionError, PipelineError};
use crate::api::{date_windows, QueryParams, RecordSource, CLIENTS, EMPLOYEES, POSITIONS, REGIONS, SHIFTS};
use crate::checkpoint::{PartitionProgress, RunCheckpoints, RunManifest};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::transform::{
    client_record, employee_record, position_record, region_record, shift_record, transform_all,
    IntoRecord, Record, ValidationError,
};
use crate::warehouse::{
    BatchId, BatchTracker, BillingPeriodResolver, DataQualityIssue, DimensionSpec,
    DimensionUpserter, FactLoader, StoreError, UpsertStats, Warehouse, CLIENT_DIMENSION,
    EMPLOYEE_DIMENSION, POSITION_DIMENSION, REGION_DIMENSION, SHIFT_FACT,
};

type Checkpoints<'a> = RunCheckpoints<'a, dyn Warehouse>;

/// Mutable state of one partition while it is being processed.
///
/// `progress` is the resumable checkpoint and accumulates across batches of
/// the same run; `processed` and `failed` count only this batch's work.
struct PartitionRun<'a> {
    key: &'a str,
    region_id: i64,
    batch_id: BatchId,
    checkpoints: &'a Checkpoints<'a>,
    progress: PartitionProgress,
    processed: u64,
    failed: u64,
    summary: PartitionSummary,
}

impl<'a> PartitionRun<'a> {
    fn new(key: &'a str, region_id: i64, batch_id: BatchId, checkpoints: &'a Checkpoints<'a>) -> Self {
        Self {
            key,
            region_id,
            batch_id,
            checkpoints,
            progress: PartitionProgress::default(),
            processed: 0,
            failed: 0,
            summary: PartitionSummary::new(key, region_id),
        }
    }

    fn checkpoint(&mut self, processed: u64, failed: u64) -> Result<(), StoreError> {
        self.processed += processed;
        self.failed += failed;
        self.progress.records_processed += processed;
        self.progress.records_failed += failed;
        self.checkpoints.save_progress(self.key, &self.progress)
    }

    fn into_summary(self) -> PartitionSummary {
        PartitionSummary {
            records_processed: self.processed,
            records_failed: self.failed,
            ..self.summary
        }
    }
}

/// Drives a full sync run against a [`RecordSource`] and a [`Warehouse`].
pub struct PipelineOrchestrator<A: RecordSource> {
    source: A,
    warehouse: Arc<dyn Warehouse>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    tracker: BatchTracker<dyn Warehouse>,
    upserter: DimensionUpserter<dyn Warehouse>,
    loader: FactLoader<dyn Warehouse>,
}

impl<A: RecordSource> PipelineOrchestrator<A> {
    pub fn new(
        source: A,
        warehouse: Arc<dyn Warehouse>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            tracker: BatchTracker::new(Arc::clone(&warehouse), Arc::clone(&clock)),
            upserter: DimensionUpserter::new(Arc::clone(&warehouse), Arc::clone(&clock)),
            loader: FactLoader::new(Arc::clone(&warehouse), Arc::clone(&clock), config.batch_size),
            source,
            warehouse,
            clock,
            config,
        }
    }

    pub fn source(&self) -> &A {
        &self.source
    }

    /// Runs one batch. Partition failures, checkpoint failures included, are
    /// reported in the summary. An `Err` means the request was invalid, the
    /// batch row itself could not be written, or the run manifest could not be
    /// cleared after the batch was closed.
    pub fn run(&self, request: &RunRequest) -> Result<RunSummary, PipelineError> {
        if request.start > request.end {
            return Err(PipelineError::InvalidRequest(format!(
                "start {} is after end {}",
                request.start, request.end
            )));
        }

        let run_id = request.run_id();
        let batch_id = self.tracker.create_batch(BATCH_TYPE, request.metadata())?;
        let span = info_span!("etl_run", batch_id = batch_id.0, run_id = %run_id);
        let _entered = span.enter();
        info!(start = %request.start, end = %request.end, "starting run");

        let mut summary = RunSummary::new(batch_id, run_id.clone(), request.start, request.end);

        if let Err(err) = self.source.authenticate() {
            return self.abort(summary, err.to_string());
        }
        let resolver = match BillingPeriodResolver::from_store(self.warehouse.as_ref())
            .and_then(|resolver| resolver.ensure_covers(request.start, request.end).map(|()| resolver))
        {
            Ok(resolver) => resolver,
            Err(err) => return self.abort(summary, err.to_string()),
        };

        let region_ids = match self.load_regions(batch_id) {
            Ok((ids, stats)) => {
                summary.regions = stats;
                ids
            }
            Err(err) => return self.abort(summary, format!("regions: {err}")),
        };
        let partitions = select_partitions(region_ids, &request.regions);
        info!(partitions = partitions.len(), "regions loaded");

        let checkpoints: Checkpoints<'_> = RunCheckpoints::new(self.warehouse.as_ref(), &run_id);
        let mut manifest = match checkpoints.manifest() {
            Ok(manifest) => manifest,
            Err(err) => return self.abort(summary, format!("run checkpoint: {err}")),
        };

        for region_id in partitions {
            let key = partition_key(region_id);
            if manifest.completed_partitions.contains(&key) {
                info!(partition = %key, "partition already completed, skipping");
                summary.partitions.push(PartitionSummary::skipped(key, region_id));
                continue;
            }

            let span = info_span!("partition", partition = %key);
            let _entered = span.enter();

            let mut run = PartitionRun::new(&key, region_id, batch_id, &checkpoints);
            let result = self
                .run_partition(&mut run, request, &resolver)
                .and_then(|()| {
                    mark_completed(&checkpoints, &mut manifest, &key)
                        .map_err(PartitionError::from)
                });
            let mut partition = run.into_summary();

            match result {
                Ok(()) => {
                    info!(
                        processed = partition.records_processed,
                        failed = partition.records_failed,
                        "partition completed"
                    );
                    summary.partitions.push(partition);
                }
                Err(err) if err.is_authentication() => {
                    partition.outcome = PartitionOutcome::Failed;
                    partition.error = Some(err.to_string());
                    summary.partitions.push(partition);
                    return self.abort(summary, format!("{key}: {err}"));
                }
                Err(err) => {
                    error!(error = %err, "partition failed");
                    partition.outcome = PartitionOutcome::Failed;
                    partition.error = Some(err.to_string());
                    summary.errors.push(format!("{key}: {err}"));
                    summary.partitions.push(partition);
                }
            }
        }

        self.finish(summary, &checkpoints)
    }

    fn finish(
        &self,
        mut summary: RunSummary,
        checkpoints: &Checkpoints<'_>,
    ) -> Result<RunSummary, PipelineError> {
        summary.tally();
        let failed = summary.count(PartitionOutcome::Failed);
        let attempted = failed + summary.count(PartitionOutcome::Completed);

        let error = if attempted > 0 && failed == attempted {
            Some(summary.errors.join("; "))
        } else {
            None
        };
        if error.is_none() && failed > 0 {
            warn!(failed, attempted, "run completed with failed partitions");
        }

        summary.status = self.tracker.complete_batch(
            summary.batch_id,
            summary.records_processed,
            summary.records_failed,
            error.as_deref(),
        )?;
        info!(
            status = %summary.status,
            processed = summary.records_processed,
            failed = summary.records_failed,
            "run finished"
        );

        // Batch row is final by now.
        if failed == 0 {
            checkpoints.clear_manifest()?;
        }
        Ok(summary)
    }

    /// Marks the batch FAILED. Checkpoints stay so a rerun can resume.
    fn abort(&self, mut summary: RunSummary, reason: String) -> Result<RunSummary, PipelineError> {
        error!(reason = %reason, "run aborted");
        summary.errors.push(reason.clone());
        summary.tally();
        summary.status = self.tracker.complete_batch(
            summary.batch_id,
            summary.records_processed,
            summary.records_failed,
            Some(&reason),
        )?;
        Ok(summary)
    }

    fn load_regions(&self, batch_id: BatchId) -> Result<(Vec<i64>, UpsertStats), PartitionError> {
        let raws = self.source.fetch_all(REGIONS, &QueryParams::new())?;
        let (rows, issues) = transform_all(REGION_DIMENSION.entity, &["id", "region_id"], raws, region_record);
        let quarantined = self.quarantine(batch_id, &issues)?;

        let ids = rows.iter().map(IntoRecord::natural_key).collect();
        let records = rows.into_iter().map(IntoRecord::into_record).collect();
        let mut stats = self.upserter.upsert(&REGION_DIMENSION, records, batch_id)?;
        stats.rejected += quarantined;
        Ok((ids, stats))
    }

    fn run_partition(
        &self,
        run: &mut PartitionRun<'_>,
        request: &RunRequest,
        resolver: &BillingPeriodResolver,
    ) -> Result<(), PartitionError> {
        run.progress = run.checkpoints.progress(run.key)?;
        if run.progress != PartitionProgress::default() {
            info!(
                phases = run.progress.completed_phases.len(),
                windows = run.progress.completed_windows.len(),
                "resuming partition"
            );
        }

        self.dimension_phase(run, EMPLOYEES, &EMPLOYEE_DIMENSION, employee_record)?;
        self.dimension_phase(run, CLIENTS, &CLIENT_DIMENSION, client_record)?;
        self.dimension_phase(run, POSITIONS, &POSITION_DIMENSION, position_record)?;

        for window in date_windows(request.start, request.end, self.config.max_range_days) {
            let window_key = window.key();
            if run.progress.window_done(&window_key) {
                debug!(window = %window_key, "window already loaded");
                continue;
            }

            let params = QueryParams::new()
                .filter("region_id", run.region_id)
                .between("start_time", window.start, window.end);
            let raws = self.source.fetch_all(SHIFTS, &params)?;
            let (rows, issues) = transform_all(SHIFT_FACT.entity, &["id", "shift_id"], raws, shift_record);
            let quarantined = self.quarantine(run.batch_id, &issues)?;

            let mut facts = Vec::with_capacity(rows.len());
            for row in rows {
                let period = resolver.resolve(row.shift_date)?;
                facts.push(row.into_fact(period));
            }
            let report = self.loader.load_batch(&SHIFT_FACT, facts, run.batch_id)?;
            debug!(
                window = %window_key,
                written = report.written,
                rejected = report.rejected + quarantined,
                "window loaded"
            );

            run.summary.facts.absorb(report);
            run.summary.facts.rejected += quarantined;
            run.progress.completed_windows.push(window_key);
            run.checkpoint(report.written, report.rejected + quarantined)?;
        }
        Ok(())
    }

    fn dimension_phase<T: IntoRecord>(
        &self,
        run: &mut PartitionRun<'_>,
        endpoint: &str,
        spec: &DimensionSpec,
        transform: fn(&Record) -> Result<T, ValidationError>,
    ) -> Result<(), PartitionError> {
        if run.progress.phase_done(endpoint) {
            debug!(phase = endpoint, "phase already loaded");
            return Ok(());
        }

        let params = QueryParams::new().filter("region_id", run.region_id);
        let raws = self.source.fetch_all(endpoint, &params)?;
        let (rows, issues) = transform_all(spec.entity, &["id", spec.natural_key], raws, transform);
        let quarantined = self.quarantine(run.batch_id, &issues)?;

        let records = rows.into_iter().map(IntoRecord::into_record).collect();
        let mut stats = self.upserter.upsert(spec, records, run.batch_id)?;
        stats.rejected += quarantined;
        debug!(
            phase = endpoint,
            inserted = stats.inserted,
            updated = stats.updated,
            unchanged = stats.unchanged,
            rejected = stats.rejected,
            "dimension loaded"
        );

        run.summary
            .dimensions
            .entry(spec.entity.to_string())
            .or_default()
            .absorb(stats);
        run.progress.completed_phases.push(endpoint.to_string());
        run.checkpoint(stats.processed(), stats.rejected)?;
        Ok(())
    }

    fn quarantine(&self, batch_id: BatchId, issues: &[DataQualityIssue]) -> Result<u64, StoreError> {
        if !issues.is_empty() {
            self.warehouse
                .record_issues(batch_id, issues, self.clock.utc_now())?;
        }
        Ok(issues.len() as u64)
    }
}

/// Records `key` in the run manifest. The in-memory manifest only changes once
/// the write succeeded.
fn mark_completed(
    checkpoints: &Checkpoints<'_>,
    manifest: &mut RunManifest,
    key: &str,
) -> Result<(), StoreError> {
    let mut next = manifest.clone();
    next.completed_partitions.insert(key.to_string());
    checkpoints.save_manifest(&next)?;
    *manifest = next;

    if let Err(err) = checkpoints.clear_progress(key) {
        warn!(partition = key, error = %err, "stale partition progress left behind");
    }
    Ok(())
}

/// Regions to process, ascending. An explicit selection wins over the API list.
fn select_partitions(loaded: Vec<i64>, requested: &[i64]) -> Vec<i64> {
    let mut ids = if requested.is_empty() {
        loaded
    } else {
        requested.to_vec()
    };
    ids.sort_unstable();
    ids.dedup();
    ids
}

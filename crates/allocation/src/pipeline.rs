use sectorflow_core::{FlowRecord, Geoscale, SectorColumn};

use crate::aggregate::{aggregate_by, sector_disaggregation, sector_grouping_fields};
use crate::context::EngineContext;
use crate::equalize::equally_allocate_suppressed_parent_to_child;
use crate::error::{AllocError, Result};
use crate::merge::SecondaryTable;
use crate::methods::{apply_stage, in_subtree, StageEnv};
use crate::model::{Partition, PartitionOutcome, PartitionOutput, RunMeta, RunResult};
use crate::plan::{ActivitySet, AllocationPlan, Stage};
use crate::source::{SecondarySource, SourceCache};
use crate::summary::{compute_summary, Diagnostic, Diagnostics};

/// Run every partition per plan. Partitions run concurrently; a failing
/// partition is reported in its outcome and never stops the others.
pub fn run(
    plan: &AllocationPlan,
    partitions: &[Partition],
    ctx: &EngineContext,
    source: &dyn SecondarySource,
) -> RunResult {
    let cache = SourceCache::new(source);
    let sources = &cache;
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let mut outcomes = Vec::with_capacity(partitions.len());
    for chunk in partitions.chunks(workers) {
        let results: Vec<Result<PartitionOutput>> = std::thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|p| s.spawn(move || process(plan, p, ctx, sources)))
                .collect();
            handles
                .into_iter()
                .zip(chunk)
                .map(|(h, p)| {
                    h.join()
                        .unwrap_or_else(|_| Err(AllocError::PartitionPanicked(p.label())))
                })
                .collect()
        });

        for (partition, result) in chunk.iter().zip(results) {
            if let Err(e) = &result {
                log::error!("partition {} failed: {e}", partition.label());
            }
            outcomes.push(PartitionOutcome {
                source: partition.source.clone(),
                activity_set: partition.activity_set.clone(),
                year: partition.year,
                rows_in: partition.records.len(),
                result,
            });
        }
    }

    let summary = compute_summary(&outcomes);
    log::info!(
        "{}: {} partitions, {} succeeded, {} failed, {} secondary loads",
        plan.name,
        summary.partitions,
        summary.succeeded,
        summary.failed,
        cache.loads()
    );

    RunResult {
        meta: RunMeta {
            method_name: plan.name.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        summary,
        outcomes,
    }
}

fn process(
    plan: &AllocationPlan,
    partition: &Partition,
    ctx: &EngineContext,
    sources: &SourceCache<'_>,
) -> Result<PartitionOutput> {
    let set = plan.activity_set(&partition.activity_set).ok_or_else(|| {
        AllocError::ConfigValidation(format!(
            "partition {}: no activity set '{}' in {}",
            partition.label(),
            partition.activity_set,
            plan.name
        ))
    })?;
    run_partition(plan, set, partition, ctx, sources)
}

/// Apply an activity set's stages in order to one partition and aggregate
/// the result to one row per sector key.
pub fn run_partition(
    plan: &AllocationPlan,
    set: &ActivitySet,
    partition: &Partition,
    ctx: &EngineContext,
    sources: &SourceCache<'_>,
) -> Result<PartitionOutput> {
    let mut diagnostics = Diagnostics::default();
    let mut records = set.select(&partition.records);
    log::info!(
        "{}: {} of {} rows in activity set '{}'",
        partition.label(),
        records.len(),
        partition.records.len(),
        set.name
    );

    let env = StageEnv {
        ctx,
        primary_scale: set.geoscale,
        merge_fields: &set.merge_fields,
        target_rank: plan.target_rank,
    };
    for stage in &set.stages {
        records = execute_stage(stage, &records, partition.year, &env, sources, &mut diagnostics)?;
    }

    let suppressed = records.iter().filter(|r| r.flow_amount.is_suppressed()).count();
    if suppressed > 0 {
        log::info!("{}: {suppressed} suppressed rows carried through", partition.label());
        diagnostics.push(Diagnostic::SuppressedPassThrough { rows: suppressed });
    }

    Ok(PartitionOutput {
        records: aggregate_by(&records, &sector_grouping_fields()),
        diagnostics,
    })
}

/// Resolve a stage's secondary (nested stages first) and apply it.
fn execute_stage(
    stage: &Stage,
    primary: &[FlowRecord],
    year: i32,
    env: &StageEnv<'_>,
    sources: &SourceCache<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    let secondary = match &stage.source {
        Some(name) => Some(load_secondary(stage, name, year, env, sources, diagnostics)?),
        None => None,
    };
    log::info!("applying {} to {} rows", stage.label(), primary.len());
    apply_stage(stage, primary, secondary.as_ref(), env, diagnostics)
}

fn load_secondary(
    stage: &Stage,
    name: &str,
    year: i32,
    env: &StageEnv<'_>,
    sources: &SourceCache<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<SecondaryTable> {
    let year = stage.year.unwrap_or(year);
    let loaded = sources.get(name, year, stage.geoscale, stage.method.secondary_kind(), env.ctx)?;
    let mut table = loaded.try_map(|rows, _| {
        Ok::<_, AllocError>(prepare_secondary(rows, stage, env.ctx, diagnostics))
    })?;

    if let Some(inner) = &stage.nested {
        table = table.try_map(|rows, scale: Geoscale| {
            let inner_env = StageEnv {
                primary_scale: scale,
                ..*env
            };
            execute_stage(inner, rows, year, &inner_env, sources, diagnostics)
        })?;
    }
    Ok(table)
}

/// Stage filters, suppressed-child estimation and one-to-one sector fill.
fn prepare_secondary(
    rows: &[FlowRecord],
    stage: &Stage,
    ctx: &EngineContext,
    diagnostics: &mut Diagnostics,
) -> Vec<FlowRecord> {
    if rows.is_empty() {
        return Vec::new();
    }
    let cw = &ctx.crosswalk;
    let col = SectorColumn::primary(rows);
    let kept: Vec<FlowRecord> = rows
        .iter()
        .filter(|r| stage.flows.is_empty() || stage.flows.contains(&r.flow_name))
        .filter(|r| {
            stage.compartments.is_empty()
                || r.compartment.as_ref().is_some_and(|c| stage.compartments.contains(c))
        })
        .filter(|r| match r.sector(col) {
            Some(code) => stage.drop_sectors.is_empty() || !in_subtree(code, &stage.drop_sectors, cw),
            None => true,
        })
        .cloned()
        .collect();
    if kept.len() < rows.len() {
        log::debug!("stage filters kept {} of {} secondary rows", kept.len(), rows.len());
    }

    let estimated = if stage.estimate_suppressed {
        equally_allocate_suppressed_parent_to_child(&kept, col, cw, diagnostics)
    } else {
        kept
    };
    sector_disaggregation(&estimated, col, cw)
}

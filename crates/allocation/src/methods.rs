//! Allocation methods: the arithmetic each stage applies to its primary rows.

use std::collections::BTreeSet;

use rustc_hash::FxHashSet;

use sectorflow_core::{FlowRecord, Geoscale, GroupField, GroupKey, SectorColumn, SectorLengthCrosswalk};

use crate::aggregate::{group_indices, non_sector_fields};
use crate::context::EngineContext;
use crate::equalize::{equal_allocation, equally_allocate_parent_to_child};
use crate::error::{AllocError, Result};
use crate::merge::{check_data_loss, merge_by_geoscale, MergeOptions, MergeResult, SecondaryTable};
use crate::plan::{AllocationFunction, AllocationMethod, Stage};
use crate::ratio::{check_allocation_ratios, proportional_ratios, RatioBasis};
use crate::summary::{Diagnostic, Diagnostics};

/// Carries the parent code of disaggregated rows while their ratios are
/// computed; removed before the rows leave the stage.
const PARENT_SECTOR: &str = "__parent_sector";

/// What a stage needs besides its own configuration.
#[derive(Debug, Clone, Copy)]
pub struct StageEnv<'a> {
    pub ctx: &'a EngineContext,
    /// Geoscale of the primary rows.
    pub primary_scale: Geoscale,
    pub merge_fields: &'a [GroupField],
    pub target_rank: u8,
}

/// Apply one stage to `primary`. `secondary` is `None` only for `direct`.
pub fn apply_stage(
    stage: &Stage,
    primary: &[FlowRecord],
    secondary: Option<&SecondaryTable>,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    if stage.method == AllocationMethod::Direct {
        return Ok(direct(primary, env, diagnostics));
    }
    let secondary = secondary.ok_or_else(|| {
        AllocError::ConfigValidation(format!("{} stage has no secondary table", stage.method))
    })?;

    match (stage.method, &stage.function) {
        (AllocationMethod::Multiplication, _) => multiplication(primary, secondary, env, diagnostics),
        (AllocationMethod::Proportional, _) => proportional(primary, secondary, env, diagnostics),
        (AllocationMethod::ProportionalFlagged, _) => {
            proportional_flagged(primary, secondary, env, diagnostics)
        }
        (AllocationMethod::Disaggregation, None) => {
            disaggregation(primary, secondary, stage, env, diagnostics)
        }
        (AllocationMethod::WeightedAvg | AllocationMethod::Scaled | AllocationMethod::Disaggregation, Some(function)) => {
            call_function(function.as_ref(), stage, primary, secondary)
        }
        (AllocationMethod::WeightedAvg | AllocationMethod::Scaled, None) => Err(AllocError::ConfigValidation(
            format!("{} stage has no resolved function", stage.label()),
        )),
        (AllocationMethod::Direct, _) => Ok(direct(primary, env, diagnostics)),
    }
}

fn call_function(
    function: &dyn AllocationFunction,
    stage: &Stage,
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
) -> Result<Vec<FlowRecord>> {
    let name = stage.function_name.as_deref().unwrap_or_default();
    log::debug!("calling allocation function '{name}' on {} rows", primary.len());
    function.allocate(primary, secondary, stage).map_err(|e| match e {
        AllocError::FunctionFailed { .. } => e,
        other => AllocError::FunctionFailed {
            name: name.to_string(),
            message: other.to_string(),
        },
    })
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Check the two tables can be combined by `method`.
///
/// A secondary table must carry a single unit. For multiplication that unit
/// is either a plain factor or a rate `out/in` where `in` is every primary
/// unit; the rate's numerator is returned as the output unit.
pub fn check_units(
    method: AllocationMethod,
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
) -> Result<Option<String>> {
    let secondary_units = secondary.units();
    if secondary_units.is_empty() {
        return Ok(None);
    }
    let primary_units: BTreeSet<String> = primary.iter().map(|r| r.unit.clone()).collect();
    let mismatch = || AllocError::UnitMismatch {
        method: method.to_string(),
        primary: primary_units.iter().cloned().collect(),
        secondary: secondary_units.iter().cloned().collect(),
    };

    if secondary_units.len() > 1 {
        return Err(mismatch());
    }
    let unit = secondary_units.iter().next().cloned().unwrap_or_default();
    if method != AllocationMethod::Multiplication {
        return Ok(None);
    }
    match unit.split_once('/') {
        Some((out, per)) if primary_units.iter().all(|u| u == per) => Ok(Some(out.to_string())),
        Some(_) => Err(mismatch()),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Multiplication
// ---------------------------------------------------------------------------

/// `FlowAmount *= HelperFlow`. Missing or zero rates take the table's
/// published national rate for the sector; rows with no rate at all are
/// dropped and reported. Rates are never summed across sectors.
pub fn multiplication(
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    let col = SectorColumn::primary(primary);
    let unit = check_units(AllocationMethod::Multiplication, primary, secondary)?;
    let options = MergeOptions {
        merge_fields: env.merge_fields.to_vec(),
        zero_is_missing: true,
        self_weight_alternates: false,
        aggregate_sectors: false,
    };
    let merged = merge_by_geoscale(primary, col, env.primary_scale, secondary, &options, env.ctx, diagnostics);
    check_data_loss(primary.len(), &merged.unmatched, col, diagnostics);

    Ok(merged
        .matched
        .into_iter()
        .map(|mut r| {
            if let Some(h) = r.helper_flow {
                r.flow_amount = r.flow_amount.scale(h);
            }
            if let Some(u) = &unit {
                r.unit = u.clone();
            }
            r.clear_intermediates();
            r
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Proportional
// ---------------------------------------------------------------------------

fn ratio_fields(col: SectorColumn, merge_fields: &[GroupField]) -> Vec<GroupField> {
    let mut fields = non_sector_fields(col);
    for f in merge_fields {
        if !fields.contains(f) {
            fields.push(f.clone());
        }
    }
    fields
}

/// `FlowAmount *= HelperFlow / group denominator`, grouped by every
/// non-sector field. Activities none of whose sectors found a weight are
/// split evenly instead.
pub fn proportional(
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    let col = SectorColumn::primary(primary);
    check_units(AllocationMethod::Proportional, primary, secondary)?;
    let merged = merge_by_geoscale(
        primary,
        col,
        env.primary_scale,
        secondary,
        &proportional_options(env),
        env.ctx,
        diagnostics,
    );
    let fields = ratio_fields(col, env.merge_fields);
    Ok(allocate_by_ratio(primary.len(), merged, &fields, col, env, diagnostics))
}

fn proportional_options(env: &StageEnv<'_>) -> MergeOptions {
    MergeOptions {
        merge_fields: env.merge_fields.to_vec(),
        zero_is_missing: false,
        self_weight_alternates: true,
        aggregate_sectors: true,
    }
}

fn allocate_by_ratio(
    rows_before: usize,
    merged: MergeResult,
    fields: &[GroupField],
    col: SectorColumn,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Vec<FlowRecord> {
    let cw: &SectorLengthCrosswalk = &env.ctx.crosswalk;

    // An unmatched row whose group matched elsewhere is lost; a group with no
    // match at all falls back to an even split.
    let matched_groups: FxHashSet<GroupKey> = merged.matched.iter().map(|r| r.key(fields)).collect();
    let (dropped, orphans): (Vec<FlowRecord>, Vec<FlowRecord>) = merged
        .unmatched
        .into_iter()
        .partition(|r| matched_groups.contains(&r.key(fields)));
    check_data_loss(rows_before, &dropped, col, diagnostics);

    let table = proportional_ratios(&merged.matched, fields, col, RatioBasis::HelperFlow, cw);
    let weighted_rows: Vec<FlowRecord> = table
        .records
        .iter()
        .filter(|r| r.helper_flow.is_some())
        .cloned()
        .collect();
    for d in check_allocation_ratios(&weighted_rows, fields, col, cw, env.ctx.ratio_tolerance) {
        diagnostics.push(d);
    }

    let unweighted: FxHashSet<GroupKey> = table.unweighted_groups.into_iter().collect();
    let mut out = Vec::with_capacity(table.records.len() + orphans.len());
    let mut fallback = orphans;
    for mut r in table.records {
        if unweighted.contains(&r.key(fields)) {
            r.clear_intermediates();
            fallback.push(r);
            continue;
        }
        let ratio = r.flow_amount_ratio.unwrap_or(1.0);
        r.flow_amount = r.flow_amount.scale(ratio);
        r.clear_intermediates();
        out.push(r);
    }

    for (_, idxs) in group_indices(&fallback, fields) {
        let rows: Vec<FlowRecord> = idxs.iter().map(|&i| fallback[i].clone()).collect();
        if rows.len() > 1 {
            let first = &rows[0];
            let activity = first
                .activity_produced_by
                .clone()
                .or_else(|| first.activity_consumed_by.clone())
                .unwrap_or_default();
            log::warn!(
                "no weights for '{activity}' at {}; splitting evenly across {} sectors",
                first.location,
                rows.len()
            );
            diagnostics.push(Diagnostic::MissingWeightData {
                location: first.location.clone(),
                activity,
                children: rows.len(),
            });
        }
        out.extend(equal_allocation(&rows));
    }
    out
}

/// Proportional allocation for rows carrying `disaggregate_flag`; the rest
/// pass through unchanged and are appended.
pub fn proportional_flagged(
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    let (flagged, unflagged): (Vec<FlowRecord>, Vec<FlowRecord>) =
        primary.iter().cloned().partition(|r| r.disaggregate_flag);
    let mut out = if flagged.is_empty() {
        Vec::new()
    } else {
        proportional(&flagged, secondary, env, diagnostics)?
    };
    out.extend(unflagged.into_iter().map(|mut r| {
        r.clear_intermediates();
        r
    }));
    Ok(out)
}

// ---------------------------------------------------------------------------
// Disaggregation
// ---------------------------------------------------------------------------

/// True when `code` is one of `roots` or lies beneath one of them.
pub fn in_subtree(code: &str, roots: &[String], cw: &SectorLengthCrosswalk) -> bool {
    roots.iter().any(|root| {
        code == root || cw.ancestor_at(code, cw.depth_rank(root)).as_deref() == Some(root.as_str())
    })
}

/// Resolve coarse primary sectors to the target rank by secondary weights.
///
/// Rows shallower than the target (restricted to `include_sectors` when
/// given) with no observed children are expanded to their crosswalk
/// descendants at the target rank, merged against the secondary, and scaled
/// by each descendant's share of its parent. Other rows pass through.
pub fn disaggregation(
    primary: &[FlowRecord],
    secondary: &SecondaryTable,
    stage: &Stage,
    env: &StageEnv<'_>,
    diagnostics: &mut Diagnostics,
) -> Result<Vec<FlowRecord>> {
    let cw: &SectorLengthCrosswalk = &env.ctx.crosswalk;
    let col = SectorColumn::primary(primary);
    check_units(AllocationMethod::Disaggregation, primary, secondary)?;

    let mut kept = Vec::new();
    let mut expanded = Vec::new();
    for (_, idxs) in group_indices(primary, &non_sector_fields(col)) {
        let present: FxHashSet<String> = idxs
            .iter()
            .filter_map(|&i| primary[i].sector(col))
            .map(str::to_string)
            .collect();
        for &i in &idxs {
            let r = &primary[i];
            let Some(code) = r.sector(col) else {
                kept.push(r.clone());
                continue;
            };
            let selected = stage.include_sectors.is_empty() || in_subtree(code, &stage.include_sectors, cw);
            let descendants = cw.descendants_at(code, env.target_rank);
            let resolvable = cw.depth_rank(code) < env.target_rank
                && cw.children_of(code, &present).is_empty()
                && !descendants.is_empty()
                && !descendants.contains(code);
            if !(selected && resolvable) {
                kept.push(r.clone());
                continue;
            }
            for d in descendants {
                let mut child = r.with_sector(col, &d);
                child.extra.insert(PARENT_SECTOR.to_string(), code.to_string());
                expanded.push(child);
            }
        }
    }

    if expanded.is_empty() {
        return Ok(kept);
    }
    log::info!(
        "disaggregating {} rows into {} rows at rank {}",
        primary.len() - kept.len(),
        expanded.len(),
        env.target_rank
    );

    let merged = merge_by_geoscale(
        &expanded,
        col,
        env.primary_scale,
        secondary,
        &proportional_options(env),
        env.ctx,
        diagnostics,
    );
    let mut fields = ratio_fields(col, env.merge_fields);
    fields.push(GroupField::Extra(PARENT_SECTOR.to_string()));
    let rows_before = expanded.len();
    let resolved = allocate_by_ratio(rows_before, merged, &fields, col, env, diagnostics);

    kept.extend(resolved.into_iter().map(|mut r| {
        r.extra.remove(PARENT_SECTOR);
        r
    }));
    Ok(kept)
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

/// Sector-like activities: split evenly across candidate sectors, then push
/// coarse rows down to the target rank.
pub fn direct(primary: &[FlowRecord], env: &StageEnv<'_>, diagnostics: &mut Diagnostics) -> Vec<FlowRecord> {
    let col = SectorColumn::primary(primary);
    let split = equal_allocation(primary);
    equally_allocate_parent_to_child(&split, col, env.target_rank, &env.ctx.crosswalk, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::SecondaryKind;
    use sectorflow_core::{FlowAmount, Provenance};

    fn ctx() -> EngineContext {
        EngineContext::new(SectorLengthCrosswalk::from_numeric_codes([
            "111", "112", "113", "1121", "1122", "211", "212", "334",
        ]))
    }

    fn env<'a>(ctx: &'a EngineContext, scale: Geoscale) -> StageEnv<'a> {
        StageEnv {
            ctx,
            primary_scale: scale,
            merge_fields: &[],
            target_rank: 3,
        }
    }

    fn rec(location: &str, activity: &str, sector: &str, amount: FlowAmount, unit: &str) -> FlowRecord {
        FlowRecord {
            location: location.into(),
            activity_consumed_by: Some(activity.into()),
            sector_consumed_by: Some(sector.into()),
            flow_name: "Water".into(),
            unit: unit.into(),
            year: 2015,
            flow_amount: amount,
            ..Default::default()
        }
    }

    fn weight(location: &str, sector: &str, amount: f64, unit: &str) -> FlowRecord {
        FlowRecord {
            location: location.into(),
            sector_produced_by: Some(sector.into()),
            flow_name: "Employment".into(),
            unit: unit.into(),
            year: 2015,
            flow_amount: FlowAmount::Value(amount),
            ..Default::default()
        }
    }

    fn secondary(raw: &[FlowRecord], scale: Geoscale, ctx: &EngineContext) -> SecondaryTable {
        SecondaryTable::prepare("EMP", 2015, raw, scale, SecondaryKind::Weights, ctx)
    }

    fn rates(raw: &[FlowRecord], scale: Geoscale, ctx: &EngineContext) -> SecondaryTable {
        SecondaryTable::prepare("EF", 2015, raw, scale, SecondaryKind::Rates, ctx)
    }

    fn v(x: f64) -> FlowAmount {
        FlowAmount::Value(x)
    }

    fn amount_at(rows: &[FlowRecord], sector: &str) -> FlowAmount {
        rows.iter()
            .find(|r| r.sector_consumed_by.as_deref() == Some(sector))
            .map(|r| r.flow_amount)
            .unwrap()
    }

    #[test]
    fn proportional_splits_by_weight() {
        let c = ctx();
        let primary: Vec<_> = ["111", "112", "113"]
            .iter()
            .map(|s| rec("06000", "Crops", s, v(900.0), "kg"))
            .collect();
        let sec = secondary(
            &[
                weight("06000", "111", 100.0, "p"),
                weight("06000", "112", 200.0, "p"),
                weight("06000", "113", 300.0, "p"),
            ],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = proportional(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(amount_at(&out, "111"), v(150.0));
        assert_eq!(amount_at(&out, "112"), v(300.0));
        assert_eq!(amount_at(&out, "113"), v(450.0));
        assert!(out.iter().all(|r| r.helper_flow.is_none() && r.flow_amount_ratio.is_none()));
        assert!(diags.is_empty());
    }

    #[test]
    fn proportional_keeps_suppressed_sentinel() {
        let c = ctx();
        let primary = vec![
            rec("06000", "Crops", "111", FlowAmount::Suppressed, "kg"),
            rec("06000", "Crops", "112", FlowAmount::Suppressed, "kg"),
        ];
        let sec = secondary(
            &[weight("06000", "111", 1.0, "p"), weight("06000", "112", 3.0, "p")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = proportional(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.flow_amount.is_suppressed()));
    }

    #[test]
    fn proportional_without_weights_splits_evenly() {
        let c = ctx();
        let primary = vec![
            rec("06000", "Mining", "211", v(60.0), "kg"),
            rec("06000", "Mining", "212", v(60.0), "kg"),
        ];
        let sec = secondary(&[weight("06000", "111", 1.0, "p")], Geoscale::State, &c);
        let mut diags = Diagnostics::default();
        let out = proportional(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(amount_at(&out, "211"), v(30.0));
        assert_eq!(amount_at(&out, "212"), v(30.0));
        assert!(out.iter().all(|r| r.provenance == Provenance::Estimated));
        assert_eq!(diags.count("missing_weight_data"), 1);
        assert_eq!(diags.count("data_loss_on_merge"), 0);
    }

    #[test]
    fn proportional_drops_partly_unmatched_rows() {
        let c = ctx();
        let primary = vec![
            rec("06000", "Mining", "211", v(60.0), "kg"),
            rec("06000", "Mining", "212", v(60.0), "kg"),
        ];
        let sec = secondary(&[weight("06000", "211", 5.0, "p")], Geoscale::State, &c);
        let mut diags = Diagnostics::default();
        let out = proportional(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(amount_at(&out, "211"), v(60.0));
        assert_eq!(diags.count("data_loss_on_merge"), 1);
    }

    #[test]
    fn multiplication_uses_state_rate_for_county() {
        let c = ctx();
        let primary = vec![rec("06037", "Electronics", "334", v(10.0), "p")];
        let sec = rates(&[weight("06000", "334", 5.0, "kg/p")], Geoscale::State, &c);
        let mut diags = Diagnostics::default();
        let out = multiplication(&primary, &sec, &env(&c, Geoscale::County), &mut diags).unwrap();
        assert_eq!(out[0].flow_amount, v(50.0));
        assert_eq!(out[0].unit, "kg");
    }

    #[test]
    fn multiplication_replaces_zero_with_national() {
        let c = ctx();
        let primary = vec![rec("06037", "Electronics", "334", v(10.0), "p")];
        let sec = rates(
            &[weight("06000", "334", 0.0, "kg/p"), weight("00000", "334", 2.0, "kg/p")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = multiplication(&primary, &sec, &env(&c, Geoscale::County), &mut diags).unwrap();
        assert_eq!(out[0].flow_amount, v(20.0));
        assert_eq!(diags.count("national_fallback"), 1);
    }

    #[test]
    fn multiplication_without_national_rate_drops_the_row() {
        let c = ctx();
        let primary = vec![rec("06037", "Electronics", "334", v(10.0), "p")];
        let sec = rates(
            &[weight("08000", "334", 9.0, "kg/p"), weight("48000", "334", 3.0, "kg/p")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = multiplication(&primary, &sec, &env(&c, Geoscale::County), &mut diags).unwrap();
        assert!(out.is_empty());
        assert_eq!(diags.count("national_fallback"), 0);
        assert_eq!(diags.count("data_loss_on_merge"), 1);
    }

    #[test]
    fn multiplication_does_not_sum_child_rates() {
        let c = ctx();
        let primary = vec![
            rec("06000", "Livestock", "112", v(10.0), "p"),
            rec("06000", "Livestock", "1121", v(10.0), "p"),
        ];
        let sec = rates(
            &[weight("06000", "1121", 2.0, "kg/p"), weight("06000", "1122", 3.0, "kg/p")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = multiplication(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sector_consumed_by.as_deref(), Some("1121"));
        assert_eq!(out[0].flow_amount, v(20.0));
        assert_eq!(diags.count("data_loss_on_merge"), 1);
    }

    #[test]
    fn multiplication_rejects_incompatible_rate() {
        let c = ctx();
        let primary = vec![rec("06037", "Electronics", "334", v(10.0), "p")];
        let sec = rates(&[weight("06000", "334", 5.0, "kg/USD")], Geoscale::State, &c);
        let mut diags = Diagnostics::default();
        let err = multiplication(&primary, &sec, &env(&c, Geoscale::County), &mut diags).unwrap_err();
        assert!(matches!(err, AllocError::UnitMismatch { .. }));
    }

    #[test]
    fn proportional_rejects_mixed_secondary_units() {
        let c = ctx();
        let primary = vec![rec("06000", "Crops", "111", v(1.0), "kg")];
        let sec = secondary(
            &[weight("06000", "111", 1.0, "p"), weight("06000", "112", 1.0, "USD")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let err = proportional(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap_err();
        assert!(matches!(err, AllocError::UnitMismatch { .. }));
    }

    #[test]
    fn flagged_rows_only() {
        let c = ctx();
        let mut flagged = vec![
            rec("06000", "Crops", "111", v(10.0), "kg"),
            rec("06000", "Crops", "112", v(10.0), "kg"),
        ];
        for r in &mut flagged {
            r.disaggregate_flag = true;
        }
        let plain = rec("06000", "Crops", "113", v(7.0), "kg");
        let mut primary = flagged;
        primary.push(plain);
        let sec = secondary(
            &[weight("06000", "111", 1.0, "p"), weight("06000", "112", 4.0, "p")],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = proportional_flagged(&primary, &sec, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(amount_at(&out, "111"), v(2.0));
        assert_eq!(amount_at(&out, "112"), v(8.0));
        assert_eq!(amount_at(&out, "113"), v(7.0));
        assert_eq!(out.last().unwrap().sector_consumed_by.as_deref(), Some("113"));
    }

    #[test]
    fn disaggregation_resolves_parent_by_weight() {
        let c = ctx();
        let stage_plan = crate::plan::AllocationPlan::from_toml(
            r#"
name = "t"
[[activity_sets]]
name = "a"
names = ["Crops"]
[[activity_sets.stages]]
method = "disaggregation"
allocation_source = "EMP"
"#,
            &crate::plan::FunctionRegistry::new(),
        )
        .unwrap();
        let stage = &stage_plan.activity_sets[0].stages[0];
        let primary = vec![rec("06000", "Crops", "11", v(900.0), "kg")];
        let sec = secondary(
            &[
                weight("06000", "111", 100.0, "p"),
                weight("06000", "112", 200.0, "p"),
                weight("06000", "113", 300.0, "p"),
            ],
            Geoscale::State,
            &c,
        );
        let mut diags = Diagnostics::default();
        let out = disaggregation(&primary, &sec, stage, &env(&c, Geoscale::State), &mut diags).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(amount_at(&out, "111"), v(150.0));
        assert_eq!(amount_at(&out, "113"), v(450.0));
        assert!(out.iter().all(|r| r.extra.is_empty()));
    }

    #[test]
    fn direct_pushes_to_target() {
        let c = ctx();
        let primary = vec![rec("06000", "Mining", "21", v(60.0), "kg")];
        let mut diags = Diagnostics::default();
        let out = direct(&primary, &env(&c, Geoscale::State), &mut diags);
        assert_eq!(amount_at(&out, "211"), v(30.0));
        assert_eq!(amount_at(&out, "212"), v(30.0));
        assert_eq!(diags.count("equal_allocation"), 1);
    }

    #[test]
    fn subtree_membership() {
        let c = ctx();
        let roots = vec!["112".to_string()];
        assert!(in_subtree("1121", &roots, &c.crosswalk));
        assert!(in_subtree("112", &roots, &c.crosswalk));
        assert!(!in_subtree("111", &roots, &c.crosswalk));
    }

    #[test]
    fn subtree_root_above_the_crosswalk() {
        let c = ctx();
        let roots = vec!["3".to_string()];
        assert!(in_subtree("334", &roots, &c.crosswalk));
        assert!(!in_subtree("211", &roots, &c.crosswalk));
    }

    #[test]
    fn function_stage_runs_its_resolved_function() {
        let c = ctx();
        let mut registry = crate::plan::FunctionRegistry::new();
        registry.register("halve", |primary: &[FlowRecord], _: &SecondaryTable, _: &Stage| -> Result<Vec<FlowRecord>> {
            Ok(primary
                .iter()
                .map(|r| FlowRecord {
                    flow_amount: r.flow_amount.scale(0.5),
                    ..r.clone()
                })
                .collect())
        });
        let plan = crate::plan::AllocationPlan::from_toml(
            r#"
name = "fn"
[[activity_sets]]
name = "a"
names = ["Crops"]
[[activity_sets.stages]]
method = "weighted_avg"
allocation_source = "EMP"
function = "halve"
"#,
            &registry,
        )
        .unwrap();
        let primary = vec![rec("06000", "Crops", "111", v(80.0), "kg")];
        let sec = secondary(&[weight("06000", "111", 1.0, "p")], Geoscale::State, &c);
        let env = env(&c, Geoscale::State);
        let mut diags = Diagnostics::default();

        let stage = &plan.activity_sets[0].stages[0];
        let out = apply_stage(stage, &primary, Some(&sec), &env, &mut diags).unwrap();
        assert_eq!(amount_at(&out, "111"), v(40.0));

        let mut unresolved = stage.clone();
        unresolved.function = None;
        let err = apply_stage(&unresolved, &primary, Some(&sec), &env, &mut diags).unwrap_err();
        match err {
            AllocError::ConfigValidation(message) => assert!(message.contains("weighted_avg"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }
}

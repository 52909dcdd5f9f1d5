//! Sector aggregation (bottom-up parent totals), one-to-one sector
//! disaggregation, and the final key aggregator.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use sectorflow_core::{
    FlowAmount, FlowRecord, GroupField, GroupKey, Provenance, SectorColumn, SectorLengthCrosswalk,
};

/// Columns that identify a row apart from the sector being aggregated.
pub fn non_sector_fields(col: SectorColumn) -> Vec<GroupField> {
    let mut fields = GroupField::descriptive();
    fields.push(col.other().field());
    fields.push(GroupField::DisaggregateFlag);
    fields
}

/// Row indices grouped by `fields`, in key order.
pub(crate) fn group_indices(
    records: &[FlowRecord],
    fields: &[GroupField],
) -> BTreeMap<GroupKey, Vec<usize>> {
    let mut groups: BTreeMap<GroupKey, Vec<usize>> = BTreeMap::new();
    for (i, r) in records.iter().enumerate() {
        groups.entry(r.key(fields)).or_default().push(i);
    }
    groups
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

struct ParentAcc {
    template: FlowRecord,
    amounts: Vec<FlowAmount>,
    helpers: Vec<f64>,
    estimated: bool,
}

/// Sum child sectors up to every ancestor implied by the data.
///
/// Ancestors already present for a key are never re-summed: a derived total
/// only fills a gap. Each parent sums its immediate children, so explicit
/// intermediate rows stand in for their own subtree. Output is the input
/// rows followed by the derived ancestors.
pub fn sector_aggregation(
    records: &[FlowRecord],
    col: SectorColumn,
    cw: &SectorLengthCrosswalk,
) -> Vec<FlowRecord> {
    let fields = non_sector_fields(col);
    let mut out = records.to_vec();

    for (_, idxs) in group_indices(records, &fields) {
        let explicit: FxHashSet<&str> = idxs.iter().filter_map(|&i| records[i].sector(col)).collect();

        // rank -> codes still to push upward
        let mut worklist: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        let mut queued: FxHashSet<&str> = FxHashSet::default();
        for &i in &idxs {
            if let Some(code) = records[i].sector(col) {
                if queued.insert(code) {
                    worklist.entry(cw.depth_rank(code)).or_default().push(code.to_string());
                }
            }
        }
        // duplicated explicit codes contribute every row
        let mut explicit_amounts: FxHashMap<&str, Vec<usize>> = FxHashMap::default();
        for &i in &idxs {
            if let Some(code) = records[i].sector(col) {
                explicit_amounts.entry(code).or_default().push(i);
            }
        }

        let mut derived: BTreeMap<String, ParentAcc> = BTreeMap::new();

        while let Some((rank, codes)) = worklist.pop_last() {
            for code in codes {
                let Some(parent) = cw.parent_of(&code) else {
                    continue;
                };
                if explicit.contains(parent.as_str()) {
                    continue;
                }
                let parent_rank = cw.depth_rank(&parent);
                if parent_rank >= rank {
                    continue;
                }

                let (amount, helper, estimated, template) = match explicit_amounts.get(code.as_str()) {
                    Some(rows) => {
                        let amount = FlowAmount::sum(rows.iter().map(|&i| records[i].flow_amount));
                        let helpers: Vec<f64> = rows.iter().filter_map(|&i| records[i].helper_flow).collect();
                        let helper = (!helpers.is_empty()).then(|| helpers.iter().sum::<f64>());
                        let estimated = rows.iter().any(|&i| records[i].provenance == Provenance::Estimated);
                        (amount, helper, estimated, records[rows[0]].clone())
                    }
                    None => {
                        let Some(acc) = derived.get(&code) else {
                            continue;
                        };
                        let helper = (!acc.helpers.is_empty()).then(|| acc.helpers.iter().sum::<f64>());
                        (
                            FlowAmount::sum(acc.amounts.iter().copied()),
                            helper,
                            acc.estimated,
                            acc.template.clone(),
                        )
                    }
                };

                let is_new = !derived.contains_key(&parent);
                let acc = derived.entry(parent.clone()).or_insert_with(|| ParentAcc {
                    template,
                    amounts: Vec::new(),
                    helpers: Vec::new(),
                    estimated: false,
                });
                acc.amounts.push(amount);
                if let Some(h) = helper {
                    acc.helpers.push(h);
                }
                acc.estimated |= estimated;
                if is_new {
                    worklist.entry(parent_rank).or_default().push(parent);
                }
            }
        }

        for (code, acc) in derived {
            let mut rec = acc.template.with_sector(col, &code);
            rec.flow_amount = FlowAmount::sum(acc.amounts);
            rec.helper_flow = (!acc.helpers.is_empty()).then(|| acc.helpers.iter().sum::<f64>());
            rec.flow_amount_ratio = None;
            rec.provenance = if acc.estimated {
                Provenance::Estimated
            } else {
                Provenance::Measured
            };
            out.push(rec);
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Disaggregation
// ---------------------------------------------------------------------------

/// Copy parent amounts down to children that are the parent's only child in
/// the crosswalk.
///
/// A parent with any observed child is left alone (observed children win).
/// Parents with several candidate children are left for proportional or
/// equal allocation. Chains of single children are followed to the leaves.
pub fn sector_disaggregation(
    records: &[FlowRecord],
    col: SectorColumn,
    cw: &SectorLengthCrosswalk,
) -> Vec<FlowRecord> {
    let fields = non_sector_fields(col);
    let mut out = records.to_vec();

    for (_, idxs) in group_indices(records, &fields) {
        let mut present: FxHashSet<String> = FxHashSet::default();
        let mut worklist: BTreeMap<u8, Vec<usize>> = BTreeMap::new();
        for &i in &idxs {
            if let Some(code) = records[i].sector(col) {
                if present.insert(code.to_string()) {
                    worklist.entry(cw.depth_rank(code)).or_default().push(i);
                }
            }
        }

        // Indices past `base` address generated rows.
        let mut generated: Vec<FlowRecord> = Vec::new();
        let base = records.len();
        let mut queue = worklist;
        while let Some((_, rows)) = queue.pop_first() {
            for row in rows {
                let rec = if row < base { &records[row] } else { &generated[row - base] };
                let Some(code) = rec.sector(col).map(str::to_string) else {
                    continue;
                };
                let children = cw.crosswalk_children(&code);
                if children.len() != 1 {
                    continue;
                }
                let Some(child) = children.into_iter().next() else {
                    continue;
                };
                if present.contains(&child) {
                    continue;
                }
                let child_rec = rec.with_sector(col, &child);
                present.insert(child.clone());
                generated.push(child_rec);
                queue
                    .entry(cw.depth_rank(&child))
                    .or_default()
                    .push(base + generated.len() - 1);
            }
        }
        out.extend(generated);
    }

    out
}

// ---------------------------------------------------------------------------
// Key aggregation
// ---------------------------------------------------------------------------

/// Default grouping for stage outputs: activity and sector columns kept.
pub fn stage_grouping_fields() -> Vec<GroupField> {
    vec![
        GroupField::Location,
        GroupField::ActivityProducedBy,
        GroupField::ActivityConsumedBy,
        GroupField::SectorProducedBy,
        GroupField::SectorConsumedBy,
        GroupField::FlowName,
        GroupField::Compartment,
        GroupField::Year,
        GroupField::Unit,
        GroupField::SectorSourceName,
    ]
}

/// Grouping for final sector-resolved output.
pub fn sector_grouping_fields() -> Vec<GroupField> {
    vec![
        GroupField::Location,
        GroupField::SectorProducedBy,
        GroupField::SectorConsumedBy,
        GroupField::FlowName,
        GroupField::Compartment,
        GroupField::Year,
        GroupField::Unit,
    ]
}

/// Collapse rows sharing `fields` into one row.
///
/// FlowAmount is summed; data-quality scores are FlowAmount-weighted
/// averages; text columns outside the key survive only when all rows agree.
/// Intermediates are cleared.
pub fn aggregate_by(records: &[FlowRecord], fields: &[GroupField]) -> Vec<FlowRecord> {
    group_indices(records, fields)
        .into_values()
        .map(|idxs| {
            let rows: Vec<&FlowRecord> = idxs.iter().map(|&i| &records[i]).collect();
            let mut rec = rows[0].clone();
            rec.flow_amount = FlowAmount::sum(rows.iter().map(|r| r.flow_amount));
            rec.data_reliability = weighted_score(&rows, |r| r.data_reliability);
            rec.data_collection = weighted_score(&rows, |r| r.data_collection);
            rec.activity_produced_by = agreed(&rows, |r| r.activity_produced_by.as_ref());
            rec.activity_consumed_by = agreed(&rows, |r| r.activity_consumed_by.as_ref());
            rec.compartment = agreed(&rows, |r| r.compartment.as_ref());
            if rows.iter().any(|r| r.provenance == Provenance::Estimated) {
                rec.provenance = Provenance::Estimated;
            }
            rec.disaggregate_flag = rows.iter().any(|r| r.disaggregate_flag);
            rec.clear_intermediates();
            rec
        })
        .collect()
}

fn agreed<'a, F>(rows: &[&'a FlowRecord], get: F) -> Option<String>
where
    F: Fn(&'a FlowRecord) -> Option<&'a String>,
{
    let first = get(rows[0]);
    if rows.iter().all(|r| get(*r) == first) {
        first.cloned()
    } else {
        None
    }
}

fn weighted_score<F>(rows: &[&FlowRecord], get: F) -> Option<f64>
where
    F: Fn(&FlowRecord) -> Option<f64>,
{
    let mut weighted = 0.0;
    let mut weight = 0.0;
    let mut plain = Vec::new();
    for r in rows {
        if let Some(score) = get(*r) {
            plain.push(score);
            if let Some(amount) = r.flow_amount.value() {
                weighted += score * amount.abs();
                weight += amount.abs();
            }
        }
    }
    if plain.is_empty() {
        None
    } else if weight > 0.0 {
        Some(weighted / weight)
    } else {
        Some(plain.iter().sum::<f64>() / plain.len() as f64)
    }
}

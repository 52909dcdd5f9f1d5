//! Proportional ratio calculator.
//!
//! Ratios are computed within a group (Location plus any caller-supplied
//! dimensions). The denominator is the total of the most aggregated level
//! observed in the group after child totals have been rolled up, so every
//! depth of a complete hierarchy sums to one.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use sectorflow_core::{FlowRecord, GroupField, GroupKey, SectorColumn, SectorLengthCrosswalk};

use crate::aggregate::group_indices;
use crate::summary::Diagnostic;

/// Which column supplies the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioBasis {
    FlowAmount,
    HelperFlow,
}

impl RatioBasis {
    fn value(&self, r: &FlowRecord) -> Option<f64> {
        match self {
            Self::FlowAmount => r.flow_amount.value(),
            Self::HelperFlow => r.helper_flow,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatioTable {
    /// Input rows with `flow_amount_ratio` set.
    pub records: Vec<FlowRecord>,
    /// Groups that had no usable denominator; their rows pass through at 1.
    pub unweighted_groups: Vec<GroupKey>,
}

/// Fill in missing ancestor totals bottom-up. Codes already present keep
/// their own value.
pub fn rollup_totals(
    totals: &BTreeMap<String, f64>,
    cw: &SectorLengthCrosswalk,
) -> BTreeMap<String, f64> {
    let mut out = totals.clone();
    let mut worklist: BTreeMap<u8, Vec<String>> = BTreeMap::new();
    for code in totals.keys() {
        worklist.entry(cw.depth_rank(code)).or_default().push(code.clone());
    }
    while let Some((rank, codes)) = worklist.pop_last() {
        for code in codes {
            let Some(parent) = cw.parent_of(&code) else {
                continue;
            };
            let parent_rank = cw.depth_rank(&parent);
            if totals.contains_key(&parent) || parent_rank >= rank {
                continue;
            }
            let value = out.get(&code).copied().unwrap_or(0.0);
            match out.get_mut(&parent) {
                Some(v) => *v += value,
                None => {
                    out.insert(parent.clone(), value);
                    worklist.entry(parent_rank).or_default().push(parent);
                }
            }
        }
    }
    out
}

/// Denominator per group: the rolled-up total at the shallowest observed rank.
pub fn denominators(
    records: &[FlowRecord],
    group_fields: &[GroupField],
    col: SectorColumn,
    basis: RatioBasis,
    cw: &SectorLengthCrosswalk,
) -> FxHashMap<GroupKey, f64> {
    let mut out = FxHashMap::default();
    for (key, idxs) in group_indices(records, group_fields) {
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for &i in &idxs {
            let r = &records[i];
            if let (Some(code), Some(v)) = (r.sector(col), basis.value(r)) {
                *totals.entry(code.to_string()).or_insert(0.0) += v;
            }
        }
        if totals.is_empty() {
            continue;
        }
        let rolled = rollup_totals(&totals, cw);
        let Some(min_rank) = rolled.keys().map(|c| cw.depth_rank(c)).min() else {
            continue;
        };
        let denom: f64 = rolled
            .iter()
            .filter(|(c, _)| cw.depth_rank(c) == min_rank)
            .map(|(_, v)| *v)
            .sum();
        out.insert(key, denom);
    }
    out
}

/// Attach `FlowAmountRatio = basis / group denominator` to every row.
///
/// Rows whose group has no usable (missing or zero) denominator, and rows
/// with no basis value, get a ratio of 1 so orphaned children pass through
/// instead of being zeroed.
pub fn proportional_ratios(
    records: &[FlowRecord],
    group_fields: &[GroupField],
    col: SectorColumn,
    basis: RatioBasis,
    cw: &SectorLengthCrosswalk,
) -> RatioTable {
    let denoms = denominators(records, group_fields, col, basis, cw);
    let mut unweighted: BTreeSet<GroupKey> = BTreeSet::new();

    let records = records
        .iter()
        .map(|r| {
            let key = r.key(group_fields);
            let ratio = match (basis.value(r), denoms.get(&key)) {
                (Some(v), Some(d)) if *d != 0.0 => v / d,
                (_, d) => {
                    if d.map_or(true, |d| *d == 0.0) {
                        unweighted.insert(key);
                    }
                    1.0
                }
            };
            let mut rec = r.clone();
            rec.flow_amount_ratio = Some(ratio);
            rec
        })
        .collect();

    RatioTable {
        records,
        unweighted_groups: unweighted.into_iter().collect(),
    }
}

/// Flag groups whose ratios do not add up.
///
/// The shallowest rank of each group must sum to one; deeper ranks may cover
/// only part of the hierarchy but must never exceed one.
pub fn check_allocation_ratios(
    records: &[FlowRecord],
    group_fields: &[GroupField],
    col: SectorColumn,
    cw: &SectorLengthCrosswalk,
    tolerance: f64,
) -> Vec<Diagnostic> {
    let mut found = Vec::new();
    for (key, idxs) in group_indices(records, group_fields) {
        let mut by_rank: BTreeMap<u8, f64> = BTreeMap::new();
        for &i in &idxs {
            let r = &records[i];
            if let (Some(code), Some(ratio)) = (r.sector(col), r.flow_amount_ratio) {
                *by_rank.entry(cw.depth_rank(code)).or_insert(0.0) += ratio;
            }
        }
        let Some(min_rank) = by_rank.keys().next().copied() else {
            continue;
        };
        for (rank, sum) in by_rank {
            let bad = if rank == min_rank {
                (sum - 1.0).abs() > tolerance
            } else {
                sum > 1.0 + tolerance
            };
            if bad {
                log::warn!("allocation ratios for {key} at rank {rank} sum to {sum}");
                found.push(Diagnostic::RatioOutOfTolerance {
                    group: key.to_string(),
                    rank,
                    sum,
                });
            }
        }
    }
    found
}

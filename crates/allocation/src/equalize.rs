//! Even splits for flows that no weighting data can distinguish.
//!
//! Every row produced here is marked [`Provenance::Estimated`].

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use sectorflow_core::sector::TOP_RANK;
use sectorflow_core::{FlowAmount, FlowRecord, GroupField, Provenance, SectorColumn, SectorLengthCrosswalk};

use crate::aggregate::{group_indices, non_sector_fields};
use crate::summary::{Diagnostic, Diagnostics};

/// Divide each row's amount by the number of rows sharing every non-sector
/// field, i.e. one activity mapped to several candidate sectors.
pub fn equal_allocation(records: &[FlowRecord]) -> Vec<FlowRecord> {
    let fields = GroupField::descriptive();
    let mut counts: FxHashMap<_, usize> = FxHashMap::default();
    for r in records {
        *counts.entry(r.key(&fields)).or_insert(0) += 1;
    }
    records
        .iter()
        .map(|r| {
            let n = counts.get(&r.key(&fields)).copied().unwrap_or(1);
            let mut rec = r.clone();
            if n > 1 {
                rec.flow_amount = rec.flow_amount.split(n);
                rec.provenance = Provenance::Estimated;
            }
            rec
        })
        .collect()
}

/// Push amounts down to `target_rank` where a branch has no data below it.
///
/// Walking from the top rank to the target, a row with no observed child one
/// rank deeper is replaced by an even split across every child the crosswalk
/// declares. Split rows are split again at the next rank, so each branch ends
/// at the target rank or at a crosswalk leaf. Rows with observed children are
/// kept as they are.
pub fn equally_allocate_parent_to_child(
    records: &[FlowRecord],
    col: SectorColumn,
    target_rank: u8,
    cw: &SectorLengthCrosswalk,
    diagnostics: &mut Diagnostics,
) -> Vec<FlowRecord> {
    let fields = non_sector_fields(col);
    let mut out = Vec::with_capacity(records.len());
    let mut per_rank: BTreeMap<u8, usize> = BTreeMap::new();

    for (_, idxs) in group_indices(records, &fields) {
        let mut present: FxHashSet<String> = FxHashSet::default();
        let mut by_rank: BTreeMap<u8, Vec<FlowRecord>> = BTreeMap::new();
        for &i in &idxs {
            match records[i].sector(col) {
                Some(code) => {
                    present.insert(code.to_string());
                    by_rank.entry(cw.depth_rank(code)).or_default().push(records[i].clone());
                }
                None => out.push(records[i].clone()),
            }
        }

        while let Some((rank, rows)) = by_rank.pop_first() {
            for rec in rows {
                let code = rec.sector(col).unwrap_or_default().to_string();
                let children = cw.crosswalk_children(&code);
                if rank >= target_rank
                    || rank < TOP_RANK
                    || children.is_empty()
                    || !cw.children_of(&code, &present).is_empty()
                {
                    out.push(rec);
                    continue;
                }
                let share = rec.flow_amount.split(children.len());
                for child in children {
                    let mut est = rec.with_sector(col, &child);
                    est.flow_amount = share;
                    est.provenance = Provenance::Estimated;
                    present.insert(child.clone());
                    by_rank.entry(cw.depth_rank(&child)).or_default().push(est);
                    *per_rank.entry(rank).or_insert(0) += 1;
                }
            }
        }
    }

    for (rank, rows) in per_rank {
        log::warn!(
            "data at rank {rank} not represented at rank {}; allocated equally to {rows} child rows",
            rank + 1
        );
        diagnostics.push(Diagnostic::EqualAllocation { rank, rows });
    }

    out
}

/// Estimate suppressed children from what their parent leaves unexplained.
///
/// For each parent with a numeric amount, `parent - sum(numeric children)`
/// (floored at zero) is split evenly across its suppressed children. A code
/// repeated within a group shares its part across its suppressed rows.
/// Processing is top-down, so an estimated child can in turn explain its own
/// suppressed children.
pub fn equally_allocate_suppressed_parent_to_child(
    records: &[FlowRecord],
    col: SectorColumn,
    cw: &SectorLengthCrosswalk,
    diagnostics: &mut Diagnostics,
) -> Vec<FlowRecord> {
    let fields = non_sector_fields(col);
    let mut out = records.to_vec();

    for (_, idxs) in group_indices(records, &fields) {
        let mut rows_of: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        let mut by_rank: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        for &i in &idxs {
            if let Some(code) = records[i].sector(col) {
                let rows = rows_of.entry(code.to_string()).or_default();
                if rows.is_empty() {
                    by_rank.entry(cw.depth_rank(code)).or_default().push(code.to_string());
                }
                rows.push(i);
            }
        }
        let present: FxHashSet<String> = rows_of.keys().cloned().collect();

        for codes in by_rank.values() {
            for code in codes {
                let parent_amount = match FlowAmount::sum(rows_of[code].iter().map(|&i| out[i].flow_amount)) {
                    FlowAmount::Value(v) => v,
                    FlowAmount::Suppressed => continue,
                };
                let children = cw.children_of(code, &present);
                let hidden: Vec<&String> = children
                    .iter()
                    .filter(|c| rows_of[c.as_str()].iter().any(|&i| out[i].flow_amount.is_suppressed()))
                    .collect();
                if hidden.is_empty() {
                    continue;
                }
                let explained: f64 = children
                    .iter()
                    .flat_map(|c| rows_of[c.as_str()].iter())
                    .filter_map(|&i| out[i].flow_amount.value())
                    .sum();
                let share = (parent_amount - explained).max(0.0) / hidden.len() as f64;
                for c in &hidden {
                    let suppressed: Vec<usize> = rows_of[c.as_str()]
                        .iter()
                        .copied()
                        .filter(|&i| out[i].flow_amount.is_suppressed())
                        .collect();
                    let per_row = share / suppressed.len() as f64;
                    for i in suppressed {
                        out[i].flow_amount = FlowAmount::Value(per_row);
                        out[i].provenance = Provenance::Estimated;
                    }
                }
                let location = out[rows_of[code][0]].location.clone();
                log::warn!("estimated {} suppressed children of {code} at {location}", hidden.len());
                diagnostics.push(Diagnostic::SuppressedEstimated {
                    location,
                    parent: code.clone(),
                    children: hidden.len(),
                });
            }
        }
    }

    out
}

//! Cross-geoscale merge of a primary table against secondary weights.
//!
//! The secondary's FlowAmount becomes the primary row's `helper_flow`.
//! Join keys depend on the two geoscales:
//!
//! | secondary | primary    | key                     |
//! |-----------|------------|-------------------------|
//! | state     | county     | (state prefix, sector)  |
//! | national  | any finer  | sector                  |
//! | otherwise |            | (location, sector)      |
//!
//! Extra merge fields (e.g. `FlowName`) join on both sides as-is.

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use sectorflow_core::geo::{rollup_location, state_prefix};
use sectorflow_core::{FlowRecord, Geoscale, GroupField, SectorColumn};

use crate::aggregate::{aggregate_by, sector_aggregation, stage_grouping_fields};
use crate::context::EngineContext;
use crate::summary::{Diagnostic, Diagnostics};

/// What a secondary table's FlowAmount means, which decides whether it may
/// be summed across locations or sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecondaryKind {
    /// Additive quantities (employment, acreage) used as shares.
    #[default]
    Weights,
    /// Per-unit factors applied by multiplication. Never summed.
    Rates,
}

/// Secondary weights prepared for one requested geoscale.
#[derive(Debug, Clone)]
pub struct SecondaryTable {
    pub source: String,
    pub year: i32,
    pub geoscale: Geoscale,
    pub kind: SecondaryKind,
    pub records: Vec<FlowRecord>,
    /// National rows used when a finer-grained match has no value. Empty when
    /// `geoscale` is already national.
    pub national: Vec<FlowRecord>,
}

impl SecondaryTable {
    /// Select `geoscale` rows and the national fallback rows from a freshly
    /// loaded table.
    ///
    /// Weights with no rows at a level are rolled up from finer data. Rates
    /// only ever use the rows published at each level: a table without
    /// explicit national rows has no national fallback.
    pub fn prepare(
        source: &str,
        year: i32,
        raw: &[FlowRecord],
        geoscale: Geoscale,
        kind: SecondaryKind,
        ctx: &EngineContext,
    ) -> Self {
        check_data_at_geoscale(raw, geoscale, source);
        let select = |scale: Geoscale| match kind {
            SecondaryKind::Weights => aggregate_to_geoscale(raw, scale, ctx),
            SecondaryKind::Rates => rows_at_geoscale(raw, scale),
        };
        let records = select(geoscale);
        let national = if geoscale == Geoscale::National {
            Vec::new()
        } else {
            select(Geoscale::National)
        };
        Self {
            source: source.to_string(),
            year,
            geoscale,
            kind,
            records,
            national,
        }
    }

    /// Apply `f` to the primary rows and the fallback rows alike. `f` is
    /// told the geoscale of the rows it receives.
    pub fn try_map<F, E>(&self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&[FlowRecord], Geoscale) -> Result<Vec<FlowRecord>, E>,
    {
        Ok(Self {
            source: self.source.clone(),
            year: self.year,
            geoscale: self.geoscale,
            kind: self.kind,
            records: f(&self.records, self.geoscale)?,
            national: if self.national.is_empty() {
                Vec::new()
            } else {
                f(&self.national, Geoscale::National)?
            },
        })
    }

    pub fn units(&self) -> BTreeSet<String> {
        self.records.iter().chain(&self.national).map(|r| r.unit.clone()).collect()
    }
}

/// True when `records` has at least one row at `geoscale`; logs otherwise.
pub fn check_data_at_geoscale(records: &[FlowRecord], geoscale: Geoscale, source: &str) -> bool {
    let found = records
        .iter()
        .any(|r| Geoscale::of_location(&r.location) == geoscale);
    if !found {
        log::info!("{source} has no {geoscale} level data; looking for finer-grained rows");
    }
    found
}

/// Rows published at exactly `geoscale`.
pub fn rows_at_geoscale(records: &[FlowRecord], geoscale: Geoscale) -> Vec<FlowRecord> {
    records
        .iter()
        .filter(|r| Geoscale::of_location(&r.location) == geoscale)
        .cloned()
        .collect()
}

/// Re-express a table at `geoscale`.
///
/// Rows already at `geoscale` are used when present. Otherwise the
/// next-finer level that has data is rolled up and summed; rows coarser than
/// `geoscale` are never used.
pub fn aggregate_to_geoscale(
    records: &[FlowRecord],
    geoscale: Geoscale,
    ctx: &EngineContext,
) -> Vec<FlowRecord> {
    let at = |scale: Geoscale| -> Vec<&FlowRecord> {
        records
            .iter()
            .filter(|r| Geoscale::of_location(&r.location) == scale)
            .collect()
    };

    let exact = at(geoscale);
    if !exact.is_empty() {
        return exact.into_iter().cloned().collect();
    }

    let finer = [Geoscale::State, Geoscale::County]
        .into_iter()
        .filter(|s| s.is_finer_than(geoscale))
        .map(at)
        .find(|rows| !rows.is_empty());
    let Some(rows) = finer else {
        log::warn!("no rows at or below {geoscale} level");
        return Vec::new();
    };

    let rolled: Vec<FlowRecord> = rows
        .into_iter()
        .map(|r| {
            let mut rec = r.clone();
            rec.location = if geoscale == Geoscale::National {
                ctx.national_location.clone()
            } else {
                rollup_location(&r.location, geoscale)
            };
            rec
        })
        .collect();
    log::debug!("rolled {} rows up to {geoscale} level", rolled.len());
    aggregate_by(&rolled, &stage_grouping_fields())
}

/// Options that change how a merge treats missing values.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Extra columns both tables must agree on.
    pub merge_fields: Vec<GroupField>,
    /// Treat a zero secondary value as missing, so the national value is used.
    pub zero_is_missing: bool,
    /// Let alternate-classification codes weight themselves.
    pub self_weight_alternates: bool,
    /// Sum secondary children into missing parent sectors before joining.
    /// Only meaningful for additive weights.
    pub aggregate_sectors: bool,
}

/// Primary rows split by whether a weight was found.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Rows with `helper_flow` set. Suppressed primary rows always land here.
    pub matched: Vec<FlowRecord>,
    pub unmatched: Vec<FlowRecord>,
}

type JoinKey = (Option<String>, String, Vec<Option<String>>);

fn join_location(location: &str, primary: Geoscale, secondary: Geoscale) -> Option<String> {
    match (secondary, primary) {
        (Geoscale::State, Geoscale::County) => Some(state_prefix(location).to_string()),
        (Geoscale::National, p) if p != Geoscale::National => None,
        _ => Some(location.to_string()),
    }
}

/// Sum of numeric secondary values per join key. Suppressed values are not
/// indexed; they count as missing.
fn index_secondary(
    records: &[FlowRecord],
    locate: impl Fn(&str) -> Option<String>,
    options: &MergeOptions,
    ctx: &EngineContext,
) -> FxHashMap<JoinKey, f64> {
    let mut index = FxHashMap::default();
    if records.is_empty() {
        return index;
    }
    let col = SectorColumn::primary(records);
    let aggregated;
    let rows = if options.aggregate_sectors {
        aggregated = sector_aggregation(records, col, &ctx.crosswalk);
        aggregated.as_slice()
    } else {
        records
    };
    let merge_fields = options.merge_fields.as_slice();
    for r in rows {
        let (Some(sector), Some(value)) = (r.sector(col), r.flow_amount.value()) else {
            continue;
        };
        let key = (locate(&r.location), sector.to_string(), r.key(merge_fields).0);
        *index.entry(key).or_insert(0.0) += value;
    }
    index
}

/// Attach secondary weights to `primary` as `helper_flow`.
///
/// With [`MergeOptions::self_weight_alternates`], codes in
/// [`EngineContext::alternate_codes`] weight themselves with their own
/// FlowAmount. A finer-grained miss falls back to the secondary's national
/// value for the same sector and records a [`Diagnostic::NationalFallback`].
pub fn merge_by_geoscale(
    primary: &[FlowRecord],
    col: SectorColumn,
    primary_scale: Geoscale,
    secondary: &SecondaryTable,
    options: &MergeOptions,
    ctx: &EngineContext,
    diagnostics: &mut Diagnostics,
) -> MergeResult {
    let secondary_scale = secondary.geoscale;
    let locate = |loc: &str| join_location(loc, primary_scale, secondary_scale);
    let index = index_secondary(&secondary.records, &locate, options, ctx);
    let national = index_secondary(&secondary.national, |_| None, options, ctx);

    let usable = |v: f64| !(options.zero_is_missing && v == 0.0);
    let mut result = MergeResult::default();

    for r in primary {
        let mut rec = r.clone();
        let Some(sector) = r.sector(col) else {
            result.unmatched.push(rec);
            continue;
        };

        if options.self_weight_alternates && ctx.is_alternate_code(sector) {
            rec.helper_flow = r.flow_amount.value();
            result.matched.push(rec);
            continue;
        }

        let extra = r.key(&options.merge_fields).0;
        let direct = index
            .get(&(locate(&r.location), sector.to_string(), extra.clone()))
            .copied()
            .filter(|v| usable(*v));
        let helper = match direct {
            Some(v) => Some(v),
            None if secondary_scale != Geoscale::National => {
                let fallback = national.get(&(None, sector.to_string(), extra)).copied();
                if fallback.is_some() {
                    log::warn!(
                        "no {secondary_scale} weight for {sector} at {}; using national value",
                        r.location
                    );
                    diagnostics.push(Diagnostic::NationalFallback {
                        location: r.location.clone(),
                        sector: sector.to_string(),
                    });
                }
                fallback
            }
            None => None,
        };

        rec.helper_flow = helper;
        if helper.is_some() || r.flow_amount.is_suppressed() {
            result.matched.push(rec);
        } else {
            result.unmatched.push(rec);
        }
    }

    log::debug!(
        "merged {} primary rows against {} {} rows: {} matched",
        primary.len(),
        secondary.records.len(),
        secondary.source,
        result.matched.len()
    );
    result
}

/// Record rows a stage could not carry forward.
pub fn check_data_loss(
    rows_before: usize,
    dropped: &[FlowRecord],
    col: SectorColumn,
    diagnostics: &mut Diagnostics,
) {
    if dropped.is_empty() {
        return;
    }
    let keys: BTreeSet<String> = dropped
        .iter()
        .map(|r| format!("{}/{}", r.location, r.sector(col).unwrap_or("-")))
        .collect();
    let keys: Vec<String> = keys.into_iter().collect();
    log::warn!(
        "{} of {rows_before} rows dropped for lack of secondary data: {}",
        dropped.len(),
        keys.join(", ")
    );
    diagnostics.push(Diagnostic::DataLossOnMerge {
        rows_before,
        rows_after: rows_before - dropped.len(),
        keys,
    });
}

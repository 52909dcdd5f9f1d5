//! Sector hierarchy backed by a length crosswalk.
//!
//! Depth is the crosswalk column a code first appears in, never the raw
//! string length: household and government codes (`F010`, `S00101`, ...)
//! repeat across columns and sit shallower than their length suggests.
//!
//! Each crosswalk row is one lineage, from the top-level code down to a leaf.
//! A code's parent is the previous column of a lineage when the code changes
//! between the two columns.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// Lowest depth rank of a sector code (two-digit NAICS sectors).
pub const TOP_RANK: u8 = 2;

#[derive(Debug, Default)]
pub struct SectorLengthCrosswalk {
    first_rank: u8,
    lineages: Vec<Vec<String>>,
    ranks: FxHashMap<String, u8>,
    parents: FxHashMap<String, String>,
    children: FxHashMap<String, BTreeSet<String>>,
    /// code -> indices of lineage rows containing it
    index: FxHashMap<String, Vec<usize>>,
    warned: Mutex<FxHashSet<String>>,
}

impl SectorLengthCrosswalk {
    /// Build from lineage rows. Column `i` of every row holds the code at
    /// rank `first_rank + i`; empty cells are skipped.
    pub fn from_lineages<I>(first_rank: u8, rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut cw = Self {
            first_rank,
            ..Default::default()
        };

        for row in rows {
            let row: Vec<String> = row.into_iter().map(|c| c.trim().to_string()).collect();
            if row.iter().all(|c| c.is_empty()) {
                continue;
            }
            let row_idx = cw.lineages.len();
            let mut seen_in_row: FxHashSet<&str> = FxHashSet::default();
            for (col, code) in row.iter().enumerate() {
                if code.is_empty() {
                    continue;
                }
                let rank = first_rank + col as u8;
                cw.ranks
                    .entry(code.clone())
                    .and_modify(|r| *r = (*r).min(rank))
                    .or_insert(rank);
                if seen_in_row.insert(code.as_str()) {
                    cw.index.entry(code.clone()).or_default().push(row_idx);
                }
                if col > 0 {
                    let prev = &row[col - 1];
                    if !prev.is_empty() && prev != code {
                        cw.parents.entry(code.clone()).or_insert_with(|| prev.clone());
                        cw.children.entry(prev.clone()).or_default().insert(code.clone());
                    }
                }
            }
            cw.lineages.push(row);
        }
        cw
    }

    /// Build lineages for purely numeric codes from string prefixes.
    ///
    /// Leaves shallower than the deepest code repeat down to the last column,
    /// the same convention the published crosswalks use.
    pub fn from_numeric_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let codes: BTreeSet<String> = codes.into_iter().map(|c| c.as_ref().trim().to_string()).collect();
        let max_len = codes.iter().map(String::len).max().unwrap_or(TOP_RANK as usize);
        let leaves = codes
            .iter()
            .filter(|c| !codes.iter().any(|o| o.len() > c.len() && o.starts_with(c.as_str())));

        let rows: Vec<Vec<String>> = leaves
            .map(|leaf| {
                (TOP_RANK as usize..=max_len)
                    .map(|len| leaf.get(..len).unwrap_or(leaf).to_string())
                    .collect()
            })
            .collect();
        Self::from_lineages(TOP_RANK, rows)
    }

    pub fn max_rank(&self) -> u8 {
        let width = self.lineages.iter().map(Vec::len).max().unwrap_or(0);
        if width == 0 {
            self.first_rank
        } else {
            self.first_rank + width as u8 - 1
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.ranks.contains_key(code)
    }

    /// Depth rank of `code`. Unknown codes rank as their own length.
    pub fn depth_rank(&self, code: &str) -> u8 {
        match self.ranks.get(code) {
            Some(r) => *r,
            None => {
                if self.warned.lock().insert(code.to_string()) {
                    log::warn!("sector '{code}' not in length crosswalk; using its length as depth");
                }
                code.chars().count() as u8
            }
        }
    }

    /// Parent code, one rank shallower. `None` for top-level codes.
    pub fn parent_of(&self, code: &str) -> Option<String> {
        if let Some(p) = self.parents.get(code) {
            return Some(p.clone());
        }
        if self.contains(code) || code.chars().count() <= TOP_RANK as usize {
            return None;
        }
        let mut chars = code.chars();
        chars.next_back();
        Some(chars.as_str().to_string())
    }

    /// Every child the crosswalk declares for `code`.
    pub fn crosswalk_children(&self, code: &str) -> BTreeSet<String> {
        self.children.get(code).cloned().unwrap_or_default()
    }

    /// Children of `code` that are present in `dataset`.
    pub fn children_of(&self, code: &str, dataset: &FxHashSet<String>) -> BTreeSet<String> {
        match self.children.get(code) {
            Some(children) => children.iter().filter(|c| dataset.contains(*c)).cloned().collect(),
            None => BTreeSet::new(),
        }
    }

    /// Ancestor (or the code itself) at `rank`.
    pub fn ancestor_at(&self, code: &str, rank: u8) -> Option<String> {
        let own = self.depth_rank(code);
        if rank > own {
            return None;
        }
        if rank == own {
            return Some(code.to_string());
        }
        // Ranks coarser than the crosswalk's first column come from the prefix.
        if let Some(rows) = self.index.get(code).filter(|_| rank >= self.first_rank) {
            let col = (rank - self.first_rank) as usize;
            return rows
                .iter()
                .find_map(|&i| self.lineages[i].get(col).filter(|c| !c.is_empty()).cloned());
        }
        code.get(..rank as usize).map(str::to_string)
    }

    /// Distinct codes at `rank` beneath `code`. A code that repeats down its
    /// lineage is its own descendant.
    pub fn descendants_at(&self, code: &str, rank: u8) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if rank < self.first_rank || rank < self.depth_rank(code) {
            return out;
        }
        let col = (rank - self.first_rank) as usize;
        if let Some(rows) = self.index.get(code) {
            for &i in rows {
                if let Some(c) = self.lineages[i].get(col).filter(|c| !c.is_empty()) {
                    out.insert(c.clone());
                }
            }
        }
        out
    }

    /// Every code that first appears at `rank`.
    pub fn codes_at(&self, rank: u8) -> BTreeSet<String> {
        self.ranks
            .iter()
            .filter(|(_, r)| **r == rank)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

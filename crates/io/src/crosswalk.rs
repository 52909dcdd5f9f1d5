// Sector length crosswalk CSV

use std::io::Read;
use std::path::Path;

use sectorflow_core::SectorLengthCrosswalk;

use crate::error::{LoadError, Result};
use crate::flows::read_file_as_utf8;

/// Depth rank of a `<prefix>_<rank>` header such as `NAICS_2`.
fn header_rank(header: &str) -> Option<u8> {
    header.rsplit_once('_')?.1.parse().ok()
}

/// Read a crosswalk whose columns are consecutive depth ranks
/// (`NAICS_2`, `NAICS_3`, ...). Each row is one lineage.
pub fn read_sector_length_crosswalk<R: Read>(reader: R) -> Result<SectorLengthCrosswalk> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();

    let ranks = headers
        .iter()
        .map(|h| header_rank(h).ok_or_else(|| LoadError::Header(format!("no depth rank in column '{h}'"))))
        .collect::<Result<Vec<u8>>>()?;
    let Some(&first_rank) = ranks.first() else {
        return Err(LoadError::Header("crosswalk has no columns".into()));
    };
    if ranks.iter().zip(first_rank..).any(|(&r, expected)| r != expected) {
        return Err(LoadError::Header(format!(
            "depth ranks must be consecutive, got {ranks:?}"
        )));
    }

    let mut rows = Vec::new();
    for row in rdr.records() {
        let row = row?;
        rows.push(row.iter().map(str::to_string).collect::<Vec<String>>());
    }
    log::debug!("read {} crosswalk lineages from rank {first_rank}", rows.len());
    Ok(SectorLengthCrosswalk::from_lineages(first_rank, rows))
}

pub fn read_sector_length_crosswalk_path(path: &Path) -> Result<SectorLengthCrosswalk> {
    let content = read_file_as_utf8(path)?;
    read_sector_length_crosswalk(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAICS: &str = "\
NAICS_2,NAICS_3,NAICS_4
11,111,1111
11,111,1112
11,112,1121
F0,F01,F010
F0,F01,F011
";

    #[test]
    fn ranks_come_from_headers() {
        let cw = read_sector_length_crosswalk(NAICS.as_bytes()).unwrap();
        assert_eq!(cw.depth_rank("11"), 2);
        assert_eq!(cw.depth_rank("111"), 3);
        assert_eq!(cw.depth_rank("F010"), 4);
        assert_eq!(cw.max_rank(), 4);
        assert_eq!(cw.parent_of("1121").as_deref(), Some("112"));
    }

    #[test]
    fn header_without_rank_is_rejected() {
        let err = read_sector_length_crosswalk("NAICS_2,Description\n11,Farms\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::Header(_)));
    }

    #[test]
    fn gaps_in_ranks_are_rejected() {
        let err = read_sector_length_crosswalk("NAICS_2,NAICS_4\n11,1111\n".as_bytes()).unwrap_err();
        assert!(matches!(err, LoadError::Header(_)));
    }
}

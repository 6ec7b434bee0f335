//! Startup state reconstruction from the data directory.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use super::Levels;
use crate::cache::BlockCache;
use crate::error::Result;
use crate::sst::Sst;

/// Parses `sst_<id>.<level>` out of a file name.
fn parse_sst_name(name: &str) -> Option<(u64, usize)> {
    let rest = name.strip_prefix("sst_")?;
    let (id_str, level_str) = rest.split_once('.')?;
    let id = id_str.parse::<u64>().ok()?;
    let level = level_str.parse::<usize>().ok()?;
    Some((id, level))
}

/// Scans the data directory for SST files and rebuilds the level map.
/// Returns the loaded levels and the next free sst id.
pub(super) fn load_levels(dir: &Path, cache: &Arc<BlockCache>) -> Result<(Levels, u64)> {
    let mut sst_ids: BTreeMap<usize, VecDeque<u64>> = BTreeMap::new();
    let mut ssts = HashMap::new();
    let mut max_level = 0;
    let mut max_id = 0;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((id, level)) = parse_sst_name(name) else {
            continue;
        };

        let sst = Sst::open(id, entry.path(), Arc::clone(cache))?;
        tracing::info!(sst_id = id, level, "loaded sst");

        max_id = max_id.max(id);
        max_level = max_level.max(level);
        sst_ids.entry(level).or_default().push_back(id);
        ssts.insert(id, sst);
    }

    for (level, ids) in sst_ids.iter_mut() {
        let mut sorted: Vec<u64> = ids.iter().copied().collect();
        sorted.sort_unstable();
        if *level == 0 {
            // L0 is ordered newest first; deeper levels ascend by first key,
            // which id order preserves.
            sorted.reverse();
        }
        *ids = sorted.into();
    }

    Ok((
        Levels {
            sst_ids,
            ssts,
            max_level,
        },
        max_id + 1,
    ))
}

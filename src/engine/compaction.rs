//! Full compaction between adjacent levels.
//!
//! Compaction merges *all* SSTs of a level with *all* SSTs of the next one
//! and rewrites the result as a fresh run of disjoint tables, so levels at
//! depth >= 1 always keep non-overlapping key ranges. Only the newest
//! visible version of each key survives; it is written back under its
//! original txn id. Tombstones are carried along rather than dropped, since
//! deeper levels may still hold versions they mask.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Levels, LsmEngine};
use crate::errdata;
use crate::error::Result;
use crate::iterator::{ConcatIterator, Entry, EntryStream, HeapIterator, TwoMergeIterator};
use crate::sst::{sst_path, Sst, SstBuilder, SstIterator};

/// Recursively compacts `level` into `level + 1`, cascading first when the
/// destination is itself over the ratio threshold. Caller holds the levels
/// write lock.
pub(super) fn full_compact(engine: &LsmEngine, levels: &mut Levels, level: usize) -> Result<()> {
    let next = level + 1;
    if levels.sst_ids.get(&next).map_or(0, |ids| ids.len()) >= engine.config.level_ratio {
        full_compact(engine, levels, next)?;
    }

    let src_ids: Vec<u64> = levels
        .sst_ids
        .get(&level)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default();
    let dst_ids: Vec<u64> = levels
        .sst_ids
        .get(&next)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default();
    if src_ids.is_empty() && dst_ids.is_empty() {
        return Ok(());
    }

    tracing::info!(
        source_level = level,
        target_level = next,
        source_tables = src_ids.len(),
        target_tables = dst_ids.len(),
        "starting full compaction"
    );

    let new_ssts = if level == 0 {
        compact_l0_into_l1(engine, levels, &src_ids, &dst_ids)?
    } else {
        compact_level_into_next(engine, levels, &src_ids, &dst_ids, next)?
    };

    // Retire the inputs: unmap and delete the files. Readers holding the
    // Arc handles keep the inodes alive until they finish.
    for id in src_ids.iter().chain(dst_ids.iter()) {
        if let Some(sst) = levels.ssts.remove(id) {
            if let Err(e) = sst.remove_file() {
                tracing::warn!(sst_id = id, error = %e, "failed to delete compacted sst file");
            }
        }
    }
    levels.sst_ids.insert(level, VecDeque::new());

    let dst = levels.sst_ids.entry(next).or_default();
    dst.clear();
    for sst in &new_ssts {
        // Generated in ascending key order with ascending ids.
        dst.push_back(sst.id());
    }
    for sst in new_ssts {
        levels.ssts.insert(sst.id(), sst);
    }
    levels.max_level = levels.max_level.max(next);

    tracing::info!(
        source_level = level,
        target_level = next,
        "finished full compaction"
    );
    Ok(())
}

fn sst_handles(levels: &Levels, ids: &[u64]) -> Result<Vec<Arc<Sst>>> {
    ids.iter()
        .map(|id| {
            levels
                .ssts
                .get(id)
                .cloned()
                .ok_or_else(|| errdata!("sst {id} missing from handle map"))
        })
        .collect()
}

/// L0 tables overlap, so they merge through a heap (newest table first)
/// before folding over the L1 concat stream.
fn compact_l0_into_l1(
    engine: &LsmEngine,
    levels: &Levels,
    l0_ids: &[u64],
    l1_ids: &[u64],
) -> Result<Vec<Arc<Sst>>> {
    let l0_sources: Vec<EntryStream> = sst_handles(levels, l0_ids)?
        .into_iter()
        .map(|sst| Box::new(SstIterator::new(sst, 0)) as EntryStream)
        .collect();
    let l0_heap = HeapIterator::new(l0_sources, false);

    let l1_concat = ConcatIterator::new(sst_handles(levels, l1_ids)?, 0);

    let merged = TwoMergeIterator::new(Box::new(l0_heap), Box::new(l1_concat), false);
    write_merged_run(engine, merged, 1)
}

/// Levels at depth >= 1 are disjoint within themselves, so both sides
/// stream through concat iterators.
fn compact_level_into_next(
    engine: &LsmEngine,
    levels: &Levels,
    src_ids: &[u64],
    dst_ids: &[u64],
    target_level: usize,
) -> Result<Vec<Arc<Sst>>> {
    let src_concat = ConcatIterator::new(sst_handles(levels, src_ids)?, 0);
    let dst_concat = ConcatIterator::new(sst_handles(levels, dst_ids)?, 0);

    let merged = TwoMergeIterator::new(Box::new(src_concat), Box::new(dst_concat), false);
    write_merged_run(engine, merged, target_level)
}

/// Streams a merged, ordered entry sequence into SSTs for `target_level`,
/// rotating whenever the builder reaches the level's target size.
fn write_merged_run(
    engine: &LsmEngine,
    merged: impl Iterator<Item = Result<Entry>>,
    target_level: usize,
) -> Result<Vec<Arc<Sst>>> {
    let target_size = engine.sst_size_for_level(target_level);
    let mut out = Vec::new();
    let mut builder = engine.new_sst_builder();

    for item in merged {
        let entry = item?;
        builder.add(&entry.key, &entry.value, entry.txn_id);

        if builder.estimated_size() >= target_size {
            let full = std::mem::replace(&mut builder, engine.new_sst_builder());
            out.push(build_one(engine, full, target_level)?);
        }
    }
    if !builder.is_empty() {
        out.push(build_one(engine, builder, target_level)?);
    }
    Ok(out)
}

fn build_one(engine: &LsmEngine, builder: SstBuilder, target_level: usize) -> Result<Arc<Sst>> {
    let sst_id = engine.next_sst_id.fetch_add(1, Ordering::SeqCst);
    let path = sst_path(&engine.config.dir, sst_id, target_level);
    let sst = builder.build(sst_id, path, Arc::clone(&engine.cache))?;
    tracing::debug!(sst_id, target_level, "compaction wrote sst");
    Ok(sst)
}

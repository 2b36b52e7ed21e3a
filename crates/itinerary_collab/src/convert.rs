//! Translation between the replicated container tree and the plain model.
//!
//! This is the only module that knows how days, blocks and comment threads
//! are laid out inside a [`Doc`]:
//!
//! ```text
//! days (array) ── day (map) { date, dayIndex, blocks (array) ── block (map) { id, title, ... } }
//! comments (map) ── <blockId> → thread (map) { id, isResolved, comments (array) ── comment (map) }
//! ```

use crate::doc::{Doc, Transaction};
use crate::model::{Block, BlockPatch, Comment, CommentThread, Coords, Day};
use crate::op_id::OpId;
use crate::value::{ContainerId, Value, COMMENTS_ROOT, DAYS_ROOT};
use std::collections::{BTreeMap, HashMap, HashSet};

const DATE: &str = "date";
const DAY_INDEX: &str = "dayIndex";
const BLOCKS: &str = "blocks";
const ID: &str = "id";
const START_TIME: &str = "startTime";
const END_TIME: &str = "endTime";
const TITLE: &str = "title";
const DESCRIPTION: &str = "description";
const TYPE: &str = "type";
const CATEGORY: &str = "category";
const DURATION_MIN: &str = "durationMin";
const COORDS: &str = "coords";
const LAT: &str = "lat";
const LNG: &str = "lng";
const IS_RESOLVED: &str = "isResolved";
const COMMENTS: &str = "comments";
const AUTHOR_ID: &str = "authorId";
const AUTHOR_NAME: &str = "authorName";
const AUTHOR_AVATAR: &str = "authorAvatar";
const CONTENT: &str = "content";
const TIMESTAMP: &str = "timestamp";

/// Where a day lives in the document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DayLocation {
    /// Element of the days array
    pub elem: OpId,
    pub map: ContainerId,
    pub blocks: ContainerId,
}

/// Where a block lives in the document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockLocation {
    pub day: DayLocation,
    /// Element of the day's blocks array
    pub elem: OpId,
    pub map: ContainerId,
}

fn string(doc: &Doc, map: ContainerId, key: &str) -> Option<String> {
    doc.map_get(map, key).and_then(Value::as_str).map(str::to_string)
}

fn string_or_default(doc: &Doc, map: ContainerId, key: &str) -> String {
    string(doc, map, key).unwrap_or_default()
}

/// Rebuild the full plain itinerary.
pub fn read_days(doc: &Doc) -> Vec<Day> {
    visible_blocks(doc)
        .into_iter()
        .map(|(location, blocks)| Day {
            date: string_or_default(doc, location.map, DATE),
            day_index: doc
                .map_get(location.map, DAY_INDEX)
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            blocks: blocks
                .into_iter()
                .filter_map(|(_, map)| read_block(doc, map))
                .collect(),
        })
        .collect()
}

/// Block elements of every day as the snapshot shows them.
///
/// Concurrent moves of one block can leave it in the sequence twice; only
/// the first occurrence of an id in the itinerary is kept.
fn visible_blocks(doc: &Doc) -> Vec<(DayLocation, Vec<(OpId, ContainerId)>)> {
    let mut seen = HashSet::new();
    days(doc)
        .into_iter()
        .map(|day| {
            let blocks = doc
                .array_elements(day.blocks)
                .into_iter()
                .filter_map(|(elem, value)| {
                    let map = value.as_map()?;
                    let id = doc.map_get(map, ID)?.as_str()?;
                    seen.insert(id.to_string()).then_some((elem, map))
                })
                .collect();
            (day, blocks)
        })
        .collect()
}

/// First day with the given date and its blocks as the snapshot shows them.
pub fn day_blocks(doc: &Doc, date: &str) -> Option<(DayLocation, Vec<(OpId, ContainerId)>)> {
    visible_blocks(doc)
        .into_iter()
        .find(|(day, _)| doc.map_get(day.map, DATE).and_then(Value::as_str) == Some(date))
}

/// A block map with no `id` is skipped.
pub fn read_block(doc: &Doc, map: ContainerId) -> Option<Block> {
    let id = string(doc, map, ID)?;
    let coords = doc
        .map_get(map, COORDS)
        .and_then(Value::as_map)
        .and_then(|coords| {
            Some(Coords {
                lat: doc.map_get(coords, LAT)?.as_f64()?,
                lng: doc.map_get(coords, LNG)?.as_f64()?,
            })
        });

    Some(Block {
        id,
        date: string_or_default(doc, map, DATE),
        start_time: string_or_default(doc, map, START_TIME),
        end_time: string_or_default(doc, map, END_TIME),
        title: string_or_default(doc, map, TITLE),
        description: string(doc, map, DESCRIPTION),
        block_type: string_or_default(doc, map, TYPE),
        category: string_or_default(doc, map, CATEGORY),
        duration_min: doc.map_get(map, DURATION_MIN).and_then(Value::as_i64),
        coords,
    })
}

/// All day locations in sequence order. Day maps without a blocks array are skipped.
pub fn days(doc: &Doc) -> Vec<DayLocation> {
    doc.array_elements(DAYS_ROOT)
        .into_iter()
        .filter_map(|(elem, value)| {
            let map = value.as_map()?;
            let blocks = doc.map_get(map, BLOCKS)?.as_array()?;
            Some(DayLocation { elem, map, blocks })
        })
        .collect()
}

/// First day with the given date.
pub fn find_day(doc: &Doc, date: &str) -> Option<DayLocation> {
    days(doc)
        .into_iter()
        .find(|day| doc.map_get(day.map, DATE).and_then(Value::as_str) == Some(date))
}

/// Linear scan of every day for a block id.
pub fn find_block(doc: &Doc, block_id: &str) -> Option<BlockLocation> {
    days(doc).into_iter().find_map(|day| {
        doc.array_elements(day.blocks)
            .into_iter()
            .find_map(|(elem, value)| {
                let map = value.as_map()?;
                (doc.map_get(map, ID).and_then(Value::as_str) == Some(block_id))
                    .then_some(BlockLocation { day, elem, map })
            })
    })
}

/// Every element holding the block, duplicates included.
pub fn find_block_copies(doc: &Doc, block_id: &str) -> Vec<BlockLocation> {
    days(doc)
        .into_iter()
        .flat_map(|day| {
            doc.array_elements(day.blocks)
                .into_iter()
                .filter_map(move |(elem, value)| {
                    let map = value.as_map()?;
                    (doc.map_get(map, ID).and_then(Value::as_str) == Some(block_id))
                        .then_some(BlockLocation { day, elem, map })
                })
        })
        .collect()
}

/// Block map container → block id, for every visible block.
pub fn block_map_ids(doc: &Doc) -> HashMap<ContainerId, String> {
    days(doc)
        .into_iter()
        .flat_map(|day| doc.array_elements(day.blocks))
        .filter_map(|(_, value)| {
            let map = value.as_map()?;
            Some((map, string(doc, map, ID)?))
        })
        .collect()
}

/// Append a day with all its blocks.
pub fn write_day(txn: &mut Transaction<'_>, day: &Day) -> Option<DayLocation> {
    let len = txn.array_len(DAYS_ROOT);
    // A new map's container id is its element id
    let map = txn.array_insert_map(DAYS_ROOT, len)?;
    let elem = map;
    txn.map_set(map, DATE, day.date.as_str());
    txn.map_set(map, DAY_INDEX, day.day_index);
    let blocks = txn.map_set_array(map, BLOCKS)?;
    for block in &day.blocks {
        write_block(txn, blocks, usize::MAX, block);
    }
    Some(DayLocation { elem, map, blocks })
}

/// Insert a block map at `index` (clamped) of a blocks array.
pub fn write_block(
    txn: &mut Transaction<'_>,
    blocks: ContainerId,
    index: usize,
    block: &Block,
) -> Option<ContainerId> {
    let map = txn.array_insert_map(blocks, index)?;
    write_block_fields(txn, map, block);
    Some(map)
}

/// Key-set every field of `block` into `map`.
pub fn write_block_fields(txn: &mut Transaction<'_>, map: ContainerId, block: &Block) {
    txn.map_set(map, ID, block.id.as_str());
    apply_patch(
        txn,
        map,
        &BlockPatch {
            date: Some(block.date.clone()),
            start_time: Some(block.start_time.clone()),
            end_time: Some(block.end_time.clone()),
            title: Some(block.title.clone()),
            description: block.description.clone(),
            block_type: Some(block.block_type.clone()),
            category: Some(block.category.clone()),
            duration_min: block.duration_min,
            coords: block.coords,
        },
    );
}

/// Key-set only the fields present in `patch`.
pub fn apply_patch(txn: &mut Transaction<'_>, map: ContainerId, patch: &BlockPatch) {
    let strings = [
        (DATE, &patch.date),
        (START_TIME, &patch.start_time),
        (END_TIME, &patch.end_time),
        (TITLE, &patch.title),
        (DESCRIPTION, &patch.description),
        (TYPE, &patch.block_type),
        (CATEGORY, &patch.category),
    ];
    for (key, value) in strings {
        if let Some(value) = value {
            txn.map_set(map, key, value.as_str());
        }
    }
    if let Some(duration) = patch.duration_min {
        txn.map_set(map, DURATION_MIN, duration);
    }
    if let Some(coords) = patch.coords {
        if let Some(nested) = txn.map_set_map(map, COORDS) {
            txn.map_set(nested, LAT, coords.lat);
            txn.map_set(nested, LNG, coords.lng);
        }
    }
}

/// Thread map for a block, if one was created.
pub fn find_thread(doc: &Doc, block_id: &str) -> Option<ContainerId> {
    doc.map_get(COMMENTS_ROOT, block_id).and_then(Value::as_map)
}

/// Thread map and its comments array, creating the thread if needed.
pub fn ensure_thread(txn: &mut Transaction<'_>, block_id: &str) -> Option<(ContainerId, ContainerId)> {
    if let Some(thread) = find_thread(txn, block_id) {
        if let Some(comments) = txn.map_get(thread, COMMENTS).and_then(Value::as_array) {
            return Some((thread, comments));
        }
    }
    let thread = txn.map_set_map(COMMENTS_ROOT, block_id)?;
    txn.map_set(thread, ID, block_id);
    txn.map_set(thread, IS_RESOLVED, false);
    let comments = txn.map_set_array(thread, COMMENTS)?;
    Some((thread, comments))
}

pub fn append_comment(txn: &mut Transaction<'_>, comments: ContainerId, comment: &Comment) {
    let Some(map) = txn.array_push_map(comments) else {
        return;
    };
    txn.map_set(map, ID, comment.id.as_str());
    txn.map_set(map, AUTHOR_ID, comment.author_id.as_str());
    txn.map_set(map, AUTHOR_NAME, comment.author_name.as_str());
    if let Some(avatar) = &comment.author_avatar {
        txn.map_set(map, AUTHOR_AVATAR, avatar.as_str());
    }
    txn.map_set(map, CONTENT, comment.content.as_str());
    txn.map_set(map, TIMESTAMP, comment.timestamp.as_str());
}

pub fn thread_resolved(doc: &Doc, thread: ContainerId) -> bool {
    doc.map_get(thread, IS_RESOLVED)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn set_thread_resolved(txn: &mut Transaction<'_>, thread: ContainerId, resolved: bool) {
    txn.map_set(thread, IS_RESOLVED, resolved);
}

/// Every comment thread keyed by block id.
pub fn read_threads(doc: &Doc) -> BTreeMap<String, CommentThread> {
    doc.map_entries(COMMENTS_ROOT)
        .into_iter()
        .filter_map(|(block_id, value)| {
            let thread = value.as_map()?;
            let comments = doc
                .map_get(thread, COMMENTS)
                .and_then(Value::as_array)
                .map(|array| {
                    doc.array_elements(array)
                        .into_iter()
                        .filter_map(|(_, value)| value.as_map())
                        .map(|map| read_comment(doc, map))
                        .collect()
                })
                .unwrap_or_default();
            Some((
                block_id.to_string(),
                CommentThread {
                    id: string(doc, thread, ID).unwrap_or_else(|| block_id.to_string()),
                    is_resolved: thread_resolved(doc, thread),
                    comments,
                },
            ))
        })
        .collect()
}

fn read_comment(doc: &Doc, map: ContainerId) -> Comment {
    Comment {
        id: string_or_default(doc, map, ID),
        author_id: string_or_default(doc, map, AUTHOR_ID),
        author_name: string_or_default(doc, map, AUTHOR_NAME),
        author_avatar: string(doc, map, AUTHOR_AVATAR),
        content: string_or_default(doc, map, CONTENT),
        timestamp: string_or_default(doc, map, TIMESTAMP),
    }
}

//! Adaptive batching of S7 reads.
//!
//! Batched items are partitioned by `(area, DB)`, sorted by byte offset and
//! greedily merged into contiguous runs: an item joins the current run when
//! the hole between the run's end and the item's start is at most the gap
//! threshold. A run ends at its last start plus the widest item it holds, so
//! `0(Int16), 4(Float), 500(Int16)` reads `[0, 504)`. Each run is fetched with
//! one read and every item decoded from its offset inside the returned buffer.

use crate::drivers::s7::address::{S7Area, S7Item, ADDRESS_LIMIT};
use crate::drivers::s7::codec::decode_item;
use crate::tags::structures::ValueVariant;
use std::collections::BTreeMap;

pub const DEFAULT_GAP_THRESHOLD: u32 = 500;

/// One merged read covering `[start, end)` of a single area/DB.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRun {
    pub area: S7Area,
    pub db: u16,
    pub start: u32,
    pub end: u32,
    /// Largest item width seen so far.
    widest: u32,
    pub items: Vec<S7Item>,
}

impl ReadRun {
    fn open(item: S7Item) -> Self {
        ReadRun {
            area: item.address.area,
            db: item.address.db,
            start: item.start(),
            end: item.end(),
            widest: item.byte_len() as u32,
            items: vec![item],
        }
    }

    fn extend(&mut self, item: S7Item) {
        self.widest = self.widest.max(item.byte_len() as u32);
        let reach = (item.start() + self.widest).min(ADDRESS_LIMIT);
        self.end = self.end.max(reach).max(item.end());
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Decode every item from a buffer holding `[start, end)`. Items that
    /// fail to decode come back as `None` without affecting their siblings.
    pub fn decode(&self, buf: &[u8]) -> Vec<(String, Result<ValueVariant, String>)> {
        self.items
            .iter()
            .map(|item| {
                let rel = (item.start() - self.start) as usize;
                (item.name.clone(), decode_item(item, buf, rel))
            })
            .collect()
    }
}

/// Group items into merged runs. Output is ordered by area, DB, then offset.
pub fn plan_runs(items: &[S7Item], gap_threshold: u32) -> Vec<ReadRun> {
    let mut partitions: BTreeMap<(S7Area, u16), Vec<S7Item>> = BTreeMap::new();
    for item in items {
        partitions
            .entry((item.address.area, item.address.db))
            .or_default()
            .push(item.clone());
    }

    let mut runs = Vec::new();
    for (_, mut members) in partitions {
        members.sort_by(|a, b| a.start().cmp(&b.start()).then_with(|| a.name.cmp(&b.name)));
        let mut current: Option<ReadRun> = None;
        for item in members {
            match current.as_mut() {
                Some(run) if item.start().saturating_sub(run.end) <= gap_threshold => {
                    run.extend(item);
                }
                _ => {
                    if let Some(done) = current.replace(ReadRun::open(item)) {
                        runs.push(done);
                    }
                }
            }
        }
        if let Some(done) = current {
            runs.push(done);
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::structures::{DataType, Tag};

    fn item(name: &str, address: &str, data_type: DataType) -> S7Item {
        let tag = Tag::new(name, address, data_type, "plc").with_attribute("batch_group", "g");
        S7Item::resolve(&tag).unwrap()
    }

    #[test]
    fn merges_within_gap_and_splits_beyond() {
        let items = vec![
            item("far", "DB1.DBW1200", DataType::Int16),
            item("a", "DB1.DBW0", DataType::Int16),
            item("b", "DB1.DBD4", DataType::Float),
            item("c", "DB1.DBW500", DataType::Int16),
        ];
        let runs = plan_runs(&items, DEFAULT_GAP_THRESHOLD);
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].start, runs[0].end), (0, 504));
        assert_eq!(runs[0].items.len(), 3);
        assert_eq!((runs[1].start, runs[1].end), (1200, 1202));
    }

    #[test]
    fn never_merges_across_db_or_area() {
        let items = vec![
            item("a", "DB1.DBW0", DataType::Int16),
            item("b", "DB2.DBW2", DataType::Int16),
            item("c", "MW4", DataType::Int16),
        ];
        assert_eq!(plan_runs(&items, DEFAULT_GAP_THRESHOLD).len(), 3);
    }

    #[test]
    fn overlapping_items_extend_the_run() {
        let items = vec![
            item("word", "DB3.DBW10", DataType::UInt16),
            item("bit", "DB3.DBX11.2", DataType::Boolean),
        ];
        let runs = plan_runs(&items, 0);
        assert_eq!(runs.len(), 1);
        assert_eq!((runs[0].start, runs[0].end), (10, 13));
    }

    #[test]
    fn run_end_uses_the_widest_member() {
        let items = vec![
            item("flag", "DB4.DBX0.0", DataType::Boolean),
            item("total", "DB4.DBD2", DataType::UInt32),
            item("state", "DB4.DBB10", DataType::Byte),
        ];
        let runs = plan_runs(&items, DEFAULT_GAP_THRESHOLD);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].len(), 14);
    }

    #[test]
    fn run_end_stops_at_the_address_limit() {
        let top = ADDRESS_LIMIT - 4;
        let items = vec![
            item("wide", &format!("DB1.DBD{}", top), DataType::UInt32),
            item("last", &format!("DB1.DBB{}", ADDRESS_LIMIT - 1), DataType::Byte),
        ];
        let runs = plan_runs(&items, DEFAULT_GAP_THRESHOLD);
        assert_eq!(runs[0].end, ADDRESS_LIMIT);
    }
}

//! In-memory cell store.
//!
//! The receiving side of the uploader: folds uploaded batches into per-cell
//! summaries and answers bounding-box queries for map display. Useful as a
//! local stand-in for the remote store and as the reference for the shape the
//! remote cell query returns.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use log::debug;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::grid::{cell_center, quantize};
use crate::upload::{BatchSink, PendingBatch, UploadRecord};
use crate::{Bounds, PulseKind, UploadError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellCenter {
    pub lat: f64,
    pub lng: f64,
}

/// How many uploaded records of each type landed in a cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStats {
    pub resting: u32,
    pub passing: u32,
}

/// Aggregated view of one cell across all uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellSummary {
    pub grid_id: String,
    pub center: CellCenter,
    /// Sum of uploaded intensity
    pub energy: u64,
    pub stats: CellStats,
    /// Distinct floors seen, ascending
    pub floors: Vec<i32>,
}

impl CellSummary {
    fn absorb(&mut self, record: &UploadRecord) {
        self.energy += record.intensity as u64;
        match record.kind {
            PulseKind::Resting => self.stats.resting += 1,
            PulseKind::Path => self.stats.passing += 1,
        }
        if let Err(pos) = self.floors.binary_search(&record.floor) {
            self.floors.insert(pos, record.floor);
        }
    }
}

/// Cell center in the R-tree, keyed back to its summary.
#[derive(Debug, Clone)]
struct CellPoint {
    grid_id: String,
    /// [lng, lat]
    position: [f64; 2],
}

impl RTreeObject for CellPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

#[derive(Default)]
struct StoreInner {
    cells: HashMap<String, CellSummary>,
    index: RTree<CellPoint>,
    batches: u64,
}

/// Thread-safe store of cell summaries.
#[derive(Default)]
pub struct CellStore {
    inner: Mutex<StoreInner>,
}

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a batch of records into the store.
    pub fn ingest(&self, records: &[UploadRecord]) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        inner.batches += 1;

        for record in records {
            let coord = quantize(record.lat, record.lng);
            let grid_id = format!("{}_{}", coord.0, coord.1);

            let summary = inner.cells.entry(grid_id.clone()).or_insert_with(|| {
                let center = cell_center(coord);
                inner.index.insert(CellPoint {
                    grid_id: grid_id.clone(),
                    position: [center.longitude, center.latitude],
                });
                CellSummary {
                    grid_id,
                    center: CellCenter { lat: center.latitude, lng: center.longitude },
                    energy: 0,
                    stats: CellStats::default(),
                    floors: Vec::new(),
                }
            });
            summary.absorb(record);
        }
        debug!("[CellStore] ingested {} records, {} cells total", records.len(), inner.cells.len());
    }

    /// Cells whose center lies inside `bounds`, highest energy first.
    pub fn query(&self, bounds: &Bounds) -> Vec<CellSummary> {
        let inner = self.lock();
        let envelope = AABB::from_corners([bounds.min_lng, bounds.min_lat], [bounds.max_lng, bounds.max_lat]);

        let mut found: Vec<CellSummary> = inner
            .index
            .locate_in_envelope(&envelope)
            .filter_map(|p| inner.cells.get(&p.grid_id).cloned())
            .collect();
        found.sort_by(|a, b| b.energy.cmp(&a.energy).then_with(|| a.grid_id.cmp(&b.grid_id)));
        found
    }

    pub fn get(&self, grid_id: &str) -> Option<CellSummary> {
        self.lock().cells.get(grid_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().cells.is_empty()
    }

    pub fn batches_received(&self) -> u64 {
        self.lock().batches
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BatchSink for CellStore {
    fn upload<'a>(&'a self, _token: &'a str, batch: &'a PendingBatch) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(async move {
            self.ingest(&batch.records());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{geo_utils, grid_id, GpsPoint};

    fn record(lat: f64, lng: f64, kind: PulseKind, intensity: u32, floor: i32) -> UploadRecord {
        UploadRecord { lat, lng, kind, intensity, floor }
    }

    #[test]
    fn test_ingest_aggregates_across_batches() {
        let store = CellStore::new();
        store.ingest(&[record(22.3, 114.17, PulseKind::Path, 3, 0)]);
        store.ingest(&[
            record(22.30002, 114.17001, PulseKind::Resting, 20, 4),
            record(22.3, 114.17, PulseKind::Resting, 5, 0),
        ]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.batches_received(), 2);

        let cell = store.get(&grid_id(22.3, 114.17)).unwrap();
        assert_eq!(cell.energy, 28);
        assert_eq!(cell.stats, CellStats { resting: 2, passing: 1 });
        assert_eq!(cell.floors, vec![0, 4]);
        assert_eq!(cell.center, CellCenter { lat: 22.3, lng: 114.17 });
    }

    #[test]
    fn test_query_bounding_box() {
        let store = CellStore::new();
        store.ingest(&[
            record(22.3000, 114.1700, PulseKind::Path, 1, 0),
            record(22.3010, 114.1700, PulseKind::Resting, 50, 0),
            record(22.4000, 114.1700, PulseKind::Resting, 99, 0),
        ]);

        let bounds = geo_utils::bounds_around(&GpsPoint::new(22.3005, 114.17), 200.0);
        let found = store.query(&bounds);

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].energy, 50);
        assert_eq!(found[1].energy, 1);
    }

    #[test]
    fn test_query_empty_store() {
        let store = CellStore::new();
        let bounds = Bounds { min_lat: -90.0, max_lat: 90.0, min_lng: -180.0, max_lng: 180.0 };
        assert!(store.query(&bounds).is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_summary_json_shape() {
        let store = CellStore::new();
        store.ingest(&[record(22.3, 114.17, PulseKind::Resting, 5, 1)]);
        let json = serde_json::to_value(store.get("223000_1141700").unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "gridId": "223000_1141700",
                "center": {"lat": 22.3, "lng": 114.17},
                "energy": 5,
                "stats": {"resting": 1, "passing": 0},
                "floors": [1],
            })
        );
    }

    #[tokio::test]
    async fn test_acts_as_batch_sink() {
        use crate::{GridAggregator, Pulse};

        let store = CellStore::new();
        let mut grid = GridAggregator::new();
        grid.merge(&Pulse::new(GpsPoint::new(22.3, 114.17), PulseKind::Resting, 0));
        let batch = PendingBatch::new(grid.drain(), 0);

        store.upload("tok", &batch).await.unwrap();
        assert_eq!(store.get("223000_1141700").unwrap().energy, 5);
    }
}

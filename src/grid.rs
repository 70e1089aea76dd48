//! Grid aggregation of pulses.
//!
//! Coordinates are quantized to 1/10,000 of a degree (~11m of latitude, ~10m of
//! longitude at mid latitudes) and every pulse landing in the same quantized
//! cell is folded into one [`GridCell`]:
//! - intensity is summed
//! - type only ever upgrades from `path` to `resting`
//! - floor follows the most recent pulse
//!
//! The table keeps first-insertion order so drained batches are stable.

use std::collections::HashMap;

use crate::{GpsPoint, Pulse, PulseKind};

/// Quantization steps per degree
pub const GRID_SCALE: f64 = 10_000.0;

/// Quantized cell coordinate (lat, lng)
pub type CellCoord = (i64, i64);

/// Convert lat/lng to quantized cell coordinates (round to nearest step).
pub fn quantize(lat: f64, lng: f64) -> CellCoord {
    ((lat * GRID_SCALE).round() as i64, (lng * GRID_SCALE).round() as i64)
}

/// Stable cell identifier for a coordinate.
///
/// ```
/// use pulse_grid::grid_id;
/// assert_eq!(grid_id(22.300004, 114.169996), "223000_1141700");
/// assert_eq!(grid_id(22.300004, 114.169996), grid_id(22.29996, 114.17003));
/// ```
pub fn grid_id(lat: f64, lng: f64) -> String {
    let (row, col) = quantize(lat, lng);
    format!("{}_{}", row, col)
}

/// Cell center for a quantized coordinate
pub fn cell_center(coord: CellCoord) -> GpsPoint {
    GpsPoint::new(coord.0 as f64 / GRID_SCALE, coord.1 as f64 / GRID_SCALE)
}

/// Accumulated energy for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub grid_id: String,
    /// Position of the pulse that created the cell
    pub latitude: f64,
    pub longitude: f64,
    pub kind: PulseKind,
    /// Sum of merged pulse intensities, always >= 1
    pub intensity: u32,
    pub floor: i32,
}

impl GridCell {
    fn from_pulse(grid_id: String, pulse: &Pulse) -> Self {
        Self {
            grid_id,
            latitude: pulse.latitude,
            longitude: pulse.longitude,
            kind: pulse.kind,
            intensity: pulse.intensity.max(1),
            floor: pulse.floor,
        }
    }

    fn absorb(&mut self, pulse: &Pulse) {
        self.intensity = self.intensity.saturating_add(pulse.intensity);
        self.kind = self.kind.max(pulse.kind);
        self.floor = pulse.floor;
    }
}

/// In-memory table of cells awaiting the next flush.
#[derive(Debug, Default)]
pub struct GridAggregator {
    cells: Vec<GridCell>,
    index: HashMap<String, usize>,
}

impl GridAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a pulse into its cell.
    pub fn merge(&mut self, pulse: &Pulse) {
        let id = grid_id(pulse.latitude, pulse.longitude);
        match self.index.get(&id) {
            Some(&slot) => self.cells[slot].absorb(pulse),
            None => {
                self.index.insert(id.clone(), self.cells.len());
                self.cells.push(GridCell::from_pulse(id, pulse));
            }
        }
    }

    /// Take every cell, leaving the table empty.
    pub fn drain(&mut self) -> Vec<GridCell> {
        self.index.clear();
        std::mem::take(&mut self.cells)
    }

    pub fn get(&self, grid_id: &str) -> Option<&GridCell> {
        self.index.get(grid_id).map(|&slot| &self.cells[slot])
    }

    /// Cells in first-insertion order
    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse(lat: f64, lng: f64, kind: PulseKind) -> Pulse {
        Pulse::new(GpsPoint::new(lat, lng), kind, 0)
    }

    #[test]
    fn test_grid_id_deterministic() {
        // Both round to (223000, 1141700)
        assert_eq!(grid_id(22.30001, 114.17004), grid_id(22.29996, 114.16996));
        assert_ne!(grid_id(22.3000, 114.1700), grid_id(22.3001, 114.1700));
    }

    #[test]
    fn test_grid_id_negative_coordinates() {
        assert_eq!(grid_id(-33.86882, 151.20930), "-338688_1512093");
        assert_eq!(grid_id(-0.00001, -0.00001), "0_0");
    }

    #[test]
    fn test_cell_size_is_roughly_ten_meters() {
        use crate::geo_utils::haversine_distance;
        let a = cell_center((223000, 1141700));
        let north = cell_center((223001, 1141700));
        let east = cell_center((223000, 1141701));
        let ns = haversine_distance(&a, &north);
        let ew = haversine_distance(&a, &east);
        assert!(ns > 10.0 && ns < 15.0, "ns {}", ns);
        assert!(ew > 9.0 && ew < 15.0, "ew {}", ew);
    }

    #[test]
    fn test_summation() {
        let mut grid = GridAggregator::new();
        for _ in 0..7 {
            grid.merge(&pulse(22.3, 114.17, PulseKind::Resting));
        }
        assert_eq!(grid.len(), 1);
        assert_eq!(grid.cells()[0].intensity, 35);
    }

    #[test]
    fn test_type_upgrade_is_monotonic() {
        let mut grid = GridAggregator::new();
        grid.merge(&pulse(22.3, 114.17, PulseKind::Path));
        let id = grid_id(22.3, 114.17);
        assert_eq!(grid.get(&id).unwrap().kind, PulseKind::Path);

        grid.merge(&pulse(22.3, 114.17, PulseKind::Resting));
        assert_eq!(grid.get(&id).unwrap().kind, PulseKind::Resting);

        for _ in 0..3 {
            grid.merge(&pulse(22.3, 114.17, PulseKind::Path));
        }
        let cell = grid.get(&id).unwrap();
        assert_eq!(cell.kind, PulseKind::Resting);
        assert_eq!(cell.intensity, 1 + 5 + 3);

        grid.drain();
        grid.merge(&pulse(22.3, 114.17, PulseKind::Path));
        assert_eq!(grid.get(&id).unwrap().kind, PulseKind::Path);
    }

    #[test]
    fn test_floor_follows_latest_and_position_follows_first() {
        let mut grid = GridAggregator::new();
        grid.merge(&Pulse::new(GpsPoint::new(22.30001, 114.17), PulseKind::Path, 2));
        grid.merge(&Pulse::new(GpsPoint::new(22.29998, 114.17), PulseKind::Path, 4));

        let cell = &grid.cells()[0];
        assert_eq!(cell.floor, 4);
        assert_eq!(cell.latitude, 22.30001);
    }

    #[test]
    fn test_drain_preserves_insertion_order_and_empties() {
        let mut grid = GridAggregator::new();
        grid.merge(&pulse(22.3002, 114.17, PulseKind::Path));
        grid.merge(&pulse(22.3000, 114.17, PulseKind::Path));
        grid.merge(&pulse(22.3001, 114.17, PulseKind::Path));
        grid.merge(&pulse(22.3002, 114.17, PulseKind::Path));

        let drained = grid.drain();
        let ids: Vec<_> = drained.iter().map(|c| c.grid_id.as_str()).collect();
        assert_eq!(ids, vec!["223002_1141700", "223000_1141700", "223001_1141700"]);
        assert!(grid.is_empty());
        assert!(grid.get("223002_1141700").is_none());
    }
}

//! Static route topology: stops, arcs, and the `(line, start stop, end stop)` arc index.
//!
//! Built once from the operator's route data and read-only afterwards, so it is shared
//! between tasks behind an `Arc` without synchronisation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A physical stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub short_name: String,
    pub long_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Travel direction of a line. The operator encodes it as orientation `0` (outbound) or `1` (return).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Return,
}

impl Direction {
    pub fn from_orientation(orientation: u32) -> Self {
        if orientation == 0 {
            Direction::Outbound
        } else {
            Direction::Return
        }
    }

    pub fn orientation(&self) -> u32 {
        match self {
            Direction::Outbound => 0,
            Direction::Return => 1,
        }
    }

    /// Code used inside arc ids.
    pub fn code(&self) -> &'static str {
        match self {
            Direction::Outbound => "IDA",
            Direction::Return => "VTA",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A stop's position in a line's stop sequence for one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct LineStop {
    pub line_id: String,
    pub stop_id: String,
    pub sequence: u32,
    pub direction: Direction,
}

/// Directed segment between two consecutive stops of a line and direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteArc {
    pub line_id: String,
    pub direction: Direction,
    pub start_sequence: u32,
    pub end_sequence: u32,
    pub start_stop_id: String,
    pub end_stop_id: String,
    /// Great-circle distance between the two stops; `0.0` when a stop position is unknown.
    pub distance_meters: f64,
}

impl RouteArc {
    /// `ARC_{line}_{direction}_{startSeq}_{endSeq}`
    pub fn arc_id(&self) -> String {
        format!(
            "ARC_{}_{}_{}_{}",
            self.line_id, self.direction, self.start_sequence, self.end_sequence
        )
    }
}

/// The full arc set plus an O(1) index by `(line, start stop, end stop)`.
#[derive(Debug, Clone, Default)]
pub struct ArcCatalog {
    stops: HashMap<String, Stop>,
    arcs: Vec<RouteArc>,
    /// line -> start stop -> end stop -> position in `arcs`
    index: HashMap<String, HashMap<String, HashMap<String, usize>>>,
}

impl ArcCatalog {
    /// Builds a catalog from an explicit arc set. When two arcs share a `(line, start, end)`
    /// key (both directions serving the same stop pair), the first one wins the index slot.
    pub fn new(stops: Vec<Stop>, arcs: Vec<RouteArc>) -> Self {
        let mut index: HashMap<String, HashMap<String, HashMap<String, usize>>> = HashMap::new();
        for (i, arc) in arcs.iter().enumerate() {
            index
                .entry(arc.line_id.clone())
                .or_default()
                .entry(arc.start_stop_id.clone())
                .or_default()
                .entry(arc.end_stop_id.clone())
                .or_insert(i);
        }

        let stops = stops.into_iter().map(|s| (s.id.clone(), s)).collect();

        Self { stops, arcs, index }
    }

    /// Builds arcs from line stop sequences: group by `(line, direction)`, sort by sequence,
    /// and connect each consecutive pair.
    pub fn from_line_stops(stops: Vec<Stop>, line_stops: Vec<LineStop>) -> Self {
        let positions: HashMap<&str, (f64, f64)> = stops
            .iter()
            .map(|s| (s.id.as_str(), (s.latitude, s.longitude)))
            .collect();

        let mut groups: HashMap<(&str, Direction), Vec<&LineStop>> = HashMap::new();
        for ls in &line_stops {
            groups
                .entry((ls.line_id.as_str(), ls.direction))
                .or_default()
                .push(ls);
        }

        let mut keys: Vec<_> = groups.keys().copied().collect();
        keys.sort_by(|a, b| a.0.cmp(b.0).then(a.1.orientation().cmp(&b.1.orientation())));

        let mut arcs = Vec::new();
        for key in keys {
            let Some(sequence) = groups.get_mut(&key) else {
                continue;
            };
            sequence.sort_by_key(|ls| ls.sequence);

            for pair in sequence.windows(2) {
                let (start, end) = (pair[0], pair[1]);
                let distance_meters = match (
                    positions.get(start.stop_id.as_str()),
                    positions.get(end.stop_id.as_str()),
                ) {
                    (Some(&(lat1, lon1)), Some(&(lat2, lon2))) => {
                        haversine_meters(lat1, lon1, lat2, lon2)
                    }
                    _ => 0.0,
                };

                arcs.push(RouteArc {
                    line_id: start.line_id.clone(),
                    direction: start.direction,
                    start_sequence: start.sequence,
                    end_sequence: end.sequence,
                    start_stop_id: start.stop_id.clone(),
                    end_stop_id: end.stop_id.clone(),
                    distance_meters,
                });
            }
        }

        Self::new(stops, arcs)
    }

    /// Looks up the arc a vehicle traverses when moving from `start_stop` to `end_stop` on `line`.
    pub fn find(&self, line_id: &str, start_stop: &str, end_stop: &str) -> Option<&RouteArc> {
        self.index
            .get(line_id)?
            .get(start_stop)?
            .get(end_stop)
            .map(|&i| &self.arcs[i])
    }

    pub fn arcs(&self) -> &[RouteArc] {
        &self.arcs
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.len()
    }

    pub fn arc_count(&self) -> usize {
        self.arcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arcs.is_empty()
    }
}

/// Great-circle distance in meters between two decimal-degree coordinates.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(id: &str, lat: f64, lon: f64) -> Stop {
        Stop {
            id: id.to_string(),
            short_name: id.to_string(),
            long_name: format!("Stop {}", id),
            latitude: lat,
            longitude: lon,
        }
    }

    fn line_stop(line: &str, stop: &str, seq: u32, orientation: u32) -> LineStop {
        LineStop {
            line_id: line.to_string(),
            stop_id: stop.to_string(),
            sequence: seq,
            direction: Direction::from_orientation(orientation),
        }
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_meters(3.45, -76.53, 3.45, -76.53), 0.0);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let d = haversine_meters(0.0, 0.0, 1.0, 0.0);
        // 2 * pi * R / 360
        assert!((d - 111_194.9).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_arc_id_format() {
        let arc = RouteArc {
            line_id: "A01".to_string(),
            direction: Direction::Return,
            start_sequence: 4,
            end_sequence: 5,
            start_stop_id: "s4".to_string(),
            end_stop_id: "s5".to_string(),
            distance_meters: 10.0,
        };
        assert_eq!(arc.arc_id(), "ARC_A01_VTA_4_5");
    }

    #[test]
    fn test_from_line_stops_builds_consecutive_arcs() {
        let stops = vec![stop("s1", 3.40, -76.50), stop("s2", 3.41, -76.50), stop("s3", 3.42, -76.50)];
        // Deliberately out of order.
        let line_stops = vec![
            line_stop("L1", "s3", 3, 0),
            line_stop("L1", "s1", 1, 0),
            line_stop("L1", "s2", 2, 0),
            line_stop("L1", "s3", 1, 1),
            line_stop("L1", "s1", 2, 1),
        ];

        let catalog = ArcCatalog::from_line_stops(stops, line_stops);

        assert_eq!(catalog.arc_count(), 3);
        let ids: Vec<String> = catalog.arcs().iter().map(RouteArc::arc_id).collect();
        assert_eq!(ids, vec!["ARC_L1_IDA_1_2", "ARC_L1_IDA_2_3", "ARC_L1_VTA_1_2"]);

        let arc = catalog.find("L1", "s1", "s2").unwrap();
        assert!(arc.distance_meters > 1000.0 && arc.distance_meters < 1200.0);

        assert!(catalog.find("L1", "s2", "s1").is_none());
        assert!(catalog.find("L2", "s1", "s2").is_none());
        assert!(catalog.find("L1", "s3", "s1").is_some());
    }

    #[test]
    fn test_unknown_stop_gives_zero_distance() {
        let stops = vec![stop("s1", 3.40, -76.50)];
        let line_stops = vec![line_stop("L1", "s1", 1, 0), line_stop("L1", "ghost", 2, 0)];

        let catalog = ArcCatalog::from_line_stops(stops, line_stops);

        assert_eq!(catalog.find("L1", "s1", "ghost").unwrap().distance_meters, 0.0);
    }
}

use std::collections::BTreeMap;

use crate::catalog::ArcCatalog;
use crate::model::{ArcVelocity, Datagram, TripKey};
use crate::velocity::utility::{mean, meters_per_second};

/// Upper bound (exclusive) on an accepted sample, in meters per second (180 km/h).
///
/// This is an outlier filter for corrupt odometer/clock data, not a physical limit.
pub const DEFAULT_MAX_VELOCITY_MPS: f64 = 50.0;

/// Accepted velocity samples for one arc.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArcSamples {
    pub line_id: String,
    pub samples: Vec<f64>,
}

impl ArcSamples {
    pub fn count(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Plain arithmetic mean; no weighting and no trimming.
    pub fn mean(&self) -> f64 {
        mean(&self.samples)
    }
}

/// Pure per-arc velocity computation over a batch of datagrams.
#[derive(Debug, Clone)]
pub struct VelocityComputer {
    max_velocity_mps: f64,
}

impl Default for VelocityComputer {
    fn default() -> Self {
        Self::new()
    }
}

impl VelocityComputer {
    pub fn new() -> Self {
        Self {
            max_velocity_mps: DEFAULT_MAX_VELOCITY_MPS,
        }
    }

    pub fn with_max_velocity(max_velocity_mps: f64) -> Self {
        Self { max_velocity_mps }
    }

    /// Computes accepted velocity samples per arc id.
    ///
    /// Datagrams are grouped by `(vehicle, trip, line)` and sorted by timestamp (stable,
    /// so ties keep input order). Every consecutive pair is matched against the catalog
    /// by `(line, first stop, second stop)`; unmatched pairs are skipped. With an empty
    /// catalog, pairs between distinct stops get a synthetic `RAW_{line}_{from}_{to}` id
    /// and only odometer distances are usable.
    pub fn compute(
        &self,
        datagrams: &[Datagram],
        catalog: &ArcCatalog,
    ) -> BTreeMap<String, ArcSamples> {
        let mut velocities: BTreeMap<String, ArcSamples> = BTreeMap::new();

        for trip in group_trips(datagrams).values() {
            for pair in trip.windows(2) {
                let (d1, d2) = (pair[0], pair[1]);

                let Some((arc_id, arc_distance)) = match_arc(catalog, d1, d2) else {
                    continue;
                };

                if let Some(velocity) = self.pair_velocity(d1, d2, arc_distance) {
                    velocities
                        .entry(arc_id)
                        .or_insert_with(|| ArcSamples {
                            line_id: d1.line_id.clone(),
                            samples: Vec::new(),
                        })
                        .samples
                        .push(velocity);
                }
            }
        }

        velocities
    }

    /// Velocity of a consecutive pair, or `None` when the pair is rejected.
    ///
    /// Distance comes from the odometer when both readings are present and it advanced,
    /// otherwise from the arc. A reading of `0.0` means the odometer was not reported.
    fn pair_velocity(&self, d1: &Datagram, d2: &Datagram, arc_distance: f64) -> Option<f64> {
        let seconds = (d2.timestamp - d1.timestamp).num_seconds();
        if seconds <= 0 {
            return None;
        }

        let odometer_valid = d1.odometer_meters > 0.0
            && d2.odometer_meters > 0.0
            && d2.odometer_meters > d1.odometer_meters;
        let distance = if odometer_valid {
            d2.odometer_meters - d1.odometer_meters
        } else {
            arc_distance
        };
        if distance <= 0.0 {
            return None;
        }

        let velocity = meters_per_second(distance, seconds);
        (velocity > 0.0 && velocity < self.max_velocity_mps).then_some(velocity)
    }
}

/// Per-arc summaries ordered by arc id.
pub fn summarize(velocities: &BTreeMap<String, ArcSamples>) -> Vec<ArcVelocity> {
    velocities
        .iter()
        .map(|(arc_id, samples)| ArcVelocity {
            arc_id: arc_id.clone(),
            line_id: samples.line_id.clone(),
            average_velocity: samples.mean(),
            sample_count: samples.count(),
        })
        .collect()
}

fn group_trips(datagrams: &[Datagram]) -> BTreeMap<TripKey<'_>, Vec<&Datagram>> {
    let mut trips: BTreeMap<TripKey<'_>, Vec<&Datagram>> = BTreeMap::new();
    for d in datagrams {
        trips.entry(d.trip_key()).or_default().push(d);
    }
    for trip in trips.values_mut() {
        trip.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    trips
}

fn match_arc(catalog: &ArcCatalog, d1: &Datagram, d2: &Datagram) -> Option<(String, f64)> {
    if catalog.is_empty() {
        if d1.stop_id == d2.stop_id {
            return None;
        }
        return Some((
            format!("RAW_{}_{}_{}", d1.line_id, d1.stop_id, d2.stop_id),
            0.0,
        ));
    }

    catalog
        .find(&d1.line_id, &d1.stop_id, &d2.stop_id)
        .map(|arc| (arc.arc_id(), arc.distance_meters))
}

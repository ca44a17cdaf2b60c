/// Computes the arithmetic mean of a slice of values. Returns 0.0 for empty input.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Velocity in meters per second from a distance and a whole-second interval.
/// Returns 0.0 when the interval is not positive.
pub fn meters_per_second(distance_meters: f64, seconds: i64) -> f64 {
    if seconds <= 0 {
        return 0.0;
    }
    distance_meters / seconds as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_empty() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_mean_values() {
        assert_eq!(mean(&[8.0, 12.0]), 10.0);
    }

    #[test]
    fn test_meters_per_second() {
        assert_eq!(meters_per_second(100.0, 10), 10.0);
        assert_eq!(meters_per_second(100.0, 0), 0.0);
        assert_eq!(meters_per_second(100.0, -5), 0.0);
    }
}

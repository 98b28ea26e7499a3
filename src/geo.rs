use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Geographic coordinates in decimal degrees.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Haversine distance in kilometers between two points.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

fn round_2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Keeps the items within `radius_km` of `origin`, paired with their distance
/// (rounded to two decimals), nearest first.
pub fn within_radius<T, F>(items: Vec<T>, origin: &Coordinates, radius_km: f64, position: F) -> Vec<(T, f64)>
where
    F: Fn(&T) -> Coordinates,
{
    let mut nearby: Vec<(T, f64)> = items
        .into_iter()
        .map(|item| {
            let distance = round_2(origin.distance_km(&position(&item)));
            (item, distance)
        })
        .filter(|(_, distance)| *distance <= radius_km)
        .collect();

    nearby.sort_by(|a, b| a.1.total_cmp(&b.1));
    nearby
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_same_point() {
        let p = Coordinates::new(19.0760, 72.8777);
        assert!(p.distance_km(&p).abs() < 0.001);
    }

    #[test]
    fn distance_mumbai_to_pune() {
        let mumbai = Coordinates::new(19.0760, 72.8777);
        let pune = Coordinates::new(18.5204, 73.8567);
        let dist = mumbai.distance_km(&pune);
        // Roughly 120 km as the crow flies
        assert!((dist - 120.0).abs() < 5.0, "got {dist}");
        assert!((dist - pune.distance_km(&mumbai)).abs() < 1e-9);
    }

    #[test]
    fn radius_filter_drops_far_items_and_sorts() {
        let origin = Coordinates::new(19.0760, 72.8777);
        let items = vec![
            ("pune", Coordinates::new(18.5204, 73.8567)),
            ("thane", Coordinates::new(19.2183, 72.9781)),
            ("delhi", Coordinates::new(28.7041, 77.1025)),
            ("here", Coordinates::new(19.0760, 72.8777)),
        ];

        let nearby = within_radius(items, &origin, 50.0, |(_, c)| *c);
        let names: Vec<_> = nearby.iter().map(|((name, _), _)| *name).collect();
        assert_eq!(names, vec!["here", "thane"]);
        assert_eq!(nearby[0].1, 0.0);
        assert!(nearby[1].1 > 0.0 && nearby[1].1 <= 50.0);
    }

    #[test]
    fn distances_are_rounded() {
        let origin = Coordinates::new(0.0, 0.0);
        let nearby = within_radius(vec![Coordinates::new(0.0, 0.1)], &origin, 100.0, |c| *c);
        let d = nearby[0].1;
        assert_eq!(d, (d * 100.0).round() / 100.0);
    }

    #[test]
    fn validates_ranges() {
        assert!(Coordinates::new(90.0, -180.0).is_valid());
        assert!(!Coordinates::new(90.5, 0.0).is_valid());
        assert!(!Coordinates::new(0.0, 181.0).is_valid());
        assert!(!Coordinates::new(f64::NAN, 0.0).is_valid());
    }
}

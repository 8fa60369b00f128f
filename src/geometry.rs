//! Periodic-box distance helpers shared by the node culler and the neighbour visitors.

use nalgebra::{Point3, Vector3};

/// `(sqrt(3) - 1) / 2`, the correction that turns a cube's half-width into the radius of the
/// minimal enclosing sphere.
pub const FACT1: f64 = 0.366_025_403_785_f64;

/// Folds `delta` back into `[-box_size/2, box_size/2]`. A `box_size <= 0.0` disables wrapping,
/// which lets callers use the same code path for a non-periodic domain.
#[inline]
pub fn nearest_image(delta: f64, box_size: f64) -> f64 {
    if box_size <= 0.0 {
        return delta;
    }
    if delta > 0.5 * box_size {
        delta - box_size
    } else if delta < -0.5 * box_size {
        delta + box_size
    } else {
        delta
    }
}

/// The periodic displacement `a - b`, axis by axis.
#[inline]
pub fn periodic_displacement(a: &Point3<f64>, b: &Point3<f64>, box_size: f64) -> Vector3<f64> {
    Vector3::new(
        nearest_image(a.x - b.x, box_size),
        nearest_image(a.y - b.y, box_size),
        nearest_image(a.z - b.z, box_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_around_half_box() {
        assert_eq!(nearest_image(0.9, 1.0), 0.9 - 1.0);
        assert_eq!(nearest_image(-0.9, 1.0), -0.9 + 1.0);
        assert_eq!(nearest_image(0.3, 1.0), 0.3);
    }

    #[test]
    fn disabled_for_non_positive_box() {
        assert_eq!(nearest_image(5.0, 0.0), 5.0);
        assert_eq!(nearest_image(-5.0, -1.0), -5.0);
    }
}

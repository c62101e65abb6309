//! The camera/frustum interface the core consumes (spec §6). The actual
//! frustum math and eye tracking live in the host's camera library; the core
//! only needs the ability to test a bounding sphere and read eye/lon-lat
//! state.

use glam::DVec3;

use crate::geodesy::{BoundingSphere, LonLat};
use crate::node::NodeHandle;

/// Host-provided frustum test, kept as a trait so the core never depends on
/// a concrete frustum/projection-matrix representation.
pub trait Frustum {
    fn contains_sphere(&self, sphere: &BoundingSphere) -> bool;
}

/// A frustum that always/never reports visible, useful for tests and for
/// hosts that want to force a full-tree render.
#[derive(Copy, Clone, Debug)]
pub struct AlwaysVisible;

impl Frustum for AlwaysVisible {
    fn contains_sphere(&self, _sphere: &BoundingSphere) -> bool {
        true
    }
}

/// A frustum that tests sphere containment against a simple view distance,
/// useful for tests that want *some* discrimination without a real
/// projection matrix.
#[derive(Copy, Clone, Debug)]
pub struct DistanceFrustum {
    pub eye: DVec3,
    pub max_distance: f64,
}

impl Frustum for DistanceFrustum {
    fn contains_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.eye.distance(sphere.center) - sphere.radius < self.max_distance
    }
}

/// Camera state for a single frame, matching `renderer.activeCamera` in
/// spec §6.
pub struct Camera<'a> {
    pub frustum: &'a dyn Frustum,
    pub eye: DVec3,
    /// Ground position in plain lon/lat.
    pub lon_lat: LonLat,
    /// Ground position re-projected to mercator.
    pub lon_lat_merc: LonLat,
    /// Set by traversal when the camera's ground position falls inside a
    /// node's extent (host convenience, spec §4.3 step 2).
    pub inside_segment: Option<NodeHandle>,
}

impl<'a> Camera<'a> {
    pub fn new(frustum: &'a dyn Frustum, eye: DVec3, lon_lat: LonLat) -> Self {
        let lon_lat_merc = lon_lat.to_mercator();
        Self { frustum, eye, lon_lat, lon_lat_merc, inside_segment: None }
    }

    /// Altitude above the ellipsoid, in meters.
    pub fn altitude(&self) -> f64 {
        self.lon_lat.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_frustum_respects_cutoff() {
        let frustum = DistanceFrustum { eye: DVec3::ZERO, max_distance: 10.0 };
        let near = BoundingSphere::new(DVec3::new(5.0, 0.0, 0.0), 1.0);
        let far = BoundingSphere::new(DVec3::new(100.0, 0.0, 0.0), 1.0);
        assert!(frustum.contains_sphere(&near));
        assert!(!frustum.contains_sphere(&far));
    }
}

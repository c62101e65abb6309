//! Projection & geodesy utilities: lon/lat extents, web-mercator conversion,
//! and the pole/ellipsoid constants the rest of the crate is built on.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// Longitude at the antimeridian / cube edge, in degrees. Also the value used
/// for the polar-wrap equality checks in [`crate::node::common_side`].
pub const POLE: f64 = 180.0;

/// Maximum latitude representable in web-mercator before the projection
/// diverges, in degrees (`atan(sinh(pi))`).
pub const MAX_LAT: f64 = 85.051_128_779_8;

/// WGS84-ish equatorial radius used when no more specific ellipsoid is given,
/// in meters. Hosts are expected to override this via [`crate::config::EngineConfig`].
pub const DEFAULT_EQUATORIAL_RADIUS: f64 = 6_378_137.0;

/// A geographic coordinate in degrees.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LonLat {
    pub lon: f64,
    pub lat: f64,
    /// Height above the ellipsoid, in meters. Only meaningful for camera
    /// positions; tile corners are always at height zero.
    pub height: f64,
}

impl LonLat {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat, height: 0.0 }
    }

    pub fn with_height(lon: f64, lat: f64, height: f64) -> Self {
        Self { lon, lat, height }
    }

    /// Projects this lon/lat (degrees) to web-mercator (still expressed as a
    /// `LonLat` whose `lat` field now holds the mercator northing in degrees,
    /// matching the source engine's convention of reusing the same struct for
    /// both projections).
    pub fn to_mercator(self) -> LonLat {
        let lat = self.lat.clamp(-MAX_LAT, MAX_LAT).to_radians();
        let merc_lat = lat.tan().asinh().to_degrees();
        LonLat { lon: self.lon, lat: merc_lat, height: self.height }
    }

    /// Inverse of [`LonLat::to_mercator`].
    pub fn from_mercator(self) -> LonLat {
        let lat = self.lat.to_radians().sinh().atan().to_degrees();
        LonLat { lon: self.lon, lat, height: self.height }
    }

    /// Cartesian position on a sphere of the given radius, ellipsoid-centered.
    pub fn to_cartesian(self, radius: f64) -> DVec3 {
        let lon = self.lon.to_radians();
        let lat = self.lat.to_radians();
        let r = radius + self.height;
        DVec3::new(
            r * lat.cos() * lon.cos(),
            r * lat.cos() * lon.sin(),
            r * lat.sin(),
        )
    }
}

/// The two projections the core has to reason about. Tiles above
/// [`MAX_LAT`]/below `-MAX_LAT` are always [`Projection::Epsg4326`] (the polar
/// cap); everything else is [`Projection::Epsg3857`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// Web-mercator.
    Epsg3857,
    /// Plate carrée / equirectangular.
    Epsg4326,
}

/// An axis-aligned lon/lat rectangle. Invariant: `sw.lon <= ne.lon` and
/// `sw.lat <= ne.lat`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub south_west: LonLat,
    pub north_east: LonLat,
}

impl Extent {
    pub fn new(south_west: LonLat, north_east: LonLat) -> Self {
        debug_assert!(south_west.lon <= north_east.lon);
        debug_assert!(south_west.lat <= north_east.lat);
        Self { south_west, north_east }
    }

    pub fn whole_globe() -> Self {
        Self::new(LonLat::new(-POLE, -90.0), LonLat::new(POLE, 90.0))
    }

    pub fn width(&self) -> f64 {
        self.north_east.lon - self.south_west.lon
    }

    pub fn height(&self) -> f64 {
        self.north_east.lat - self.south_west.lat
    }

    pub fn center(&self) -> LonLat {
        LonLat::new(
            self.south_west.lon + self.width() * 0.5,
            self.south_west.lat + self.height() * 0.5,
        )
    }

    /// Half-point used by `createChildrenNodes` to carve the four quadrants.
    /// Kept as an explicit, separately-named helper (rather than folded into
    /// `center`) because the exact-equality neighbor checks in
    /// [`crate::node::common_side`] depend on every level computing this
    /// split the same way their ancestors did.
    pub fn midpoint(&self) -> LonLat {
        self.center()
    }

    pub fn contains_lonlat(&self, p: LonLat) -> bool {
        p.lon >= self.south_west.lon
            && p.lon <= self.north_east.lon
            && p.lat >= self.south_west.lat
            && p.lat <= self.north_east.lat
    }

    /// Splits into the four quadrants in `{NW, NE, SW, SE}` order.
    pub fn subdivide(&self) -> [Extent; 4] {
        let mid = self.midpoint();
        let sw = self.south_west;
        let ne = self.north_east;
        [
            Extent::new(LonLat::new(sw.lon, mid.lat), LonLat::new(mid.lon, ne.lat)), // NW
            Extent::new(LonLat::new(mid.lon, mid.lat), LonLat::new(ne.lon, ne.lat)), // NE
            Extent::new(LonLat::new(sw.lon, sw.lat), LonLat::new(mid.lon, mid.lat)), // SW
            Extent::new(LonLat::new(mid.lon, sw.lat), LonLat::new(ne.lon, mid.lat)), // SE
        ]
    }

    /// Eight sample points (four corners + four edge midpoints) used by
    /// `createBoundsByExtent` to fit a bounding sphere to the ellipsoidal
    /// surface patch.
    pub fn sample_points(&self) -> [LonLat; 8] {
        let sw = self.south_west;
        let ne = self.north_east;
        let c = self.center();
        [
            sw,
            ne,
            LonLat::new(sw.lon, ne.lat),
            LonLat::new(ne.lon, sw.lat),
            LonLat::new(c.lon, sw.lat),
            LonLat::new(c.lon, ne.lat),
            LonLat::new(sw.lon, c.lat),
            LonLat::new(ne.lon, c.lat),
        ]
    }
}

/// A sphere used for frustum/distance culling.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BoundingSphere {
    pub center: DVec3,
    pub radius: f64,
}

impl BoundingSphere {
    pub fn new(center: DVec3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Smallest sphere enclosing two points: centered at their midpoint, radius
    /// half their distance (with a small floor so degenerate zero-distance
    /// pairs still yield a usable culling volume).
    pub fn from_two_points(a: DVec3, b: DVec3) -> Self {
        let center = (a + b) * 0.5;
        let radius = (a - b).length() * 0.5;
        Self { center, radius: radius.max(1.0e-6) }
    }

    /// Smallest sphere enclosing a set of points, built by repeatedly growing
    /// a sphere seeded from the first two points. Sufficient (if not minimal)
    /// for the small corner/midpoint samples `createBoundsByExtent` uses.
    pub fn from_points(points: &[DVec3]) -> Self {
        assert!(points.len() >= 2, "need at least two points to fit a sphere");
        let mut sphere = Self::from_two_points(points[0], points[1]);
        for &p in &points[2..] {
            let d = (p - sphere.center).length();
            if d > sphere.radius {
                let new_radius = (sphere.radius + d) * 0.5;
                let direction = (p - sphere.center) / d;
                sphere.center += direction * (new_radius - sphere.radius);
                sphere.radius = new_radius;
            }
        }
        sphere
    }
}

/// Interpolates a point inside a single ancestor quad for bounding-sphere
/// corner synthesis (§4.2) and inherited-mesh vertex synthesis (§4.7).
///
/// A plain four-corner bilinear patch is not flat the way the actual
/// triangulated mesh is, so a point built from it can sit off the ancestor's
/// real surface. Instead the quad is split along its `v_lt`-`v_rb` diagonal
/// into two triangles, and the interpolation stays inside whichever triangle
/// `(u, v)` falls in: the `v_lt` triangle (`v_lt`, `v_rt`, `v_lb`) when
/// `u + v` is below `inside_size`, otherwise the `v_rb` triangle (`v_rb`,
/// `v_lb`, `v_rt`). `inside_size` is the quad's own unit extent (1.0 for a
/// `(u, v) ∈ [0, 1]²` parameterization); both branches agree exactly along
/// the shared diagonal.
pub fn triangle_interpolate(v_lt: DVec3, v_rt: DVec3, v_lb: DVec3, v_rb: DVec3, t: DVec2) -> DVec3 {
    let inside_size = 1.0;
    let (vi_x, vi_y) = (t.x, t.y);
    if vi_x + vi_y < inside_size {
        let vw = v_rt - v_lt;
        let vn = v_lb - v_lt;
        v_lt + vw * vi_x + vn * vi_y
    } else {
        let ve = v_lb - v_rb;
        let vs = v_rt - v_rb;
        v_rb + ve * (1.0 - vi_x) + vs * (1.0 - vi_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_globe_has_equal_width_height_ratio() {
        let e = Extent::whole_globe();
        assert_eq!(e.width(), 360.0);
        assert_eq!(e.height(), 180.0);
    }

    #[test]
    fn subdivide_matches_s2_literal_values() {
        let parent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(10.0, 10.0));
        let [nw, ne, sw, se] = parent.subdivide();
        assert_eq!(nw.south_west, LonLat::new(0.0, 5.0));
        assert_eq!(nw.north_east, LonLat::new(5.0, 10.0));
        assert_eq!(ne.south_west, LonLat::new(5.0, 5.0));
        assert_eq!(ne.north_east, LonLat::new(10.0, 10.0));
        assert_eq!(sw.south_west, LonLat::new(0.0, 0.0));
        assert_eq!(sw.north_east, LonLat::new(5.0, 5.0));
        assert_eq!(se.south_west, LonLat::new(5.0, 0.0));
        assert_eq!(se.north_east, LonLat::new(10.0, 5.0));
    }

    #[test]
    fn mercator_round_trips() {
        let p = LonLat::new(12.3, 45.6);
        let back = p.to_mercator().from_mercator();
        assert!((back.lat - p.lat).abs() < 1e-9);
        assert_eq!(back.lon, p.lon);
    }

    #[test]
    fn root_sphere_matches_equatorial_radius() {
        let origin_sphere = BoundingSphere::new(DVec3::ZERO, DEFAULT_EQUATORIAL_RADIUS);
        assert_eq!(origin_sphere.radius, 6_378_137.0);
    }
}

//! Engine configuration and builder pattern, in the same shape as the
//! terrain-plugin configuration this crate is grounded on: a plain `Clone`
//! config struct, a `Default` impl carrying the spec's literal constants, and
//! a consuming builder that validates at `build()`.

use crate::error::{EngineError, Result};
use crate::geodesy::{DEFAULT_EQUATORIAL_RADIUS, MAX_LAT, POLE};

/// The host's terrain provider limits (`terrain: {minZoom, maxZoom,
/// fileGridSize, gridSizeByZoom}` in spec §6).
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainLimits {
    /// First zoom level at which real terrain may exist.
    pub min_zoom: u32,
    /// Last zoom level at which the terrain provider is ever queried; nodes
    /// deeper than this inherit permanently.
    pub max_zoom: u32,
    /// Tessellation count per side of a loaded normal-map file.
    pub file_grid_size: u32,
    /// Mesh tessellation count per side, indexed by zoom level. The last
    /// entry is reused for all deeper levels once `tileZoom` exceeds the
    /// table's length.
    pub grid_size_by_zoom: Vec<u32>,
}

impl Default for TerrainLimits {
    fn default() -> Self {
        Self {
            min_zoom: 5,
            max_zoom: 19,
            file_grid_size: 32,
            grid_size_by_zoom: vec![
                1, 1, 1, 1, 1, 8, 16, 16, 32, 32, 32, 32, 32, 32, 32, 32, 32, 32, 32, 32,
            ],
        }
    }
}

impl TerrainLimits {
    /// The tessellation count a node at `tile_zoom` should use absent any
    /// neighbor-driven reduction.
    pub fn grid_size_for_zoom(&self, tile_zoom: u32) -> u32 {
        let idx = (tile_zoom as usize).min(self.grid_size_by_zoom.len() - 1);
        self.grid_size_by_zoom[idx]
    }
}

/// Main configuration for the quadtree engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Distance heuristic multiplier: a node is "altitude visible" when
    /// `(eye.distance(sphere.center) - sphere.radius) < visible_distance * sqrt(h)`.
    pub visible_distance: f64,
    /// Antimeridian / cube-edge longitude, in degrees.
    pub pole: f64,
    /// Mercator projection cutoff latitude, in degrees.
    pub max_lat: f64,
    /// Ellipsoid equatorial radius, in meters.
    pub equatorial_radius: f64,
    /// Terrain provider limits.
    pub terrain: TerrainLimits,
    /// Explicit maximum zoom for rendering; `None` means defer to
    /// `Segment::accept_for_rendering`.
    pub max_zoom: Option<u32>,
    /// Camera altitude (meters) below which a node failing the altitude-
    /// visibility test is fully hidden rather than merely deprioritized.
    pub near_field_cutoff: f64,
    /// Camera altitude (meters) above which `collect_render_nodes` always
    /// runs regardless of `alt_vis`.
    pub far_field_collect_cutoff: f64,
    /// Whether normal-map generation is enabled at all (host's `lightEnabled`).
    pub light_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            visible_distance: 3570.0,
            pole: POLE,
            max_lat: MAX_LAT,
            equatorial_radius: DEFAULT_EQUATORIAL_RADIUS,
            terrain: TerrainLimits::default(),
            max_zoom: None,
            near_field_cutoff: 3_000_000.0,
            far_field_collect_cutoff: 10_000.0,
            light_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for an [`EngineConfig`]. Setters never fail; validation happens in
/// [`EngineConfigBuilder::build`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn visible_distance(mut self, value: f64) -> Self {
        self.config.visible_distance = value;
        self
    }

    pub fn equatorial_radius(mut self, value: f64) -> Self {
        self.config.equatorial_radius = value;
        self
    }

    pub fn terrain(mut self, terrain: TerrainLimits) -> Self {
        self.config.terrain = terrain;
        self
    }

    pub fn max_zoom(mut self, zoom: Option<u32>) -> Self {
        self.config.max_zoom = zoom;
        self
    }

    pub fn near_field_cutoff(mut self, value: f64) -> Self {
        self.config.near_field_cutoff = value;
        self
    }

    pub fn far_field_collect_cutoff(mut self, value: f64) -> Self {
        self.config.far_field_collect_cutoff = value;
        self
    }

    pub fn light_enabled(mut self, enabled: bool) -> Self {
        self.config.light_enabled = enabled;
        self
    }

    /// Validates and builds the config.
    pub fn build(self) -> Result<EngineConfig> {
        let terrain = &self.config.terrain;
        if terrain.grid_size_by_zoom.is_empty() {
            return Err(EngineError::EmptyGridSizeByZoom);
        }
        if terrain.min_zoom > terrain.max_zoom {
            return Err(EngineError::ZoomRangeInverted {
                min_zoom: terrain.min_zoom,
                max_zoom: terrain.max_zoom,
            });
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.pole, 180.0);
        assert!((config.max_lat - 85.051_128_779_8).abs() < 1e-9);
    }

    #[test]
    fn builder_round_trips_values() {
        let config = EngineConfig::builder()
            .visible_distance(5000.0)
            .max_zoom(Some(18))
            .build()
            .unwrap();

        assert_eq!(config.visible_distance, 5000.0);
        assert_eq!(config.max_zoom, Some(18));
    }

    #[test]
    fn builder_rejects_empty_grid_size_table() {
        let terrain = TerrainLimits {
            grid_size_by_zoom: vec![],
            ..TerrainLimits::default()
        };
        let result = EngineConfig::builder().terrain(terrain).build();
        assert!(matches!(result, Err(EngineError::EmptyGridSizeByZoom)));
    }

    #[test]
    fn builder_rejects_inverted_zoom_range() {
        let terrain = TerrainLimits {
            min_zoom: 10,
            max_zoom: 3,
            ..TerrainLimits::default()
        };
        let result = EngineConfig::builder().terrain(terrain).build();
        assert!(matches!(result, Err(EngineError::ZoomRangeInverted { .. })));
    }
}

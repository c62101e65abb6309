//! Construction-time error handling. Steady-state degradation (missing
//! ancestor terrain, empty tiles, dangling async completions) is handled by
//! flag/state transitions, never by this type — see spec §7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("extent south-west ({sw_lon}, {sw_lat}) is not south-west of north-east ({ne_lon}, {ne_lat})")]
    InvalidExtent {
        sw_lon: f64,
        sw_lat: f64,
        ne_lon: f64,
        ne_lat: f64,
    },

    #[error("terrain.grid_size_by_zoom must not be empty")]
    EmptyGridSizeByZoom,

    #[error("a forest needs at least one root node")]
    NoRoots,

    #[error("terrain.min_zoom ({min_zoom}) must not exceed terrain.max_zoom ({max_zoom})")]
    ZoomRangeInverted { min_zoom: u32, max_zoom: u32 },
}

pub type Result<T> = std::result::Result<T, EngineError>;

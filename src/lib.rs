//! # globe-quadtree
//!
//! The quadtree core of a planet-scale level-of-detail engine for
//! hierarchically tiled terrain and imagery:
//! - Spherical/mercator extent subdivision with polar-cap handling
//! - An arena-backed quadtree (`Node`/`Segment`) with async terrain and
//!   normal-map inheritance from ancestors while loads are in flight
//! - Neighbor seam negotiation so adjacent tiles at different LODs don't crack
//! - A per-frame traversal driver that decides what to split, render, or hide
//!
//! The renderer backend, imagery layer, terrain provider, and camera/frustum
//! math are all out of scope — see [`host`] for the trait seams this crate
//! consumes instead.

pub mod camera;
pub mod config;
pub mod error;
pub mod geodesy;
pub mod host;
pub mod node;
pub mod quadtree;
pub mod segment;
pub mod traversal;

pub mod prelude {
    pub use crate::camera::{AlwaysVisible, Camera, DistanceFrustum, Frustum};
    pub use crate::config::{EngineConfig, EngineConfigBuilder, TerrainLimits};
    pub use crate::error::{EngineError, Result};
    pub use crate::geodesy::{BoundingSphere, Extent, LonLat, Projection};
    pub use crate::host::{
        NormalMapPayload, NormalMapQueue, RenderHost, TerrainPayload, TerrainProvider, TerrainRequest,
    };
    pub use crate::node::{Node, NodeArena, NodeHandle};
    pub use crate::quadtree::{Child, Side, TraversalState};
    pub use crate::segment::{Segment, SegmentFlags};
    pub use crate::traversal::{Forest, TraversalStats};
}

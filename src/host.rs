//! External interfaces (spec §6): the async terrain provider, the
//! normal-map worker queue, and the renderer/imagery hooks a [`Segment`]
//! calls out to. None of these are implemented here — they're the seam
//! between this crate and the renderer backend, imagery layer, and terrain
//! provider the spec scopes out.
//!
//! Async completions are addressed by the stable `nodeId` (spec §3), not by
//! an arena handle: arena slots are reused once a node is destroyed, but a
//! `nodeId` never is, so a completion for a node destroyed in the meantime
//! is safely dropped (§7) rather than silently landing on an unrelated node.

use glam::DVec3;

use crate::camera::Camera;
use crate::geodesy::Extent;

/// A request to load real terrain for one tile.
#[derive(Copy, Clone, Debug)]
pub struct TerrainRequest {
    pub node_id: i64,
    pub tile_zoom: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub grid_size: u32,
}

/// The result of a terrain load. `vertices` is `None` when the provider
/// found no data for the tile (spec §7: "terrain provider failure / empty
/// tile" still sets `terrainReady = true` with `terrainExists = false`).
pub struct TerrainPayload {
    pub node_id: i64,
    /// Row-major `(grid_size+1)^2` vertices, present iff real data was found.
    pub vertices: Option<Vec<DVec3>>,
    pub grid_size: u32,
}

/// Fire-and-forget terrain loading (spec §5: "the caller never awaits").
/// Implementations publish their result onto `reply`; the engine drains
/// completions once per frame before traversal.
pub trait TerrainProvider {
    fn request(&self, request: TerrainRequest, reply: async_channel::Sender<TerrainPayload>);
}

/// Result of normal-map generation for one tile.
pub struct NormalMapPayload {
    pub node_id: i64,
    pub normals: Vec<DVec3>,
    pub normals_raw: Vec<DVec3>,
    pub file_grid_size: u32,
}

/// The host's normal-map generation worker (spec §6: `_normalMapCreator`).
/// `queue` must be idempotent from the caller's perspective; the core itself
/// guards against double-enqueue with the `in_the_queue` flag (spec §4.8,
/// §8 property 5), so an implementation does not need its own dedup.
pub trait NormalMapQueue {
    fn queue(&self, node_id: i64, reply: async_channel::Sender<NormalMapPayload>);
}

/// The renderer/imagery hooks a [`crate::segment::Segment`] calls into
/// (spec §6, "Segment interface the core requires"). All methods default to
/// no-ops so a host with no renderer at all (e.g. this crate's own tests)
/// can use [`NullRenderHost`] unmodified.
pub trait RenderHost {
    fn create_coords_buffers(&mut self, _node_id: i64, _vertices: &[DVec3], _grid_size: u32) {}
    fn delete_buffers(&mut self, _node_id: i64) {}
    fn destroy_segment(&mut self, _node_id: i64) {}
    fn delete_materials(&mut self, _node_id: i64) {}
    fn collect_render_nodes(&mut self, _node_id: i64) {}
    fn add_view_extent(&mut self, _extent: Extent) {}

    /// Whether the imagery/material layer considers this node's current
    /// resolution acceptable, i.e. whether the traversal should stop
    /// splitting past it even though zoom-based limits would allow more
    /// detail (spec §4.3 step 4). Default: never accept early, so splitting
    /// is governed purely by zoom limits.
    fn accept_for_rendering(&self, _node_id: i64, _camera: &Camera) -> bool {
        false
    }
}

/// A [`RenderHost`] that does nothing, for headless traversal and tests.
#[derive(Default)]
pub struct NullRenderHost;

impl RenderHost for NullRenderHost {}

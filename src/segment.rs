//! A single tile: its extent, tile coordinates, bounding sphere, terrain
//! readiness flags, mesh vertices, and normal-map state (spec §3, §4.2,
//! §4.7, §4.8). [`Segment`] owns no renderer resources itself — it calls
//! out to a [`crate::host::RenderHost`] for buffer/material lifecycle and
//! leaves mesh/normal data storage to plain `ndarray` grids.

use bitflags::bitflags;
use glam::DVec3;
use itertools::iproduct;
use ndarray::Array2;
use tracing::trace;

use crate::camera::Camera;
use crate::geodesy::{BoundingSphere, Extent, LonLat, Projection, MAX_LAT};
use crate::host::{NormalMapPayload, RenderHost, TerrainPayload};

bitflags! {
    /// Steady-state readiness flags (spec §3, §7). Degradation from a
    /// failed or pending async operation is always expressed by *not*
    /// setting a flag, never by an `Err`.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SegmentFlags: u16 {
        /// The segment has a mesh (inherited or loaded) and may be drawn.
        const READY = 1 << 0;
        /// The terrain request for this tile's own zoom has completed
        /// (successfully or not).
        const TERRAIN_READY = 1 << 1;
        /// A terrain request for this tile is in flight.
        const TERRAIN_IS_LOADING = 1 << 2;
        /// The completed terrain request found real data (as opposed to an
        /// empty tile).
        const TERRAIN_EXISTS = 1 << 3;
        /// This segment's own normal map has been generated.
        const NORMAL_MAP_READY = 1 << 4;
        /// An ancestor's normal map has been inherited in its place.
        const PARENT_NORMAL_MAP_READY = 1 << 5;
        /// A normal-map request for this tile is enqueued; guards against
        /// double-enqueue (spec §4.8, §8 property 5).
        const IN_THE_QUEUE = 1 << 6;
        /// Seam stitching changed since the last render; the index buffer
        /// needs to be rebuilt before the next draw.
        const REFRESH_INDEXES_BUFFER = 1 << 7;
    }
}

/// A single quadtree tile's renderable state.
pub struct Segment {
    pub tile_zoom: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub extent: Extent,
    pub projection: Projection,
    pub bsphere: BoundingSphere,
    /// Mesh tessellation count per side, before any neighbor-driven seam
    /// reduction (spec §4.2); `Node` tracks the per-side effective count
    /// separately as `side_size`.
    pub grid_size: u32,
    /// Row-major `(grid_size+1)^2` cartesian vertices, present once a plain
    /// or real mesh has been built.
    pub terrain_vertices: Option<Array2<DVec3>>,
    pub normal_map_normals: Option<Array2<DVec3>>,
    pub normal_map_normals_raw: Option<Array2<DVec3>>,
    /// Scale/offset applied when a child segment samples an ancestor's
    /// normal map instead of its own (spec §4.8: "normal map bias").
    pub normal_map_bias: NormalMapBias,
    pub flags: SegmentFlags,
}

/// `(scale, offset_u, offset_v)` mapping a child's UV space into the
/// ancestor normal map it's currently borrowing.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct NormalMapBias {
    pub scale: f64,
    pub offset_u: f64,
    pub offset_v: f64,
}

impl Segment {
    /// Builds a segment with no mesh yet (spec: "createPlainSegment" runs
    /// immediately, the real mesh arrives async later).
    pub fn new(
        tile_zoom: u32,
        tile_x: u32,
        tile_y: u32,
        extent: Extent,
        equatorial_radius: f64,
        grid_size: u32,
    ) -> Self {
        let projection = if extent.south_west.lat >= MAX_LAT || extent.north_east.lat <= -MAX_LAT {
            Projection::Epsg4326
        } else {
            Projection::Epsg3857
        };
        let bsphere = Self::create_bounds_by_extent(&extent, equatorial_radius);
        let mut segment = Self {
            tile_zoom,
            tile_x,
            tile_y,
            extent,
            projection,
            bsphere,
            grid_size,
            terrain_vertices: None,
            normal_map_normals: None,
            normal_map_normals_raw: None,
            normal_map_bias: NormalMapBias::default(),
            flags: SegmentFlags::empty(),
        };
        segment.create_plain_segment(equatorial_radius);
        segment
    }

    /// Re-derives `extent`/`projection`/`bsphere` after the extent changes
    /// (spec: `setExtentLonLat`), e.g. when a root's extent is adjusted by
    /// the host before the first frame.
    pub fn set_extent_lonlat(&mut self, extent: Extent, equatorial_radius: f64) {
        self.extent = extent;
        self.projection = if extent.south_west.lat >= MAX_LAT || extent.north_east.lat <= -MAX_LAT {
            Projection::Epsg4326
        } else {
            Projection::Epsg3857
        };
        self.bsphere = Self::create_bounds_by_extent(&extent, equatorial_radius);
    }

    /// Fits a bounding sphere to the ellipsoidal patch covered by `extent`
    /// using its eight corner/midpoint samples (spec §4.2).
    pub fn create_bounds_by_extent(extent: &Extent, equatorial_radius: f64) -> BoundingSphere {
        let points: Vec<DVec3> = extent
            .sample_points()
            .iter()
            .map(|p| p.to_cartesian(equatorial_radius))
            .collect();
        BoundingSphere::from_points(&points)
    }

    /// Builds an ellipsoid-only mesh by bilinearly interpolating the four
    /// corner cartesian positions across a `(grid_size+1)^2` grid. This is
    /// the mesh every segment starts with, before real terrain (if any)
    /// arrives asynchronously (spec §4.2, §4.7).
    pub fn create_plain_segment(&mut self, equatorial_radius: f64) {
        let n = self.grid_size as usize + 1;
        let sw = self.extent.south_west.to_cartesian(equatorial_radius);
        let se = LonLat::new(self.extent.north_east.lon, self.extent.south_west.lat)
            .to_cartesian(equatorial_radius);
        let nw = LonLat::new(self.extent.south_west.lon, self.extent.north_east.lat)
            .to_cartesian(equatorial_radius);
        let ne = self.extent.north_east.to_cartesian(equatorial_radius);

        let mut grid = Array2::from_elem((n, n), DVec3::ZERO);
        for (row, col) in iproduct!(0..n, 0..n) {
            let v = row as f64 / self.grid_size.max(1) as f64;
            let u = col as f64 / self.grid_size.max(1) as f64;
            let top = nw.lerp(ne, u);
            let bottom = sw.lerp(se, u);
            grid[[row, col]] = bottom.lerp(top, v);
        }
        self.terrain_vertices = Some(grid);
        self.flags.insert(SegmentFlags::READY);
        self.flags.remove(SegmentFlags::TERRAIN_EXISTS);
    }

    /// Whether the imagery layer is happy stopping here (spec §4.3 step 4).
    pub fn accept_for_rendering(&self, node_id: i64, camera: &Camera<'_>, host: &impl RenderHost) -> bool {
        host.accept_for_rendering(node_id, camera)
    }

    /// Marks a terrain request as dispatched. Actual network/disk work is
    /// the host's [`crate::host::TerrainProvider`]; this only flips the
    /// bookkeeping flag so the traversal doesn't request the same tile twice.
    pub fn mark_terrain_loading(&mut self) {
        self.flags.insert(SegmentFlags::TERRAIN_IS_LOADING);
    }

    /// Applies a completed terrain load (spec §7: empty tiles still
    /// complete, just with `vertices: None`).
    pub fn apply_terrain_payload(&mut self, payload: TerrainPayload) {
        self.flags.remove(SegmentFlags::TERRAIN_IS_LOADING);
        self.flags.insert(SegmentFlags::TERRAIN_READY);
        match payload.vertices {
            Some(verts) if !verts.is_empty() => {
                let n = payload.grid_size as usize + 1;
                if verts.len() == n * n {
                    let grid = Array2::from_shape_vec((n, n), verts)
                        .expect("vertex count checked against grid_size above");
                    self.terrain_vertices = Some(grid);
                    self.grid_size = payload.grid_size;
                    self.flags.insert(SegmentFlags::TERRAIN_EXISTS);
                    self.flags.insert(SegmentFlags::REFRESH_INDEXES_BUFFER);
                } else {
                    trace!(node_id = payload.node_id, "terrain payload vertex count mismatch, ignoring");
                }
            }
            _ => {
                self.flags.remove(SegmentFlags::TERRAIN_EXISTS);
            }
        }
    }

    /// Marks a normal-map request as enqueued; guards against re-enqueueing
    /// while one is already in flight (spec §4.8, §8 property 5).
    pub fn mark_normal_map_queued(&mut self) -> bool {
        if self.flags.contains(SegmentFlags::IN_THE_QUEUE) {
            return false;
        }
        self.flags.insert(SegmentFlags::IN_THE_QUEUE);
        true
    }

    pub fn apply_normal_map_payload(&mut self, payload: NormalMapPayload) {
        self.flags.remove(SegmentFlags::IN_THE_QUEUE);
        let n = payload.file_grid_size as usize + 1;
        if payload.normals.len() == n * n && payload.normals_raw.len() == n * n {
            self.normal_map_normals = Some(
                Array2::from_shape_vec((n, n), payload.normals)
                    .expect("normals length checked against file_grid_size above"),
            );
            self.normal_map_normals_raw = Some(
                Array2::from_shape_vec((n, n), payload.normals_raw)
                    .expect("normals_raw length checked against file_grid_size above"),
            );
            self.flags.insert(SegmentFlags::NORMAL_MAP_READY);
            self.flags.remove(SegmentFlags::PARENT_NORMAL_MAP_READY);
        } else {
            trace!(node_id = payload.node_id, "normal map payload size mismatch, ignoring");
        }
    }

    /// Borrows an ancestor's normal map in place of this segment's own,
    /// recording the sampling bias needed to map this segment's UVs into
    /// the ancestor's map (spec §4.8).
    pub fn inherit_normal_map(&mut self, bias: NormalMapBias) {
        self.normal_map_bias = bias;
        self.flags.insert(SegmentFlags::PARENT_NORMAL_MAP_READY);
    }

    /// Copies an ancestor's normal-map subregion directly into this segment,
    /// alongside an inherited terrain mesh (spec §4.7 point 4). Unlike
    /// `inherit_normal_map`'s bias, this carries real per-texel data because
    /// the sub-region can be any `(grid_size+1)^2` slice of the ancestor's
    /// own map rather than a uniform scale/offset of the whole thing.
    pub fn apply_inherited_normal_map(&mut self, grid_size: u32, normals: Vec<DVec3>, normals_raw: Vec<DVec3>) {
        let n = grid_size as usize + 1;
        if normals.len() == n * n && normals_raw.len() == n * n {
            self.normal_map_normals =
                Some(Array2::from_shape_vec((n, n), normals).expect("normals length checked against grid_size above"));
            self.normal_map_normals_raw =
                Some(Array2::from_shape_vec((n, n), normals_raw).expect("normals_raw length checked against grid_size above"));
            self.flags.insert(SegmentFlags::NORMAL_MAP_READY);
            self.flags.remove(SegmentFlags::PARENT_NORMAL_MAP_READY);
        }
    }

    pub fn create_coords_buffers(&mut self, node_id: i64, host: &mut impl RenderHost) {
        if let Some(vertices) = &self.terrain_vertices {
            let flat: Vec<DVec3> = vertices.iter().copied().collect();
            host.create_coords_buffers(node_id, &flat, self.grid_size);
            self.flags.remove(SegmentFlags::REFRESH_INDEXES_BUFFER);
        }
    }

    pub fn delete_buffers(&mut self, node_id: i64, host: &mut impl RenderHost) {
        host.delete_buffers(node_id);
        self.flags.remove(SegmentFlags::READY);
    }

    pub fn destroy(&mut self, node_id: i64, host: &mut impl RenderHost) {
        host.destroy_segment(node_id);
        self.terrain_vertices = None;
        self.normal_map_normals = None;
        self.normal_map_normals_raw = None;
        self.flags = SegmentFlags::empty();
    }

    pub fn delete_materials(&mut self, node_id: i64, host: &mut impl RenderHost) {
        host.delete_materials(node_id);
    }

    pub fn collect_render_nodes(&self, node_id: i64, host: &mut impl RenderHost) {
        host.collect_render_nodes(node_id);
    }

    pub fn add_view_extent(&self, host: &mut impl RenderHost) {
        host.add_view_extent(self.extent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::DEFAULT_EQUATORIAL_RADIUS;
    use crate::host::NullRenderHost;

    fn root_extent() -> Extent {
        Extent::whole_globe()
    }

    #[test]
    fn new_segment_is_ready_with_plain_mesh() {
        let segment = Segment::new(0, 0, 0, root_extent(), DEFAULT_EQUATORIAL_RADIUS, 4);
        assert!(segment.flags.contains(SegmentFlags::READY));
        assert!(!segment.flags.contains(SegmentFlags::TERRAIN_EXISTS));
        let grid = segment.terrain_vertices.as_ref().unwrap();
        assert_eq!(grid.dim(), (5, 5));
    }

    #[test]
    fn terrain_payload_with_no_vertices_completes_without_existing() {
        let mut segment = Segment::new(1, 0, 0, root_extent(), DEFAULT_EQUATORIAL_RADIUS, 2);
        segment.mark_terrain_loading();
        segment.apply_terrain_payload(TerrainPayload { node_id: 1, vertices: None, grid_size: 2 });
        assert!(segment.flags.contains(SegmentFlags::TERRAIN_READY));
        assert!(!segment.flags.contains(SegmentFlags::TERRAIN_EXISTS));
        assert!(!segment.flags.contains(SegmentFlags::TERRAIN_IS_LOADING));
    }

    #[test]
    fn terrain_payload_with_vertices_sets_exists_and_refresh() {
        let mut segment = Segment::new(1, 0, 0, root_extent(), DEFAULT_EQUATORIAL_RADIUS, 2);
        let verts = vec![DVec3::ZERO; 9];
        segment.apply_terrain_payload(TerrainPayload { node_id: 1, vertices: Some(verts), grid_size: 2 });
        assert!(segment.flags.contains(SegmentFlags::TERRAIN_EXISTS));
        assert!(segment.flags.contains(SegmentFlags::REFRESH_INDEXES_BUFFER));
    }

    #[test]
    fn normal_map_queue_guard_prevents_double_enqueue() {
        let mut segment = Segment::new(1, 0, 0, root_extent(), DEFAULT_EQUATORIAL_RADIUS, 2);
        assert!(segment.mark_normal_map_queued());
        assert!(!segment.mark_normal_map_queued());
    }

    #[test]
    fn destroy_clears_all_flags_and_data() {
        let mut segment = Segment::new(1, 0, 0, root_extent(), DEFAULT_EQUATORIAL_RADIUS, 2);
        let mut host = NullRenderHost;
        segment.destroy(1, &mut host);
        assert!(segment.flags.is_empty());
        assert!(segment.terrain_vertices.is_none());
    }
}

//! The quadtree cell: owns a [`Segment`], four child slots, four neighbor
//! slots, and the algorithms that decide whether to split, render, or hide
//! a tile, keep its mesh fed from whichever ancestor has real terrain, and
//! stitch crack-free seams with whatever else is on screen this frame.
//!
//! Parent→child is ownership, expressed as indices into a [`NodeArena`]
//! (a `slab::Slab`) rather than `Box`, so sibling/neighbor back-references
//! can be plain `NodeHandle`s instead of weak pointers.

use derive_more::{Display, From};
use glam::{DVec2, DVec3};
use itertools::iproduct;
use slab::Slab;
use tracing::{debug_span, trace, warn};

use crate::camera::Camera;
use crate::config::EngineConfig;
use crate::geodesy::{triangle_interpolate, BoundingSphere, Extent, Projection, MAX_LAT, POLE};
use crate::host::{NormalMapPayload, NormalMapQueue, RenderHost, TerrainPayload, TerrainProvider, TerrainRequest};
use crate::quadtree::{opposite_side, Child, Side, TraversalState, NEIGHBOUR, OPPART};
use crate::segment::{Segment, SegmentFlags};

/// A handle into a [`NodeArena`]. Cheap to copy, stable across frames,
/// invalidated only when the node it names is destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, From)]
#[display("node#{_0}")]
pub struct NodeHandle(usize);

/// Arena owner of every `Node` in a forest. Holding nodes by `Slab` key
/// rather than `Box`/`Rc` sidesteps the parent/child/neighbor reference
/// cycle the source object graph relies on (spec §9).
#[derive(Default)]
pub struct NodeArena {
    slab: Slab<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self { slab: Slab::new() }
    }

    pub fn insert(&mut self, node: Node) -> NodeHandle {
        NodeHandle(self.slab.insert(node))
    }

    pub fn remove(&mut self, handle: NodeHandle) -> Node {
        self.slab.remove(handle.0)
    }

    pub fn get(&self, handle: NodeHandle) -> &Node {
        &self.slab[handle.0]
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> &mut Node {
        &mut self.slab[handle.0]
    }

    pub fn try_get(&self, handle: NodeHandle) -> Option<&Node> {
        self.slab.get(handle.0)
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.slab.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}

/// A quadtree cell.
pub struct Node {
    pub segment: Segment,
    pub parent: Option<NodeHandle>,
    /// Indexed by [`Child`].
    pub children: [Option<NodeHandle>; 4],
    /// Indexed by [`Side`]; non-owning, nulled out symmetrically on destroy.
    pub neighbors: [Option<NodeHandle>; 4],
    pub has_neighbor: [bool; 4],
    /// Per-side tessellation actually used this frame, possibly reduced to
    /// match a coarser neighbor (spec §4.4).
    pub side_size: [u32; 4],
    /// `None` at the root, `Some` for every constructed child.
    pub part_id: Option<Child>,
    /// Stable identifier, `partId + parentId*4 + 1` for non-roots (spec §3).
    pub node_id: i64,
    pub state: TraversalState,
    /// The ancestor whose terrain currently backs this node's mesh, or -1.
    pub applied_terrain_node_id: i64,
    /// Whether `children` is fully populated.
    pub ready: bool,
    pub camera_inside: bool,
}

/// Per-frame accumulators the driver resets once per frame and the
/// traversal writes into (spec §9: "keep them as explicit per-frame
/// context objects rather than as planet fields").
#[derive(Default)]
pub struct FrameContext {
    pub rendered_nodes: Vec<NodeHandle>,
    pub min_curr_zoom: u32,
    pub max_curr_zoom: u32,
    pub created_nodes_count: u32,
}

impl FrameContext {
    pub fn reset(&mut self) {
        self.rendered_nodes.clear();
        self.min_curr_zoom = u32::MAX;
        self.max_curr_zoom = 0;
        self.created_nodes_count = 0;
    }
}

/// The host's async collaborators, bundled so traversal functions don't
/// each need four separate parameters.
pub struct Providers<'a> {
    pub terrain: &'a dyn TerrainProvider,
    pub terrain_reply: &'a async_channel::Sender<TerrainPayload>,
    pub normal_map: &'a dyn NormalMapQueue,
    pub normal_map_reply: &'a async_channel::Sender<NormalMapPayload>,
}

fn node_id_for(child: Child, parent_node_id: i64) -> i64 {
    child.index() as i64 + parent_node_id * 4 + 1
}

fn child_tile_coords(child: Child, parent_x: u32, parent_y: u32) -> (u32, u32) {
    match child {
        Child::Nw => (parent_x * 2, parent_y * 2 + 1),
        Child::Ne => (parent_x * 2 + 1, parent_y * 2 + 1),
        Child::Sw => (parent_x * 2, parent_y * 2),
        Child::Se => (parent_x * 2 + 1, parent_y * 2),
    }
}

/// Builds the single root of a forest (spec §4.2 strategy 1: bounding
/// sphere centered at the origin, radius equal to the equatorial radius).
/// `root_index` distinguishes multiple roots (e.g. cube-face planets);
/// roots are given negative `node_id`s so they never collide with the
/// always-positive `partId + parentId*4 + 1` ids assigned to descendants.
pub fn create_root(arena: &mut NodeArena, extent: Extent, config: &EngineConfig, root_index: i64) -> NodeHandle {
    let grid_size = config.terrain.grid_size_for_zoom(0);
    let mut segment = Segment::new(0, 0, 0, extent, config.equatorial_radius, grid_size);
    segment.bsphere = BoundingSphere::new(DVec3::ZERO, config.equatorial_radius);
    let node = Node {
        segment,
        parent: None,
        children: [None; 4],
        neighbors: [None; 4],
        has_neighbor: [false; 4],
        side_size: [grid_size; 4],
        part_id: None,
        node_id: -1 - root_index,
        state: TraversalState::default(),
        applied_terrain_node_id: -1,
        ready: false,
        camera_inside: false,
    };
    arena.insert(node)
}

/// Splits `handle`'s extent into its four quadrants and instantiates the
/// children, running `createBounds` for each (spec §4.1). A no-op if the
/// node already has children.
pub fn create_children_nodes(arena: &mut NodeArena, handle: NodeHandle, config: &EngineConfig, ctx: &mut FrameContext) {
    if arena.get(handle).ready {
        return;
    }
    let (parent_extent, parent_tile_x, parent_tile_y, parent_tile_zoom, parent_node_id) = {
        let n = arena.get(handle);
        (n.segment.extent, n.segment.tile_x, n.segment.tile_y, n.segment.tile_zoom, n.node_id)
    };
    let sub_extents = parent_extent.subdivide();
    let tile_zoom = parent_tile_zoom + 1;

    let mut children = [None; 4];
    for child in Child::ALL {
        let (tile_x, tile_y) = child_tile_coords(child, parent_tile_x, parent_tile_y);
        let grid_size = config.terrain.grid_size_for_zoom(tile_zoom);
        let segment = Segment::new(tile_zoom, tile_x, tile_y, sub_extents[child.index()], config.equatorial_radius, grid_size);
        let node = Node {
            segment,
            parent: Some(handle),
            children: [None; 4],
            neighbors: [None; 4],
            has_neighbor: [false; 4],
            side_size: [grid_size; 4],
            part_id: Some(child),
            node_id: node_id_for(child, parent_node_id),
            state: TraversalState::default(),
            applied_terrain_node_id: -1,
            ready: false,
            camera_inside: false,
        };
        let child_handle = arena.insert(node);
        refine_bounds(arena, child_handle, config);
        children[child.index()] = Some(child_handle);
        ctx.created_nodes_count += 1;
    }

    let node = arena.get_mut(handle);
    node.children = children;
    node.ready = true;
}

/// `createBounds` strategies 2/3 (spec §4.2): below `minZoom` the extent-only
/// sphere computed in `Segment::new` already stands; at or above it, refine
/// against the nearest ancestor with ready terrain, if any.
fn refine_bounds(arena: &mut NodeArena, handle: NodeHandle, config: &EngineConfig) {
    let tile_zoom = arena.get(handle).segment.tile_zoom;
    if tile_zoom < config.terrain.min_zoom {
        return;
    }
    match find_terrain_ready_ancestor(arena, handle) {
        None => {
            warn!(node_id = arena.get(handle).node_id, "no ancestor terrain ready above min_zoom, using extent bounds");
        }
        Some(ancestor) => {
            let sphere = bounds_from_ancestor(arena, handle, ancestor, config.equatorial_radius);
            arena.get_mut(handle).segment.bsphere = sphere;
        }
    }
}

fn bounds_from_ancestor(arena: &NodeArena, handle: NodeHandle, ancestor: NodeHandle, equatorial_radius: f64) -> BoundingSphere {
    let self_node = arena.get(handle);
    let (self_zoom, self_x, self_y, self_extent) =
        (self_node.segment.tile_zoom, self_node.segment.tile_x, self_node.segment.tile_y, self_node.segment.extent);
    let anc = &arena.get(ancestor).segment;
    let Some(anc_vertices) = anc.terrain_vertices.as_ref() else {
        return Segment::create_bounds_by_extent(&self_extent, equatorial_radius);
    };
    let (anc_zoom, anc_x, anc_y, anc_grid) = (anc.tile_zoom, anc.tile_x, anc.tile_y, anc.grid_size);
    let dz2 = 2u32.pow(self_zoom - anc_zoom);
    let offset_x = self_x - anc_x * dz2;
    let offset_y = self_y - anc_y * dz2;
    let sub_grid_f = anc_grid as f64 / dz2 as f64;

    if sub_grid_f >= 1.0 {
        let sub_grid = sub_grid_f.round() as usize;
        let i0 = sub_grid * offset_y as usize;
        let j0 = sub_grid * offset_x as usize;
        let p0 = anc_vertices[[i0, j0]];
        let p1 = anc_vertices[[i0 + sub_grid, j0 + sub_grid]];
        BoundingSphere::from_two_points(p0, p1)
    } else {
        let i0 = (sub_grid_f * offset_y as f64).floor() as usize;
        let j0 = (sub_grid_f * offset_x as f64).floor() as usize;
        let v00 = anc_vertices[[i0, j0]];
        let v10 = anc_vertices[[i0 + 1, j0]];
        let v01 = anc_vertices[[i0, j0 + 1]];
        let v11 = anc_vertices[[i0 + 1, j0 + 1]];
        let u0 = sub_grid_f * offset_x as f64 - j0 as f64;
        let v0 = sub_grid_f * offset_y as f64 - i0 as f64;
        let p0 = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0, v0));
        let p1 = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0 + sub_grid_f, v0 + sub_grid_f));
        BoundingSphere::from_two_points(p0, p1)
    }
}

fn find_terrain_ready_ancestor(arena: &NodeArena, handle: NodeHandle) -> Option<NodeHandle> {
    let mut current = arena.get(handle).parent;
    while let Some(h) = current {
        if arena.get(h).segment.flags.contains(SegmentFlags::TERRAIN_READY) {
            return Some(h);
        }
        current = arena.get(h).parent;
    }
    None
}

fn find_normal_map_ready_ancestor(arena: &NodeArena, handle: NodeHandle) -> Option<NodeHandle> {
    let mut current = arena.get(handle).parent;
    while let Some(h) = current {
        if arena.get(h).segment.flags.contains(SegmentFlags::NORMAL_MAP_READY) {
            return Some(h);
        }
        current = arena.get(h).parent;
    }
    None
}

fn find_ancestor_at_zoom(arena: &NodeArena, handle: NodeHandle, zoom: u32) -> Option<NodeHandle> {
    let mut current = arena.get(handle).parent;
    while let Some(h) = current {
        if arena.get(h).segment.tile_zoom == zoom {
            return Some(h);
        }
        current = arena.get(h).parent;
    }
    None
}

/// `a.parent == b.parent` (spec §9 open question 2: the source's `isBrother`
/// compares a field `Node` doesn't expose; implemented via handle equality).
pub fn is_brother(arena: &NodeArena, a: NodeHandle, b: NodeHandle) -> bool {
    arena.get(a).parent == arena.get(b).parent
}

/// `getCommonSide` (spec §4.5). `self_tile_zoom` gates the polar-wrap rules,
/// which only apply below the root. Preserves the source's duplicated
/// west-polar branch verbatim rather than "fixing" it (spec §9 open
/// question 1): both `a_sw==-POLE && b_ne==POLE` checks resolve to `E`.
pub fn common_side(a: &Extent, b: &Extent, self_tile_zoom: u32) -> Option<Side> {
    let (a_sw, a_ne) = (a.south_west, a.north_east);
    let (b_sw, b_ne) = (b.south_west, b.north_east);

    let lat_nested = (a_ne.lat <= b_ne.lat && a_sw.lat >= b_sw.lat) || (b_ne.lat <= a_ne.lat && b_sw.lat >= a_sw.lat);
    if lat_nested {
        if a_ne.lon == b_sw.lon {
            return Some(Side::E);
        }
        if a_sw.lon == b_ne.lon {
            return Some(Side::W);
        }
        if self_tile_zoom > 0 {
            if a_ne.lon == POLE && b_sw.lon == -POLE {
                return Some(Side::E);
            }
            if a_sw.lon == -POLE && b_ne.lon == POLE {
                return Some(Side::E);
            }
        }
        return None;
    }

    let lon_nested = (a_ne.lon <= b_ne.lon && a_sw.lon >= b_sw.lon) || (b_ne.lon <= a_ne.lon && b_sw.lon >= a_sw.lon);
    if lon_nested {
        if a_ne.lat == b_sw.lat {
            return Some(Side::N);
        }
        if a_sw.lat == b_ne.lat {
            return Some(Side::S);
        }
        if a_ne.lat == POLE && b_sw.lat == MAX_LAT {
            return Some(Side::N);
        }
        if a_sw.lat == -POLE && b_ne.lat == -MAX_LAT {
            return Some(Side::S);
        }
        return None;
    }

    None
}

/// `getEqualNeighbor` (spec §4.6): tree-based same-level neighbor lookup
/// via the `NEIGHBOUR`/`OPPART` tables, independent of whether that neighbor
/// has registered in a frame's rendered-node list yet. Falls back to the
/// deepest available ancestor at the boundary if the mirrored path doesn't
/// exist that deep.
pub fn equal_neighbor(arena: &NodeArena, handle: NodeHandle, side: Side) -> Option<NodeHandle> {
    let part_id = arena.get(handle).part_id?;
    if let Some(sibling) = NEIGHBOUR[side.index()][part_id.index()] {
        let parent = arena.get(handle).parent?;
        return arena.get(parent).children[sibling.index()];
    }

    let mut path = vec![part_id];
    let mut current = arena.get(handle).parent?;
    loop {
        let cur_part = arena.get(current).part_id;
        match cur_part {
            None => return None,
            Some(p) => {
                if let Some(sibling) = NEIGHBOUR[side.index()][p.index()] {
                    let anc_parent = arena.get(current).parent?;
                    let mut target = arena.get(anc_parent).children[sibling.index()]?;
                    for &step in path.iter().rev() {
                        let mirrored = OPPART[side.index()][step.index()];
                        match arena.get(target).children[mirrored.index()] {
                            Some(child) => target = child,
                            None => break,
                        }
                    }
                    return Some(target);
                }
                path.push(p);
                current = arena.get(current).parent?;
            }
        }
    }
}

fn request_terrain(arena: &mut NodeArena, handle: NodeHandle, provider: &dyn TerrainProvider, reply: &async_channel::Sender<TerrainPayload>) {
    let node = arena.get_mut(handle);
    if node.segment.flags.intersects(SegmentFlags::TERRAIN_READY | SegmentFlags::TERRAIN_IS_LOADING) {
        return;
    }
    node.segment.mark_terrain_loading();
    let request = TerrainRequest {
        node_id: node.node_id,
        tile_zoom: node.segment.tile_zoom,
        tile_x: node.segment.tile_x,
        tile_y: node.segment.tile_y,
        grid_size: node.segment.grid_size,
    };
    provider.request(request, reply.clone());
}

/// `whileTerrainLoading` (spec §4.7). Always returns `true` — the boolean is
/// consulted by the caller but currently meaningless (spec §9 open question
/// 4); the signature is kept for future policy.
pub fn while_terrain_loading<H: RenderHost>(
    arena: &mut NodeArena,
    handle: NodeHandle,
    config: &EngineConfig,
    host: &mut H,
    provider: &dyn TerrainProvider,
    reply: &async_channel::Sender<TerrainPayload>,
) -> bool {
    if !arena.get(handle).segment.flags.contains(SegmentFlags::READY) {
        arena.get_mut(handle).segment.create_plain_segment(config.equatorial_radius);
    }

    let Some(ancestor) = find_terrain_ready_ancestor(arena, handle) else {
        return true;
    };

    let (self_zoom, self_x, self_y, applied) = {
        let n = arena.get(handle);
        (n.segment.tile_zoom, n.segment.tile_x, n.segment.tile_y, n.applied_terrain_node_id)
    };
    let (anc_node_id, anc_zoom, anc_x, anc_y, anc_grid, anc_exists) = {
        let a = arena.get(ancestor);
        (a.node_id, a.segment.tile_zoom, a.segment.tile_x, a.segment.tile_y, a.segment.grid_size, a.segment.flags.contains(SegmentFlags::TERRAIN_EXISTS))
    };

    if anc_exists && applied != anc_node_id {
        let node_id = arena.get(handle).node_id;
        host.delete_buffers(node_id);

        let dz2 = 2u32.pow(self_zoom - anc_zoom);
        let offset_x = self_x - anc_x * dz2;
        let offset_y = self_y - anc_y * dz2;
        let sub_grid_f = anc_grid as f64 / dz2 as f64;

        let (new_grid_size, new_vertices) = if sub_grid_f >= 1.0 {
            let sub_grid = sub_grid_f.round() as usize;
            let i0 = sub_grid * offset_y as usize;
            let j0 = sub_grid * offset_x as usize;
            let anc_vertices = arena.get(ancestor).segment.terrain_vertices.as_ref().expect("terrain_ready ancestor has vertices");
            let flat: Vec<DVec3> = iproduct!(0..=sub_grid, 0..=sub_grid)
                .map(|(row, col)| anc_vertices[[i0 + row, j0 + col]])
                .collect();
            arena.get_mut(handle).side_size = [sub_grid as u32; 4];

            if let Some(anc_normals) = arena.get(ancestor).segment.normal_map_normals.as_ref() {
                let anc_normals_raw = arena
                    .get(ancestor)
                    .segment
                    .normal_map_normals_raw
                    .as_ref()
                    .expect("normals and normals_raw are populated together");
                let sub_grid_nm = (config.terrain.file_grid_size as f64 / dz2 as f64).round() as usize;
                let i0_nm = sub_grid_nm * offset_y as usize;
                let j0_nm = sub_grid_nm * offset_x as usize;
                let flat_normals: Vec<DVec3> = iproduct!(0..=sub_grid_nm, 0..=sub_grid_nm)
                    .map(|(row, col)| anc_normals[[i0_nm + row, j0_nm + col]])
                    .collect();
                let flat_normals_raw: Vec<DVec3> = iproduct!(0..=sub_grid_nm, 0..=sub_grid_nm)
                    .map(|(row, col)| anc_normals_raw[[i0_nm + row, j0_nm + col]])
                    .collect();
                arena
                    .get_mut(handle)
                    .segment
                    .apply_inherited_normal_map(sub_grid_nm as u32, flat_normals, flat_normals_raw);
            }

            (sub_grid as u32, flat)
        } else {
            let i0 = (sub_grid_f * offset_y as f64).floor() as usize;
            let j0 = (sub_grid_f * offset_x as f64).floor() as usize;
            let anc_vertices = arena.get(ancestor).segment.terrain_vertices.as_ref().expect("terrain_ready ancestor has vertices");
            let v00 = anc_vertices[[i0, j0]];
            let v10 = anc_vertices[[i0 + 1, j0]];
            let v01 = anc_vertices[[i0, j0 + 1]];
            let v11 = anc_vertices[[i0 + 1, j0 + 1]];
            let u0 = sub_grid_f * offset_x as f64 - j0 as f64;
            let v0 = sub_grid_f * offset_y as f64 - i0 as f64;
            let p_sw = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0, v0));
            let p_se = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0 + sub_grid_f, v0));
            let p_nw = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0, v0 + sub_grid_f));
            let p_ne = triangle_interpolate(v00, v01, v10, v11, DVec2::new(u0 + sub_grid_f, v0 + sub_grid_f));
            arena.get_mut(handle).side_size = [1; 4];
            (1, vec![p_sw, p_se, p_nw, p_ne])
        };

        arena.get_mut(handle).segment.apply_terrain_payload(TerrainPayload {
            node_id,
            vertices: Some(new_vertices),
            grid_size: new_grid_size,
        });
        arena.get_mut(handle).segment.create_coords_buffers(node_id, host);
        arena.get_mut(handle).applied_terrain_node_id = anc_node_id;
    }

    if self_zoom > config.terrain.max_zoom {
        if anc_zoom >= config.terrain.max_zoom {
            arena.get_mut(handle).segment.flags.insert(SegmentFlags::TERRAIN_READY | SegmentFlags::TERRAIN_EXISTS);
        } else if let Some(target) = find_ancestor_at_zoom(arena, handle, config.terrain.max_zoom) {
            request_terrain(arena, target, provider, reply);
        }
    }

    true
}

/// `whileNormalMapCreating` (spec §4.8).
#[allow(clippy::too_many_arguments)]
pub fn while_normal_map_creating(
    arena: &mut NodeArena,
    handle: NodeHandle,
    config: &EngineConfig,
    queue: &dyn NormalMapQueue,
    reply: &async_channel::Sender<NormalMapPayload>,
    terrain_provider: &dyn TerrainProvider,
    terrain_reply: &async_channel::Sender<TerrainPayload>,
) {
    let (tile_zoom, terrain_ready, terrain_loading, node_id) = {
        let n = arena.get(handle);
        (
            n.segment.tile_zoom,
            n.segment.flags.contains(SegmentFlags::TERRAIN_READY),
            n.segment.flags.contains(SegmentFlags::TERRAIN_IS_LOADING),
            n.node_id,
        )
    };
    if tile_zoom <= config.terrain.max_zoom && terrain_ready && !terrain_loading {
        let queued = arena.get_mut(handle).segment.mark_normal_map_queued();
        if queued {
            queue.queue(node_id, reply.clone());
        }
    }

    let Some(ancestor) = find_normal_map_ready_ancestor(arena, handle) else {
        return;
    };
    let (self_x, self_y, self_zoom) = {
        let n = arena.get(handle);
        (n.segment.tile_x, n.segment.tile_y, n.segment.tile_zoom)
    };
    let (anc_zoom, anc_x, anc_y) = {
        let a = &arena.get(ancestor).segment;
        (a.tile_zoom, a.tile_x, a.tile_y)
    };
    let dz2 = 2u32.pow(self_zoom.saturating_sub(anc_zoom));
    let bias = crate::segment::NormalMapBias {
        offset_u: (self_x - anc_x * dz2) as f64,
        offset_v: (self_y - anc_y * dz2) as f64,
        scale: 1.0 / dz2 as f64,
    };
    arena.get_mut(handle).segment.inherit_normal_map(bias);

    if self_zoom > config.terrain.max_zoom {
        if anc_zoom == config.terrain.max_zoom {
            arena.get_mut(handle).segment.flags.insert(SegmentFlags::PARENT_NORMAL_MAP_READY);
        } else if let Some(target) = find_ancestor_at_zoom(arena, handle, config.terrain.max_zoom) {
            if !arena.get(target).segment.flags.contains(SegmentFlags::READY) {
                arena.get_mut(target).segment.create_plain_segment(config.equatorial_radius);
            }
            request_terrain(arena, target, terrain_provider, terrain_reply);
            let target_node_id = arena.get(target).node_id;
            if arena.get_mut(target).segment.mark_normal_map_queued() {
                queue.queue(target_node_id, reply.clone());
            }
        }
    }
}

/// `addToRender` (spec §4.4): registers `handle`, scans `ctx.rendered_nodes`
/// newest-first for a shared edge, installs symmetric neighbor links, and
/// negotiates `side_size` the first time a pair is linked.
pub fn add_to_render<H: RenderHost>(arena: &mut NodeArena, handle: NodeHandle, ctx: &mut FrameContext, host: &mut H) {
    arena.get_mut(handle).state = TraversalState::Rendering;
    let (my_extent, my_tile_zoom, my_grid_size) = {
        let n = arena.get(handle);
        (n.segment.extent, n.segment.tile_zoom, n.segment.grid_size)
    };

    let already_rendered: Vec<NodeHandle> = ctx.rendered_nodes.iter().rev().copied().collect();
    for other in already_rendered {
        let (other_extent, other_tile_zoom, other_grid_size) = {
            let n = arena.get(other);
            (n.segment.extent, n.segment.tile_zoom, n.segment.grid_size)
        };
        let Some(cs) = common_side(&my_extent, &other_extent, my_tile_zoom) else {
            continue;
        };
        let opcs = opposite_side(cs);
        let already_linked = arena.get(handle).has_neighbor[cs.index()] || arena.get(other).has_neighbor[opcs.index()];

        arena.get_mut(handle).neighbors[cs.index()] = Some(other);
        arena.get_mut(other).neighbors[opcs.index()] = Some(handle);

        if !already_linked {
            arena.get_mut(handle).has_neighbor[cs.index()] = true;
            arena.get_mut(other).has_neighbor[opcs.index()] = true;

            let dz = 2f64.powi(other_tile_zoom as i32 - my_tile_zoom as i32);
            let ld = my_grid_size as f64 / (other_grid_size as f64 * dz);
            if ld > 1.0 {
                arena.get_mut(handle).side_size[cs.index()] = (my_grid_size as f64 / ld).ceil() as u32;
                arena.get_mut(other).side_size[opcs.index()] = other_grid_size;
            } else if ld < 1.0 {
                arena.get_mut(handle).side_size[cs.index()] = my_grid_size;
                arena.get_mut(other).side_size[opcs.index()] = (other_grid_size as f64 * ld).ceil() as u32;
            } else {
                arena.get_mut(handle).side_size[cs.index()] = my_grid_size;
                arena.get_mut(other).side_size[opcs.index()] = other_grid_size;
            }
        }
    }

    ctx.rendered_nodes.push(handle);
    ctx.min_curr_zoom = ctx.min_curr_zoom.min(my_tile_zoom);
    ctx.max_curr_zoom = ctx.max_curr_zoom.max(my_tile_zoom);
    let node_id = arena.get(handle).node_id;
    arena.get(handle).segment.collect_render_nodes(node_id, host);
}

fn prepare_for_rendering<H: RenderHost>(
    arena: &mut NodeArena,
    handle: NodeHandle,
    altitude: f64,
    alt_vis: bool,
    only_terrain: bool,
    config: &EngineConfig,
    ctx: &mut FrameContext,
    host: &mut H,
    providers: &Providers<'_>,
) {
    if altitude < config.near_field_cutoff && !alt_vis {
        arena.get_mut(handle).state = TraversalState::NotRendering;
        return;
    }

    if !arena.get(handle).segment.flags.contains(SegmentFlags::TERRAIN_READY) {
        while_terrain_loading(arena, handle, config, host, providers.terrain, providers.terrain_reply);
    }
    if config.light_enabled {
        while_normal_map_creating(
            arena,
            handle,
            config,
            providers.normal_map,
            providers.normal_map_reply,
            providers.terrain,
            providers.terrain_reply,
        );
    }
    request_terrain(arena, handle, providers.terrain, providers.terrain_reply);

    if only_terrain {
        arena.get_mut(handle).state = TraversalState::Rendering;
        return;
    }

    add_to_render(arena, handle, ctx, host);
}

fn ensure_children_and_recurse<H: RenderHost>(
    arena: &mut NodeArena,
    handle: NodeHandle,
    camera: &mut Camera<'_>,
    config: &EngineConfig,
    ctx: &mut FrameContext,
    host: &mut H,
    providers: &Providers<'_>,
) {
    if !arena.get(handle).ready {
        create_children_nodes(arena, handle, config, ctx);
    }
    let children = arena.get(handle).children;
    for child in children.into_iter().flatten() {
        render_tree(arena, child, camera, config, ctx, host, providers);
    }
}

/// `renderTree` (spec §4.3): the per-frame entry point for one node.
pub fn render_tree<H: RenderHost>(
    arena: &mut NodeArena,
    handle: NodeHandle,
    camera: &mut Camera<'_>,
    config: &EngineConfig,
    ctx: &mut FrameContext,
    host: &mut H,
    providers: &Providers<'_>,
) {
    let node_id = arena.get(handle).node_id;
    let _span = debug_span!("render_tree", node_id).entered();

    {
        let node = arena.get_mut(handle);
        node.state = TraversalState::Walkthrough;
        node.neighbors = [None; 4];
        node.has_neighbor = [false; 4];
    }

    let parent_inside = match arena.get(handle).parent {
        None => true,
        Some(parent) => arena.get(parent).camera_inside,
    };
    let camera_inside = if parent_inside {
        let (extent, projection) = {
            let seg = &arena.get(handle).segment;
            (seg.extent, seg.projection)
        };
        let test_point = if projection == Projection::Epsg3857 && camera.lon_lat.lat.abs() <= MAX_LAT {
            camera.lon_lat_merc
        } else {
            camera.lon_lat
        };
        let inside = extent.contains_lonlat(test_point);
        if inside {
            camera.inside_segment = Some(handle);
        }
        inside
    } else {
        false
    };
    arena.get_mut(handle).camera_inside = camera_inside;

    let (bsphere, tile_zoom, normal_map_ready) = {
        let seg = &arena.get(handle).segment;
        (seg.bsphere, seg.tile_zoom, seg.flags.contains(SegmentFlags::NORMAL_MAP_READY))
    };
    let in_frustum = camera.frustum.contains_sphere(&bsphere);
    let altitude = camera.altitude().max(1.0);
    let alt_vis = (camera.eye.distance(bsphere.center) - bsphere.radius) < config.visible_distance * altitude.sqrt();
    // `underBottom` is a permanently-false tunable hook (spec §9 open question 3).
    let under_bottom = false;
    let visible = in_frustum || camera_inside || under_bottom;

    if visible {
        if tile_zoom < 2 && normal_map_ready {
            trace!(node_id, "forcing split near pole to avoid seam");
            ensure_children_and_recurse(arena, handle, camera, config, ctx, host, providers);
        } else {
            let accept_here = match config.max_zoom {
                Some(max_zoom) => tile_zoom == max_zoom,
                None => arena.get(handle).segment.accept_for_rendering(node_id, camera, &*host),
            };
            if accept_here {
                prepare_for_rendering(arena, handle, altitude, alt_vis, false, config, ctx, host, providers);
            } else if (tile_zoom as usize) < config.terrain.grid_size_by_zoom.len().saturating_sub(1) {
                ensure_children_and_recurse(arena, handle, camera, config, ctx, host, providers);
            } else {
                prepare_for_rendering(arena, handle, altitude, alt_vis, false, config, ctx, host, providers);
            }
        }
    } else {
        arena.get_mut(handle).state = TraversalState::NotRendering;
    }

    if in_frustum && (alt_vis || altitude > config.far_field_collect_cutoff) {
        let node_id = arena.get(handle).node_id;
        arena.get(handle).segment.collect_render_nodes(node_id, host);
    }
}

/// `clearTree` (spec §4.9).
pub fn clear_tree<H: RenderHost>(arena: &mut NodeArena, handle: NodeHandle, host: &mut H) {
    if effective_state_blocks(arena, handle) {
        destroy_branches(arena, handle, host);
    } else {
        let children = arena.get(handle).children;
        for child in children.into_iter().flatten() {
            clear_tree(arena, child, host);
        }
    }
}

fn effective_state_blocks(arena: &NodeArena, handle: NodeHandle) -> bool {
    if arena.get(handle).state != TraversalState::Walkthrough {
        return true;
    }
    let mut current = arena.get(handle).parent;
    while let Some(h) = current {
        if arena.get(h).state != TraversalState::Walkthrough {
            return true;
        }
        current = arena.get(h).parent;
    }
    false
}

/// `clearBranches` (spec §4.9): releases imagery resources while keeping
/// geometry.
pub fn clear_branches<H: RenderHost>(arena: &mut NodeArena, handle: NodeHandle, host: &mut H) {
    let node_id = arena.get(handle).node_id;
    arena.get_mut(handle).segment.delete_materials(node_id, host);
    let children = arena.get(handle).children;
    for child in children.into_iter().flatten() {
        clear_branches(arena, child, host);
    }
}

/// `destroyBranches` (spec §4.9).
pub fn destroy_branches<H: RenderHost>(arena: &mut NodeArena, handle: NodeHandle, host: &mut H) {
    let children = arena.get(handle).children;
    {
        let node = arena.get_mut(handle);
        node.ready = false;
        node.children = [None; 4];
    }
    for child in children.into_iter().flatten() {
        destroy_branches(arena, child, host);
        destroy(arena, child, host);
    }
}

/// `destroy` (spec §4.9): symmetrically unlinks neighbors before removing
/// the node from the arena, so no live node ever holds a back-reference to
/// a destroyed one (spec §7, §8 property 6).
pub fn destroy<H: RenderHost>(arena: &mut NodeArena, handle: NodeHandle, host: &mut H) {
    arena.get_mut(handle).state = TraversalState::NotRendering;
    let node_id = arena.get(handle).node_id;
    arena.get_mut(handle).segment.destroy(node_id, host);

    let neighbors = arena.get(handle).neighbors;
    for (side_idx, neighbor) in neighbors.into_iter().enumerate() {
        if let Some(neighbor_handle) = neighbor {
            if arena.contains(neighbor_handle) {
                let opside = opposite_side(Side::from_index(side_idx));
                let n = arena.get_mut(neighbor_handle);
                if n.neighbors[opside.index()] == Some(handle) {
                    n.neighbors[opside.index()] = None;
                    n.has_neighbor[opside.index()] = false;
                }
            }
        }
    }

    arena.remove(handle);
}

/// `traverseTree` (spec §4.9): visits self, then descends while `ready`.
pub fn traverse_tree(arena: &NodeArena, handle: NodeHandle, callback: &mut impl FnMut(&Node)) {
    callback(arena.get(handle));
    if arena.get(handle).ready {
        for child in arena.get(handle).children.into_iter().flatten() {
            traverse_tree(arena, child, callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::LonLat;

    #[test]
    fn create_children_nodes_matches_s2_ids_and_extents() {
        let mut arena = NodeArena::new();
        let config = EngineConfig::default();
        let extent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(10.0, 10.0));
        let root = create_root(&mut arena, extent, &config, 0);
        let mut ctx = FrameContext::default();
        ctx.reset();
        create_children_nodes(&mut arena, root, &config, &mut ctx);

        let root_node_id = arena.get(root).node_id;
        let children = arena.get(root).children;
        let nw = arena.get(children[Child::Nw.index()].unwrap());
        let ne = arena.get(children[Child::Ne.index()].unwrap());
        let sw = arena.get(children[Child::Sw.index()].unwrap());
        let se = arena.get(children[Child::Se.index()].unwrap());

        assert_eq!(nw.segment.extent.south_west, LonLat::new(0.0, 5.0));
        assert_eq!(ne.segment.extent.south_west, LonLat::new(5.0, 5.0));
        assert_eq!(sw.segment.extent.south_west, LonLat::new(0.0, 0.0));
        assert_eq!(se.segment.extent.south_west, LonLat::new(5.0, 0.0));

        assert_eq!(nw.node_id, root_node_id * 4 + 1);
        assert_eq!(ne.node_id, root_node_id * 4 + 2);
        assert_eq!(sw.node_id, root_node_id * 4 + 3);
        assert_eq!(se.node_id, root_node_id * 4 + 4);
        assert_eq!(nw.segment.tile_zoom, 1);
        assert!(arena.get(root).ready);
    }

    #[test]
    fn common_side_matches_s3_sibling_case() {
        let parent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(10.0, 10.0));
        let [_nw, _ne, sw, se] = parent.subdivide();
        assert_eq!(common_side(&sw, &se, 1), Some(Side::E));
        assert_eq!(common_side(&se, &sw, 1), Some(Side::W));
    }

    #[test]
    fn common_side_preserves_duplicated_west_branch() {
        let a = Extent::new(LonLat::new(-POLE, 0.0), LonLat::new(-170.0, 10.0));
        let b = Extent::new(LonLat::new(170.0, 0.0), LonLat::new(POLE, 10.0));
        // a_sw.lon == -POLE && b_ne.lon == POLE resolves to E, per the
        // source's observed (buggy) behaviour, not the "intended" W.
        assert_eq!(common_side(&a, &b, 1), Some(Side::E));
    }

    #[test]
    fn equal_neighbor_s6_walk_up_case() {
        let mut arena = NodeArena::new();
        let config = EngineConfig::default();
        let extent = Extent::whole_globe();
        let root = create_root(&mut arena, extent, &config, 0);
        let mut ctx = FrameContext::default();
        create_children_nodes(&mut arena, root, &config, &mut ctx);
        let root_children = arena.get(root).children;
        let ne = root_children[Child::Ne.index()].unwrap();
        create_children_nodes(&mut arena, ne, &config, &mut ctx);
        let ne_children = arena.get(ne).children;
        let ne_ne = ne_children[Child::Ne.index()].unwrap();

        // NE's own NE-child asking for side E must walk up (NEIGHBOUR[E][NE] = None).
        let neighbor = equal_neighbor(&arena, ne_ne, Side::E);
        // No E-neighbor registered in the tree at root's level (root is the
        // only sibling), so this resolves to None at the top of the walk.
        assert_eq!(neighbor, None);
    }

    #[test]
    fn destroy_unlinks_neighbors_symmetrically() {
        let mut arena = NodeArena::new();
        let config = EngineConfig::default();
        let extent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(10.0, 10.0));
        let root = create_root(&mut arena, extent, &config, 0);
        let mut ctx = FrameContext::default();
        create_children_nodes(&mut arena, root, &config, &mut ctx);
        let children = arena.get(root).children;
        let sw = children[Child::Sw.index()].unwrap();
        let se = children[Child::Se.index()].unwrap();

        arena.get_mut(sw).neighbors[Side::E.index()] = Some(se);
        arena.get_mut(sw).has_neighbor[Side::E.index()] = true;
        arena.get_mut(se).neighbors[Side::W.index()] = Some(sw);
        arena.get_mut(se).has_neighbor[Side::W.index()] = true;

        let mut host = crate::host::NullRenderHost;
        destroy(&mut arena, sw, &mut host);

        assert_eq!(arena.get(se).neighbors[Side::W.index()], None);
        assert!(!arena.get(se).has_neighbor[Side::W.index()]);
        assert!(!arena.contains(sw));
    }

    #[test]
    fn is_brother_compares_parent_handles() {
        let mut arena = NodeArena::new();
        let config = EngineConfig::default();
        let extent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(10.0, 10.0));
        let root = create_root(&mut arena, extent, &config, 0);
        let mut ctx = FrameContext::default();
        create_children_nodes(&mut arena, root, &config, &mut ctx);
        let children = arena.get(root).children;
        let nw = children[Child::Nw.index()].unwrap();
        let ne = children[Child::Ne.index()].unwrap();
        assert!(is_brother(&arena, nw, ne));
    }

    /// Spec §8 properties 1 (coverage) and 2 (neighbor symmetry), checked
    /// against a randomized mixed-depth leaf set rather than one fixed
    /// layout.
    #[test]
    fn coverage_and_neighbor_symmetry_hold_under_random_traversal() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut arena = NodeArena::new();
        let config = EngineConfig::default();
        let extent = Extent::new(LonLat::new(0.0, 0.0), LonLat::new(16.0, 16.0));
        let root = create_root(&mut arena, extent, &config, 0);
        let mut ctx = FrameContext::default();
        create_children_nodes(&mut arena, root, &config, &mut ctx);

        let mut leaves: Vec<NodeHandle> = Vec::new();
        for child in arena.get(root).children.into_iter().flatten() {
            if rng.random_bool(0.5) {
                create_children_nodes(&mut arena, child, &config, &mut ctx);
                leaves.extend(arena.get(child).children.into_iter().flatten());
            } else {
                leaves.push(child);
            }
        }

        for _ in 0..200 {
            let lon = rng.random_range(extent.south_west.lon..extent.north_east.lon);
            let lat = rng.random_range(extent.south_west.lat..extent.north_east.lat);
            let point = LonLat::new(lon, lat);
            let matches = leaves.iter().filter(|&&leaf| arena.get(leaf).segment.extent.contains_lonlat(point)).count();
            assert_eq!(matches, 1, "point {point:?} should land in exactly one leaf");
        }

        let mut order = leaves.clone();
        for i in (1..order.len()).rev() {
            let j = rng.random_range(0..=i);
            order.swap(i, j);
        }
        let mut host = crate::host::NullRenderHost;
        for &leaf in &order {
            add_to_render(&mut arena, leaf, &mut ctx, &mut host);
        }
        for &a in &leaves {
            for side in Side::ALL {
                if let Some(b) = arena.get(a).neighbors[side.index()] {
                    let opside = opposite_side(side);
                    assert_eq!(arena.get(b).neighbors[opside.index()], Some(a));
                }
            }
        }
    }
}

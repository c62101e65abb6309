//! Per-frame driver: owns the forest (roots + arena), drains completed
//! async terrain/normal-map payloads, and calls `render_tree` on each root
//! (spec §2, §4.9, §9: "keep accumulators as explicit per-frame context").

use async_channel::{Receiver, Sender};
use tracing::{trace, warn};

use crate::camera::Camera;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::geodesy::Extent;
use crate::host::{NormalMapPayload, NormalMapQueue, RenderHost, TerrainPayload, TerrainProvider};
use crate::node::{self, FrameContext, NodeArena, NodeHandle, Providers};

/// Observability over one frame's traversal (spec §10.5): purely additive,
/// derived from the already-specified per-frame accounting.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub rendered: u32,
    pub created: u32,
    pub min_zoom: u32,
    pub max_zoom: u32,
}

/// Owns every root and the arena backing the whole quadtree forest.
pub struct Forest {
    pub arena: NodeArena,
    pub roots: Vec<NodeHandle>,
    ctx: FrameContext,
    terrain_reply_tx: Sender<TerrainPayload>,
    terrain_reply_rx: Receiver<TerrainPayload>,
    normal_map_reply_tx: Sender<NormalMapPayload>,
    normal_map_reply_rx: Receiver<NormalMapPayload>,
}

impl Forest {
    /// Builds a forest with one root per `extents` (a single whole-globe
    /// extent for a planet, or several for a cube-sphere's faces). Each
    /// extent is validated at this boundary (spec §7): a malformed extent
    /// (`sw.lon > ne.lon` or `sw.lat > ne.lat`) is rejected here rather than
    /// debug-asserted deep inside traversal.
    pub fn new(extents: &[Extent], config: &EngineConfig) -> Result<Self> {
        if extents.is_empty() {
            return Err(EngineError::NoRoots);
        }
        for extent in extents {
            if extent.south_west.lon > extent.north_east.lon || extent.south_west.lat > extent.north_east.lat {
                return Err(EngineError::InvalidExtent {
                    sw_lon: extent.south_west.lon,
                    sw_lat: extent.south_west.lat,
                    ne_lon: extent.north_east.lon,
                    ne_lat: extent.north_east.lat,
                });
            }
        }
        let mut arena = NodeArena::new();
        let roots = extents
            .iter()
            .enumerate()
            .map(|(i, extent)| node::create_root(&mut arena, *extent, config, i as i64))
            .collect();
        let (terrain_reply_tx, terrain_reply_rx) = async_channel::unbounded();
        let (normal_map_reply_tx, normal_map_reply_rx) = async_channel::unbounded();
        Ok(Self {
            arena,
            roots,
            ctx: FrameContext::default(),
            terrain_reply_tx,
            terrain_reply_rx,
            normal_map_reply_tx,
            normal_map_reply_rx,
        })
    }

    /// Sender handed to a [`TerrainProvider`] implementation for publishing
    /// completions; clone freely, one per in-flight request.
    pub fn terrain_reply_sender(&self) -> Sender<TerrainPayload> {
        self.terrain_reply_tx.clone()
    }

    pub fn normal_map_reply_sender(&self) -> Sender<NormalMapPayload> {
        self.normal_map_reply_tx.clone()
    }

    /// Applies every completion received since the last frame. A payload
    /// naming a `node_id` no longer present in the arena is a dangling
    /// completion (its node was destroyed in the meantime) and is silently
    /// discarded, per spec §7.
    fn drain_completions(&mut self) {
        while let Ok(payload) = self.terrain_reply_rx.try_recv() {
            match find_handle_by_node_id(&self.arena, &self.roots, payload.node_id) {
                Some(handle) => self.arena.get_mut(handle).segment.apply_terrain_payload(payload),
                None => warn!(node_id = payload.node_id, "dropping terrain completion for a destroyed node"),
            }
        }
        while let Ok(payload) = self.normal_map_reply_rx.try_recv() {
            match find_handle_by_node_id(&self.arena, &self.roots, payload.node_id) {
                Some(handle) => self.arena.get_mut(handle).segment.apply_normal_map_payload(payload),
                None => warn!(node_id = payload.node_id, "dropping normal map completion for a destroyed node"),
            }
        }
    }

    /// Runs one frame: drains async completions, resets the per-frame
    /// accounting, walks every root, and returns a summary.
    pub fn run_frame<H: RenderHost>(
        &mut self,
        camera: &mut Camera<'_>,
        config: &EngineConfig,
        host: &mut H,
        terrain_provider: &dyn TerrainProvider,
        normal_map_queue: &dyn NormalMapQueue,
    ) -> TraversalStats {
        self.drain_completions();
        self.ctx.reset();
        camera.inside_segment = None;

        let providers = Providers {
            terrain: terrain_provider,
            terrain_reply: &self.terrain_reply_tx,
            normal_map: normal_map_queue,
            normal_map_reply: &self.normal_map_reply_tx,
        };

        for &root in &self.roots {
            node::render_tree(&mut self.arena, root, camera, config, &mut self.ctx, host, &providers);
        }

        trace!(
            rendered = self.ctx.rendered_nodes.len(),
            created = self.ctx.created_nodes_count,
            "frame traversal complete"
        );

        TraversalStats {
            rendered: self.ctx.rendered_nodes.len() as u32,
            created: self.ctx.created_nodes_count,
            min_zoom: self.ctx.min_curr_zoom,
            max_zoom: self.ctx.max_curr_zoom,
        }
    }

    /// Tree-wide clear pass (spec §4.9 `clearTree`), e.g. when the host
    /// wants to force a full collapse (low-memory condition, camera reset).
    pub fn clear_all<H: RenderHost>(&mut self, host: &mut H) {
        for &root in &self.roots {
            node::clear_tree(&mut self.arena, root, host);
        }
    }
}

/// Linear scan for the node currently holding `node_id`. The arena has no
/// separate `node_id -> NodeHandle` index because completions are rare
/// relative to per-frame traversal and the tree depth keeps this shallow
/// in practice; a host issuing very high load volumes may want to maintain
/// its own index instead.
fn find_handle_by_node_id(arena: &NodeArena, roots: &[NodeHandle], node_id: i64) -> Option<NodeHandle> {
    fn search(arena: &NodeArena, handle: NodeHandle, node_id: i64) -> Option<NodeHandle> {
        let n = arena.get(handle);
        if n.node_id == node_id {
            return Some(handle);
        }
        if n.ready {
            for child in n.children.into_iter().flatten() {
                if let Some(found) = search(arena, child, node_id) {
                    return Some(found);
                }
            }
        }
        None
    }
    roots.iter().find_map(|&root| search(arena, root, node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::AlwaysVisible;
    use crate::host::NullRenderHost;
    use glam::DVec3;

    struct NoTerrain;
    impl TerrainProvider for NoTerrain {
        fn request(&self, request: crate::host::TerrainRequest, reply: Sender<TerrainPayload>) {
            let _ = reply.try_send(TerrainPayload { node_id: request.node_id, vertices: None, grid_size: request.grid_size });
        }
    }

    struct NoNormalMap;
    impl NormalMapQueue for NoNormalMap {
        fn queue(&self, _node_id: i64, _reply: Sender<NormalMapPayload>) {}
    }

    #[test]
    fn forest_rejects_empty_root_list() {
        let config = EngineConfig::default();
        let result = Forest::new(&[], &config);
        assert!(matches!(result, Err(EngineError::NoRoots)));
    }

    #[test]
    fn forest_rejects_malformed_extent() {
        let config = EngineConfig::default();
        // Built as a struct literal, bypassing `Extent::new`'s debug_assert,
        // to exercise the boundary check itself (spec §7).
        let backwards = Extent {
            south_west: crate::geodesy::LonLat::new(10.0, 0.0),
            north_east: crate::geodesy::LonLat::new(0.0, 10.0),
        };
        let result = Forest::new(&[backwards], &config);
        assert!(matches!(result, Err(EngineError::InvalidExtent { .. })));
    }

    #[test]
    fn run_frame_does_not_panic_and_reports_stats() {
        let config = EngineConfig::builder().max_zoom(Some(0)).build().unwrap();
        let mut forest = Forest::new(&[Extent::whole_globe()], &config).unwrap();
        let frustum = AlwaysVisible;
        let mut camera = Camera::new(&frustum, DVec3::new(0.0, 0.0, config.equatorial_radius * 4.0), crate::geodesy::LonLat::with_height(0.0, 0.0, config.equatorial_radius * 3.0));
        let mut host = NullRenderHost;
        let stats = forest.run_frame(&mut camera, &config, &mut host, &NoTerrain, &NoNormalMap);
        assert_eq!(stats.rendered, 1);
    }

    #[test]
    fn dangling_completion_for_destroyed_node_is_dropped() {
        let config = EngineConfig::default();
        let forest = Forest::new(&[Extent::whole_globe()], &config).unwrap();
        let handle = find_handle_by_node_id(&forest.arena, &forest.roots, 999_999);
        assert_eq!(handle, None);
    }
}

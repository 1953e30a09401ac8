//! Coordinate mapping across the optical device chain.
//!
//! Stage, microscope, objective and camera frames form a tree (each device
//! mounted on a parent). Nodes are stored in an arena with explicit parent
//! indices; composed global transforms are cached and invalidated by a
//! generation stamp bumped on any local change, so a stale cache can never
//! be read after an ancestor moves.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

#[derive(Debug)]
struct Node {
    parent: Option<usize>,
    local: Isometry3<f64>,
    cached: Cell<Option<(u64, Isometry3<f64>)>>,
}

/// Arena of coordinate frames with cached frame-to-global transforms.
#[derive(Debug, Default)]
pub struct FrameTree {
    nodes: Vec<Node>,
    stamp: Cell<u64>,
}

impl FrameTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame with the given transform relative to `parent` (or to the
    /// global frame when `parent` is `None`).
    pub fn add_frame(&mut self, parent: Option<FrameId>, local: Isometry3<f64>) -> FrameId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            parent: parent.map(|p| p.0),
            local,
            cached: Cell::new(None),
        });
        FrameId(id)
    }

    /// Convenience: add a frame offset by a pure translation.
    pub fn add_offset_frame(&mut self, parent: Option<FrameId>, offset: [f64; 3]) -> FrameId {
        let iso = Isometry3::from_parts(
            Translation3::new(offset[0], offset[1], offset[2]),
            UnitQuaternion::identity(),
        );
        self.add_frame(parent, iso)
    }

    /// Replace a frame's local transform, invalidating every cached
    /// composition in the tree.
    pub fn set_local(&mut self, id: FrameId, local: Isometry3<f64>) {
        self.nodes[id.0].local = local;
        self.stamp.set(self.stamp.get() + 1);
    }

    /// Composed transform taking points in `id`'s frame to global.
    pub fn to_global(&self, id: FrameId) -> Isometry3<f64> {
        let node = &self.nodes[id.0];
        let stamp = self.stamp.get();
        if let Some((s, iso)) = node.cached.get()
            && s == stamp
        {
            return iso;
        }
        let iso = match node.parent {
            Some(p) => self.to_global(FrameId(p)) * node.local,
            None => node.local,
        };
        node.cached.set(Some((stamp, iso)));
        iso
    }

    /// Map a point from `id`'s frame into global coordinates.
    pub fn map_to_global(&self, id: FrameId, point: [f64; 3]) -> Vector3<f64> {
        let p = self.to_global(id) * Point3::new(point[0], point[1], point[2]);
        p.coords
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_offsets_compose() {
        let mut tree = FrameTree::new();
        let scope = tree.add_offset_frame(None, [1.0, 0.0, 0.0]);
        let camera = tree.add_offset_frame(Some(scope), [0.0, 2.0, 0.0]);
        let p = tree.map_to_global(camera, [0.0, 0.0, 3.0]);
        assert_eq!(p, Vector3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn ancestor_change_invalidates_descendant_cache() {
        let mut tree = FrameTree::new();
        let scope = tree.add_offset_frame(None, [1.0, 0.0, 0.0]);
        let camera = tree.add_offset_frame(Some(scope), [0.0, 1.0, 0.0]);
        assert_eq!(tree.map_to_global(camera, [0.0; 3]), Vector3::new(1.0, 1.0, 0.0));

        tree.set_local(
            scope,
            Isometry3::from_parts(Translation3::new(5.0, 0.0, 0.0), UnitQuaternion::identity()),
        );
        assert_eq!(tree.map_to_global(camera, [0.0; 3]), Vector3::new(5.0, 1.0, 0.0));
    }
}

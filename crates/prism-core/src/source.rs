//! Scene import seam.
//!
//! File importers (glTF, OBJ) live outside this workspace; they only need to
//! produce [`SceneData`]. [`ProceduralGrid`] is the built-in source used by
//! the benchmark and the GPU tests.

use crate::error::{Error, Result};
use crate::mesh::{Material, MeshData, MeshId};
use crate::scene::{Node, NodeId, SceneData};
use glam::{Mat4, Quat, Vec3};

/// Anything that can produce flat scene data.
pub trait SceneSource {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Produce the scene.
    fn load(&self) -> Result<SceneData>;
}

/// A ground plane with a square grid of cubes on top.
#[derive(Clone, Debug)]
pub struct ProceduralGrid {
    /// Cubes per side.
    pub size: u32,
    /// Distance between cube centers.
    pub spacing: f32,
}

impl Default for ProceduralGrid {
    fn default() -> Self {
        Self {
            size: 8,
            spacing: 2.0,
        }
    }
}

impl ProceduralGrid {
    /// Create a grid with `size * size` cubes.
    pub fn new(size: u32) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Transform of cube `(x, z)` at animation time `t`.
    ///
    /// Only the transform moves with time; the instance set never changes,
    /// so the top-level structure can be refit in place.
    pub fn cube_transform(&self, x: u32, z: u32, t: f32) -> Mat4 {
        let half = (self.size as f32 - 1.0) * 0.5;
        let px = (x as f32 - half) * self.spacing;
        let pz = (z as f32 - half) * self.spacing;
        let phase = (x + z) as f32 * 0.35;
        let height = 0.5 + 0.25 * (t * 2.0 + phase).sin();
        Mat4::from_rotation_translation(
            Quat::from_rotation_y(t + phase),
            Vec3::new(px, height, pz),
        )
    }
}

impl SceneSource for ProceduralGrid {
    fn name(&self) -> &str {
        "procedural-grid"
    }

    fn load(&self) -> Result<SceneData> {
        if self.size == 0 {
            return Err(Error::InvalidData("grid size must be at least 1".to_string()));
        }

        let extent = self.size as f32 * self.spacing * 0.5 + self.spacing;
        let mut scene = SceneData {
            meshes: vec![
                MeshData::plane("ground", extent, 0),
                MeshData::cube("cube", 1),
            ],
            materials: vec![
                Material::diffuse([0.6, 0.6, 0.6]),
                Material::diffuse([0.8, 0.3, 0.2]),
            ],
            ..Default::default()
        };

        let root = scene.graph.add_node(Node::new("root"))?;
        scene
            .graph
            .add_node(Node::new("ground").with_parent(root).with_mesh(MeshId(0)))?;
        for z in 0..self.size {
            for x in 0..self.size {
                scene.graph.add_node(
                    Node::new(format!("cube_{x}_{z}"))
                        .with_parent(root)
                        .with_mesh(MeshId(1))
                        .with_transform(self.cube_transform(x, z, 0.0)),
                )?;
            }
        }

        scene.validate()?;
        Ok(scene)
    }
}

/// Node ids of the grid cubes, in the order [`ProceduralGrid::load`] adds them.
pub fn grid_cube_nodes(grid: &ProceduralGrid) -> impl Iterator<Item = (NodeId, u32, u32)> + '_ {
    (0..grid.size).flat_map(move |z| {
        (0..grid.size).map(move |x| (NodeId(2 + z * grid.size + x), x, z))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_has_ground_plus_cubes() {
        let grid = ProceduralGrid::new(3);
        let scene = grid.load().unwrap();
        assert_eq!(scene.instances().len(), 1 + 9);
        assert_eq!(scene.meshes.len(), 2);
    }

    #[test]
    fn cube_node_ids_match_graph() {
        let grid = ProceduralGrid::new(2);
        let scene = grid.load().unwrap();
        for (id, x, z) in grid_cube_nodes(&grid) {
            let node = scene.graph.node(id).unwrap();
            assert_eq!(node.name, format!("cube_{x}_{z}"));
        }
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert!(ProceduralGrid::new(0).load().is_err());
    }
}

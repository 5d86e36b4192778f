//! Index-addressed scene hierarchy.
//!
//! Nodes live in a flat arena and refer to their parent by index. The graph
//! keeps a parent-before-child order so world matrices are resolved in one
//! forward pass without recursion.

use crate::error::{Error, Result};
use crate::math::Aabb;
use crate::mesh::{Material, MeshData, MeshId};
use glam::Mat4;
use serde::{Deserialize, Serialize};

/// Index of a node inside its [`SceneGraph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// One node of the hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Transform relative to the parent.
    pub local: Mat4,
    pub parent: Option<NodeId>,
    /// Mesh drawn at this node, if any.
    pub mesh: Option<MeshId>,
}

impl Node {
    /// A node with an identity transform and no mesh.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: Mat4::IDENTITY,
            parent: None,
            mesh: None,
        }
    }

    /// Set the local transform.
    pub fn with_transform(mut self, local: Mat4) -> Self {
        self.local = local;
        self
    }

    /// Set the parent node.
    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Attach a mesh.
    pub fn with_mesh(mut self, mesh: MeshId) -> Self {
        self.mesh = Some(mesh);
        self
    }
}

/// Arena of nodes plus the traversal order that visits parents first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SceneGraph {
    nodes: Vec<Node>,
    order: Vec<u32>,
}

impl SceneGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from nodes in arbitrary order, as importers produce them.
    ///
    /// Fails if a parent index is out of range or the hierarchy has a cycle.
    pub fn from_nodes(nodes: Vec<Node>) -> Result<Self> {
        let count = nodes.len();
        let mut children: Vec<Vec<u32>> = vec![Vec::new(); count];
        let mut roots = Vec::new();

        for (i, node) in nodes.iter().enumerate() {
            match node.parent {
                Some(NodeId(p)) if p as usize >= count => {
                    return Err(Error::OutOfBounds(format!(
                        "node {i} ('{}') has parent {p}, graph has {count} nodes",
                        node.name
                    )));
                }
                Some(NodeId(p)) => children[p as usize].push(i as u32),
                None => roots.push(i as u32),
            }
        }

        // Breadth-first from the roots; anything unreached sits on a cycle.
        let mut order = Vec::with_capacity(count);
        order.extend_from_slice(&roots);
        let mut head = 0;
        while head < order.len() {
            let node = order[head] as usize;
            order.extend_from_slice(&children[node]);
            head += 1;
        }

        if order.len() != count {
            let mut visited = vec![false; count];
            for &i in &order {
                visited[i as usize] = true;
            }
            let first = visited.iter().position(|v| !v).unwrap_or_default();
            return Err(Error::HierarchyCycle(first as u32));
        }

        Ok(Self { nodes, order })
    }

    /// Append a node. Its parent, if any, must already be in the graph.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = self.nodes.len() as u32;
        if let Some(NodeId(p)) = node.parent {
            if p >= id {
                return Err(Error::OutOfBounds(format!(
                    "parent {p} of '{}' is not in the graph yet",
                    node.name
                )));
            }
        }
        self.nodes.push(node);
        self.order.push(id);
        Ok(NodeId(id))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// Replace the local transform of a node.
    pub fn set_local_transform(&mut self, id: NodeId, local: Mat4) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.0 as usize)
            .ok_or_else(|| Error::OutOfBounds(format!("node {}", id.0)))?;
        node.local = local;
        Ok(())
    }

    /// All nodes in arena order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Resolve every node's world matrix, indexed by [`NodeId`].
    pub fn world_matrices(&self) -> Vec<Mat4> {
        let mut world = vec![Mat4::IDENTITY; self.nodes.len()];
        for &i in &self.order {
            let node = &self.nodes[i as usize];
            world[i as usize] = match node.parent {
                Some(NodeId(p)) => world[p as usize] * node.local,
                None => node.local,
            };
        }
        world
    }
}

/// One drawable mesh placement, flattened out of the graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneInstance {
    pub node: NodeId,
    pub mesh: MeshId,
    pub world: Mat4,
}

/// Everything a scene importer hands to the renderer.
#[derive(Clone, Debug, Default)]
pub struct SceneData {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<Material>,
    pub graph: SceneGraph,
}

impl SceneData {
    /// Flatten the graph into mesh instances, in node order.
    pub fn instances(&self) -> Vec<SceneInstance> {
        let world = self.graph.world_matrices();
        self.graph
            .nodes()
            .iter()
            .enumerate()
            .filter_map(|(i, node)| {
                node.mesh.map(|mesh| SceneInstance {
                    node: NodeId(i as u32),
                    mesh,
                    world: world[i],
                })
            })
            .collect()
    }

    /// Validate meshes and every cross reference between tables.
    pub fn validate(&self) -> Result<()> {
        for mesh in &self.meshes {
            mesh.validate()?;
            if let Some(prim) = mesh
                .primitives
                .iter()
                .find(|p| p.material_index as usize >= self.materials.len())
            {
                return Err(Error::OutOfBounds(format!(
                    "mesh '{}' uses material {}, scene has {}",
                    mesh.name,
                    prim.material_index,
                    self.materials.len()
                )));
            }
        }
        for node in self.graph.nodes() {
            if let Some(MeshId(m)) = node.mesh {
                if m as usize >= self.meshes.len() {
                    return Err(Error::OutOfBounds(format!(
                        "node '{}' uses mesh {m}, scene has {}",
                        node.name,
                        self.meshes.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// World-space bounds of all instances.
    ///
    /// Instances whose mesh id is out of range are skipped; [`Self::validate`]
    /// reports them.
    pub fn bounds(&self) -> Aabb {
        self.instances()
            .iter()
            .filter_map(|inst| {
                let mesh = self.meshes.get(inst.mesh.0 as usize)?;
                Some(mesh.bounds().transformed(inst.world))
            })
            .fold(Aabb::EMPTY, |acc, bounds| acc.union(&bounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn translate(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn world_matrices_compose_parents() {
        let mut graph = SceneGraph::new();
        let root = graph.add_node(Node::new("root").with_transform(translate(1.0))).unwrap();
        let child = graph
            .add_node(Node::new("child").with_transform(translate(2.0)).with_parent(root))
            .unwrap();
        let grandchild = graph
            .add_node(Node::new("leaf").with_transform(translate(3.0)).with_parent(child))
            .unwrap();

        let world = graph.world_matrices();
        assert_eq!(world[grandchild.0 as usize].w_axis.x, 6.0);
        assert_eq!(world[child.0 as usize].w_axis.x, 3.0);
    }

    #[test]
    fn from_nodes_sorts_children_after_parents() {
        // Child listed before its parent.
        let nodes = vec![
            Node::new("child").with_transform(translate(2.0)).with_parent(NodeId(1)),
            Node::new("root").with_transform(translate(5.0)),
        ];
        let graph = SceneGraph::from_nodes(nodes).unwrap();
        let world = graph.world_matrices();
        assert_eq!(world[0].w_axis.x, 7.0);
        assert_eq!(world[1].w_axis.x, 5.0);
    }

    #[test]
    fn from_nodes_detects_cycles() {
        let nodes = vec![
            Node::new("a").with_parent(NodeId(1)),
            Node::new("b").with_parent(NodeId(0)),
            Node::new("root"),
        ];
        assert!(matches!(
            SceneGraph::from_nodes(nodes),
            Err(Error::HierarchyCycle(0))
        ));
    }

    #[test]
    fn from_nodes_rejects_dangling_parent() {
        let nodes = vec![Node::new("a").with_parent(NodeId(4))];
        assert!(matches!(SceneGraph::from_nodes(nodes), Err(Error::OutOfBounds(_))));
    }

    #[test]
    fn add_node_requires_existing_parent() {
        let mut graph = SceneGraph::new();
        assert!(graph.add_node(Node::new("orphan").with_parent(NodeId(0))).is_err());
    }

    #[test]
    fn instances_skip_empty_nodes() {
        let mut scene = SceneData {
            meshes: vec![MeshData::cube("cube", 0)],
            materials: vec![Material::default()],
            ..Default::default()
        };
        let group = scene.graph.add_node(Node::new("group")).unwrap();
        scene
            .graph
            .add_node(Node::new("a").with_parent(group).with_mesh(MeshId(0)))
            .unwrap();
        scene
            .graph
            .add_node(
                Node::new("b")
                    .with_parent(group)
                    .with_mesh(MeshId(0))
                    .with_transform(translate(4.0)),
            )
            .unwrap();

        scene.validate().unwrap();
        let instances = scene.instances();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].world.w_axis.x, 4.0);
        assert_eq!(scene.bounds().max.x, 4.5);
    }

    #[test]
    fn bounds_skip_dangling_mesh_ids() {
        let mut scene = SceneData {
            meshes: vec![MeshData::cube("cube", 0)],
            materials: vec![Material::default()],
            ..Default::default()
        };
        scene.graph.add_node(Node::new("a").with_mesh(MeshId(0))).unwrap();
        scene
            .graph
            .add_node(
                Node::new("missing")
                    .with_mesh(MeshId(7))
                    .with_transform(translate(100.0)),
            )
            .unwrap();

        assert!(scene.validate().is_err());
        let bounds = scene.bounds();
        assert_eq!(bounds.min.x, -0.5);
        assert_eq!(bounds.max.x, 0.5);
    }

    #[test]
    fn validate_catches_bad_material() {
        let scene = SceneData {
            meshes: vec![MeshData::cube("cube", 3)],
            materials: vec![Material::default()],
            ..Default::default()
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn graph_survives_serialization() {
        let mut graph = SceneGraph::new();
        let root = graph.add_node(Node::new("root")).unwrap();
        graph
            .add_node(Node::new("child").with_parent(root).with_transform(translate(1.5)))
            .unwrap();

        let bytes = bincode::serialize(&graph).unwrap();
        let restored: SceneGraph = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.nodes(), graph.nodes());
        assert_eq!(restored.world_matrices(), graph.world_matrices());
    }
}

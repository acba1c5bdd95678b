//! Node adjacency in the HNSW graph

/// Per-node adjacency lists
///
/// The node's id is its position in `Hnsw::nodes`; layer 0 holds every node,
/// higher layers hold progressively fewer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub layers: Vec<Vec<usize>>,
}

impl Node {
    pub fn new(max_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); max_layer + 1],
        }
    }

    pub fn max_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn neighbors(&self, layer: usize) -> &[usize] {
        self.layers.get(layer).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Replace the adjacency list on `layer`. No-op above the node's top layer.
    pub fn set_neighbors(&mut self, layer: usize, neighbors: Vec<usize>) {
        if let Some(slot) = self.layers.get_mut(layer) {
            *slot = neighbors;
        }
    }

    pub fn add_neighbor(&mut self, layer: usize, neighbor_id: usize) {
        if let Some(neighbors) = self.layers.get_mut(layer) {
            if !neighbors.contains(&neighbor_id) {
                neighbors.push(neighbor_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_allocated() {
        let node = Node::new(3);
        assert_eq!(node.layers.len(), 4);
        assert_eq!(node.max_layer(), 3);
        assert!(node.neighbors(7).is_empty());
    }

    #[test]
    fn test_add_neighbor_dedups() {
        let mut node = Node::new(1);
        node.add_neighbor(0, 4);
        node.add_neighbor(0, 4);
        node.add_neighbor(1, 2);
        node.add_neighbor(5, 9);

        assert_eq!(node.neighbors(0), &[4]);
        assert_eq!(node.neighbors(1), &[2]);
    }

    #[test]
    fn test_set_neighbors() {
        let mut node = Node::new(0);
        node.add_neighbor(0, 1);
        node.set_neighbors(0, vec![3, 2]);
        node.set_neighbors(1, vec![8]);
        assert_eq!(node.neighbors(0), &[3, 2]);
        assert_eq!(node.layers.len(), 1);
    }
}

use std::io;

use crate::coords::DataCoordinates;
use crate::stream::ByteStream;

/// The rightmost node of one level of the record index tree.
///
/// Rightmost nodes live in the master node and are never found full at rest:
/// the moment one reaches `fan_out` children it is written to the data
/// stream as an immutable full node, reset, and its coordinates promoted to
/// the next level up.
#[derive(Debug, Default, Clone)]
pub struct RightmostNode {
    children: Vec<DataCoordinates>,
}

impl RightmostNode {
    pub fn add_child(&mut self, child: DataCoordinates) {
        self.children.push(child);
    }

    #[must_use]
    pub fn is_full(&self, fan_out: u32) -> bool {
        self.children.len() == fan_out as usize
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn child(&self, index: usize) -> DataCoordinates {
        self.children[index]
    }

    /// Serialization used inside the master node: each child is preceded by
    /// the one-byte height of the node it belongs to.
    pub fn write_with_height(&self, stream: &mut ByteStream, height: u8) {
        for child in &self.children {
            stream.write_u8(height);
            child.write_to(stream);
        }
    }

    /// Serialization used when flushing a full node into the data stream:
    /// just the 12-byte child tuples, no prefix of any kind.
    pub fn write_without_height(&self, stream: &mut ByteStream) {
        for child in &self.children {
            child.write_to(stream);
        }
    }

    /// Clears the children, making this an empty rightmost node again.
    pub fn reset(&mut self) {
        self.children.clear();
    }
}

/// The mutable spine of the index tree: one rightmost node per level, leaf
/// first. All updates to the tree happen here; everything to the left of the
/// spine is immutable on disk.
#[derive(Debug, Default, Clone)]
pub struct RightmostPath {
    nodes: Vec<RightmostNode>,
}

impl RightmostPath {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the master-node serialization: a 4-byte total child count, then
    /// that many `(height, coordinate)` entries.
    pub fn read_from(stream: &mut ByteStream) -> io::Result<Self> {
        let mut path = Self::new();
        let total_children = stream.next_u32()?;
        for _ in 0..total_children {
            let (height, coords) = DataCoordinates::read_height_prefixed(stream)?;
            path.rightmost_node(height).add_child(coords);
        }
        Ok(path)
    }

    /// The rightmost node at `height` (1 = leaf level), creating empty
    /// intermediate levels as needed. Empty levels are absent from the
    /// serialized form, so a deserialized path may have to grow through them
    /// to reach a higher non-empty level.
    pub fn rightmost_node(&mut self, height: u8) -> &mut RightmostNode {
        let height = height as usize;
        while self.nodes.len() < height {
            self.nodes.push(RightmostNode::default());
        }
        &mut self.nodes[height - 1]
    }

    #[must_use]
    pub fn node_at(&self, height: usize) -> &RightmostNode {
        &self.nodes[height - 1]
    }

    #[must_use]
    pub fn number_of_levels(&self) -> usize {
        self.nodes.len()
    }

    /// Total children referenced across all levels.
    #[must_use]
    pub fn descendant_count(&self) -> u32 {
        self.nodes.iter().map(|node| node.child_count() as u32).sum()
    }

    /// Record count identity: sum over levels of `children · fan_out^height`.
    #[must_use]
    pub fn compute_record_count(&self, fan_out: u32) -> u64 {
        let mut power = 1u64;
        let mut count = 0u64;
        for node in &self.nodes {
            count += node.child_count() as u64 * power;
            power *= u64::from(fan_out);
        }
        count
    }

    pub fn write_rightmost_nodes(&self, stream: &mut ByteStream) {
        stream.write_u32(self.descendant_count());
        for (index, node) in self.nodes.iter().enumerate() {
            node.write_with_height(stream, (index + 1) as u8);
        }
    }
}

/// The path of child indexes from the leaf up to the root for a 0-based
/// record position: successive remainders of division by `fan_out`.
#[must_use]
pub(crate) fn leaf_to_root_path(mut position: u64, height: usize, fan_out: u32) -> Vec<u32> {
    let fan_out = u64::from(fan_out);
    let mut path = vec![0u32; height];
    for slot in &mut path {
        *slot = (position % fan_out) as u32;
        position /= fan_out;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(n: u64) -> DataCoordinates {
        DataCoordinates::new(n, n as u32)
    }

    #[test]
    fn leaf_to_root_path_is_successive_division() {
        // position 1000 with fan_out 32: 1000 = 8 + 31*32 + 0*1024
        assert_eq!(leaf_to_root_path(1000, 3, 32), vec![8, 31, 0]);
        assert_eq!(leaf_to_root_path(0, 2, 32), vec![0, 0]);
    }

    #[test]
    fn master_serialization_round_trip() {
        let mut path = RightmostPath::new();
        path.rightmost_node(1).add_child(coords(1));
        path.rightmost_node(1).add_child(coords(2));
        path.rightmost_node(3).add_child(coords(3));

        let mut stream = ByteStream::new();
        path.write_rightmost_nodes(&mut stream);
        // count + 3 height-prefixed children
        assert_eq!(stream.len(), 4 + 3 * DataCoordinates::HEIGHT_PREFIXED_SIZE);

        let mut stream = ByteStream::from_vec(stream.into_vec());
        let decoded = RightmostPath::read_from(&mut stream).unwrap();
        assert_eq!(decoded.number_of_levels(), 3);
        assert_eq!(decoded.node_at(1).child_count(), 2);
        assert_eq!(decoded.node_at(2).child_count(), 0);
        assert_eq!(decoded.node_at(3).child_count(), 1);
        assert_eq!(decoded.node_at(3).child(0), coords(3));
    }

    #[test]
    fn record_count_weights_levels_by_fan_out_powers() {
        let mut path = RightmostPath::new();
        for _ in 0..5 {
            path.rightmost_node(1).add_child(coords(0));
        }
        for _ in 0..3 {
            path.rightmost_node(2).add_child(coords(0));
        }
        path.rightmost_node(3).add_child(coords(0));
        assert_eq!(path.compute_record_count(32), 5 + 3 * 32 + 1024);
    }

    #[test]
    fn full_node_serialization_is_bare_tuples() {
        let mut node = RightmostNode::default();
        for n in 0..4 {
            node.add_child(coords(n));
        }
        assert!(node.is_full(4));

        let mut stream = ByteStream::new();
        node.write_without_height(&mut stream);
        assert_eq!(stream.len(), 4 * DataCoordinates::SIZE);
        assert_eq!(DataCoordinates::from_slice(stream.as_slice(), 12).unwrap(), coords(1));

        node.reset();
        assert_eq!(node.child_count(), 0);
    }
}

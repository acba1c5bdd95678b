use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::node::Node;
use super::Hnsw;
use crate::format::VecWriter;
use crate::vectors::VectorFile;

const GRAPH_MAGIC: &[u8; 8] = b"ANXGRAPH";
const GRAPH_VERSION: u32 = 1;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl Hnsw {
    /// Serialize the graph topology to a writer.
    ///
    /// Vectors are not part of the graph file; they live in the companion
    /// `.vec` file written by [`Hnsw::write_vectors`].
    ///
    /// Format:
    /// - Magic: "ANXGRAPH" (8 bytes)
    /// - Header:
    ///   - Version: u32
    ///   - Dim: u32
    ///   - NumNodes: u32
    ///   - EntryPoint: u32 (u32::MAX if None)
    ///   - MaxLayer: u8
    ///   - M, M0, EfConstruction: u32 each
    ///   - AppliedSeq: u64
    /// - Body, per node in id order:
    ///   - Deleted: u8
    ///   - NodeMaxLayer: u8
    ///   - Per layer: NeighborCount u32, Neighbors [u32; NeighborCount]
    pub fn serialize<W: Write>(&self, writer: &mut W, applied_seq: u64) -> io::Result<()> {
        writer.write_all(GRAPH_MAGIC)?;
        writer.write_all(&GRAPH_VERSION.to_le_bytes())?;
        writer.write_all(&(self.dim as u32).to_le_bytes())?;
        writer.write_all(&(self.nodes.len() as u32).to_le_bytes())?;

        let entry_id = self.entry_point.map(|e| e as u32).unwrap_or(u32::MAX);
        writer.write_all(&entry_id.to_le_bytes())?;
        writer.write_all(&[self.max_layer as u8])?;

        writer.write_all(&(self.m as u32).to_le_bytes())?;
        writer.write_all(&(self.m0 as u32).to_le_bytes())?;
        writer.write_all(&(self.ef_construction as u32).to_le_bytes())?;
        writer.write_all(&applied_seq.to_le_bytes())?;

        for (node, &deleted) in self.nodes.iter().zip(self.deleted_flags()) {
            writer.write_all(&[deleted as u8])?;
            writer.write_all(&[node.max_layer() as u8])?;

            for layer_neighbors in &node.layers {
                writer.write_all(&(layer_neighbors.len() as u32).to_le_bytes())?;
                for &neighbor in layer_neighbors {
                    writer.write_all(&(neighbor as u32).to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Write the graph file and fsync it
    pub fn save<P: AsRef<Path>>(&self, path: P, applied_seq: u64) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.serialize(&mut writer, applied_seq)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Write every node's vector, tombstoned or not, to a `.vec` file
    pub fn write_vectors<P: AsRef<Path>>(&self, path: P, applied_seq: u64) -> io::Result<()> {
        let mut writer =
            VecWriter::new(path, self.dim).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if self.dim > 0 {
            for row in self.flat_vectors().chunks_exact(self.dim) {
                writer
                    .write_vector(row)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            }
        }
        writer
            .finish(applied_seq)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(())
    }

    /// Load a graph and its vectors, returning the graph's applied sequence
    ///
    /// The vector file may hold more rows than the graph has nodes (a crash
    /// between the two writes of a persist); extra rows are ignored.
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        graph_path: P,
        vectors_path: Q,
    ) -> io::Result<(Self, u64)> {
        let vectors =
            VectorFile::open(vectors_path).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let file = std::fs::File::open(graph_path)?;
        let mut reader = BufReader::new(file);
        Self::load_from_reader(&mut reader, &vectors)
    }

    pub fn load_from_reader<R: Read>(
        reader: &mut R,
        vectors: &VectorFile,
    ) -> io::Result<(Self, u64)> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != GRAPH_MAGIC {
            return Err(invalid("Invalid HNSW magic"));
        }

        let version = read_u32(reader)?;
        if version != GRAPH_VERSION {
            return Err(invalid(format!("Unsupported graph version {version}")));
        }

        let dim = read_u32(reader)? as usize;
        let num_nodes = read_u32(reader)? as usize;
        let entry_point_raw = read_u32(reader)?;
        let entry_point = (entry_point_raw != u32::MAX).then_some(entry_point_raw as usize);
        let max_layer = read_u8(reader)? as usize;
        let m = read_u32(reader)? as usize;
        let m0 = read_u32(reader)? as usize;
        let ef_construction = read_u32(reader)? as usize;
        let applied_seq = read_u64(reader)?;

        if vectors.dim() != dim {
            return Err(invalid(format!(
                "Vector file dimension {} does not match graph dimension {}",
                vectors.dim(),
                dim
            )));
        }
        if vectors.len() < num_nodes {
            return Err(invalid(format!(
                "Vector file holds {} vectors, graph has {} nodes",
                vectors.len(),
                num_nodes
            )));
        }
        if entry_point.is_some_and(|e| e >= num_nodes) {
            return Err(invalid("Entry point out of range"));
        }

        let mut nodes = Vec::with_capacity(num_nodes);
        let mut deleted = Vec::with_capacity(num_nodes);

        for _ in 0..num_nodes {
            deleted.push(read_u8(reader)? != 0);
            let node_max_layer = read_u8(reader)? as usize;

            let mut layers = Vec::with_capacity(node_max_layer + 1);
            for _ in 0..=node_max_layer {
                let count = read_u32(reader)? as usize;
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    let neighbor = read_u32(reader)? as usize;
                    if neighbor >= num_nodes {
                        return Err(invalid(format!("Neighbor id {neighbor} out of range")));
                    }
                    neighbors.push(neighbor);
                }
                layers.push(neighbors);
            }
            nodes.push(Node { layers });
        }

        let flat = vectors
            .to_flat(num_nodes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let graph = Hnsw::from_parts(
            dim,
            nodes,
            flat,
            deleted,
            entry_point,
            max_layer,
            m,
            m0,
            ef_construction,
        );
        Ok((graph, applied_seq))
    }
}

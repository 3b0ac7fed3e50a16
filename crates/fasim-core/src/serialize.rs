//! Versioned binary encoding of graphs and snapshots via `bitcode`.
//!
//! Every blob starts with a [`FormatHeader`] carrying a magic number and
//! format version, checked before the payload is used. Graphs are encoded
//! without their catalog; decoding re-attaches a catalog and rejects
//! graphs that name recipes or items it does not have. Slot keys are
//! encoded as-is, so decoded `NodeId` and `EdgeId` values equal the
//! originals.

use crate::catalog::RecipeCatalog;
use crate::graph::{GraphError, GraphStore, ProductionGraph};
use crate::snapshot::SimulationSnapshot;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying an encoded production graph.
pub const GRAPH_MAGIC: u32 = 0xFA51_0001;

/// Magic number identifying an encoded simulation snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xFA51_0002;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("data too short for format header")]
    TooShort,
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{found:08X}")]
    InvalidMagic { expected: u32, found: u32 },
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("data from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("graph does not match the catalog: {0}")]
    CatalogMismatch(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed eight-byte prefix of every encoded blob: magic then version, both
/// little-endian. Read without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    pub magic: u32,
    pub version: u32,
}

impl FormatHeader {
    pub const LEN: usize = 8;

    fn new(magic: u32) -> Self {
        Self {
            magic,
            version: FORMAT_VERSION,
        }
    }

    fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    fn validate(&self, expected: u32) -> Result<(), DeserializeError> {
        if self.magic != expected {
            return Err(DeserializeError::InvalidMagic {
                expected,
                found: self.magic,
            });
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Read the header of an encoded graph or snapshot.
pub fn read_header(data: &[u8]) -> Result<FormatHeader, DeserializeError> {
    let (magic, rest) = data
        .split_first_chunk::<4>()
        .ok_or(DeserializeError::TooShort)?;
    let (version, _) = rest
        .split_first_chunk::<4>()
        .ok_or(DeserializeError::TooShort)?;
    Ok(FormatHeader {
        magic: u32::from_le_bytes(*magic),
        version: u32::from_le_bytes(*version),
    })
}

fn encode<T: Serialize>(magic: u32, payload: &T) -> Result<Vec<u8>, SerializeError> {
    let body = bitcode::serialize(payload).map_err(|e| SerializeError::Encode(e.to_string()))?;
    let mut out = Vec::with_capacity(FormatHeader::LEN + body.len());
    out.extend_from_slice(&FormatHeader::new(magic).to_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Validate the header, then decode the payload behind it.
fn decode<T: for<'de> Deserialize<'de>>(data: &[u8], magic: u32) -> Result<T, DeserializeError> {
    read_header(data)?.validate(magic)?;
    bitcode::deserialize(&data[FormatHeader::LEN..])
        .map_err(|e| DeserializeError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Graphs
// ---------------------------------------------------------------------------

/// Encode the graph's nodes, edges, slot bindings and revision.
pub fn encode_graph(graph: &ProductionGraph) -> Result<Vec<u8>, SerializeError> {
    encode(GRAPH_MAGIC, graph.store())
}

/// Decode a graph and attach `catalog`.
pub fn decode_graph(
    data: &[u8],
    catalog: Arc<RecipeCatalog>,
) -> Result<ProductionGraph, DeserializeError> {
    let store: GraphStore = decode(data, GRAPH_MAGIC)?;
    store.check_against(&catalog)?;
    tracing::debug!(bytes = data.len(), "decoded production graph");
    Ok(ProductionGraph::from_store(catalog, store))
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

pub fn encode_snapshot(snapshot: &SimulationSnapshot) -> Result<Vec<u8>, SerializeError> {
    encode(SNAPSHOT_MAGIC, snapshot)
}

pub fn decode_snapshot(data: &[u8]) -> Result<SimulationSnapshot, DeserializeError> {
    decode(data, SNAPSHOT_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogBuilder;
    use crate::driver::SimulationDriver;
    use crate::solver::solve_steady;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: Graph round trip keeps ids and structure
    // -----------------------------------------------------------------------
    #[test]
    fn graph_round_trip_keeps_ids() {
        let (mut graph, looped) = recycling_loop();
        graph.set_label(looped.refinery, "refinery").unwrap();
        graph
            .set_buffer_capacity(looped.refinery, item("iron_ore"), fixed(4.0))
            .unwrap();

        let bytes = encode_graph(&graph).unwrap();
        let decoded = decode_graph(&bytes, test_catalog()).unwrap();

        assert_eq!(decoded.node_count(), graph.node_count());
        assert_eq!(decoded.edge_count(), graph.edge_count());
        assert_eq!(decoded.revision(), graph.revision());
        for (id, data) in graph.nodes() {
            assert_eq!(decoded.node(id), Some(data));
            assert_eq!(decoded.input_slots(id), graph.input_slots(id));
            assert_eq!(decoded.output_slots(id), graph.output_slots(id));
        }
        for (id, data) in graph.edges() {
            assert_eq!(decoded.edge(id), Some(data));
        }
        assert_eq!(decoded.find_by_label("refinery"), Some(looped.refinery));
    }

    // -----------------------------------------------------------------------
    // Test 2: Decoded graph solves identically and stays editable
    // -----------------------------------------------------------------------
    #[test]
    fn decoded_graph_solves_identically() {
        let (graph, line) = smelter_line(Some(1.5), 2.0);
        let mut decoded = decode_graph(&encode_graph(&graph).unwrap(), test_catalog()).unwrap();

        assert_eq!(solve_steady(&decoded).unwrap(), solve_steady(&graph).unwrap());

        // New keys must not collide with decoded ones.
        let extra = decoded.add_sink(item("iron_plate"), None).unwrap();
        assert!(extra != line.sink && extra != line.source && extra != line.machine);
    }

    // -----------------------------------------------------------------------
    // Test 3: Catalog mismatch is rejected
    // -----------------------------------------------------------------------
    #[test]
    fn unknown_recipe_is_rejected() {
        let (graph, _) = smelter_line(None, 1.0);
        let bytes = encode_graph(&graph).unwrap();

        let mut builder = CatalogBuilder::new();
        builder.register_item("iron_ore");
        builder.register_item("iron_plate");
        let empty = Arc::new(builder.seal());

        let err = decode_graph(&bytes, empty).unwrap_err();
        assert!(matches!(
            err,
            DeserializeError::CatalogMismatch(GraphError::UnknownRecipe(_))
        ));
    }

    #[test]
    fn unknown_item_is_rejected() {
        let mut graph = new_graph();
        source(&mut graph, "slag", None);
        let bytes = encode_graph(&graph).unwrap();

        let mut builder = CatalogBuilder::new();
        builder.register_item("iron_ore");
        let err = decode_graph(&bytes, Arc::new(builder.seal())).unwrap_err();
        assert!(matches!(
            err,
            DeserializeError::CatalogMismatch(GraphError::UnknownItem(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 4: Header checks
    // -----------------------------------------------------------------------
    #[test]
    fn header_validation() {
        let ok = FormatHeader::new(GRAPH_MAGIC);
        assert!(ok.validate(GRAPH_MAGIC).is_ok());
        assert!(matches!(
            ok.validate(SNAPSHOT_MAGIC),
            Err(DeserializeError::InvalidMagic { .. })
        ));
        let future = FormatHeader {
            magic: GRAPH_MAGIC,
            version: FORMAT_VERSION + 1,
        };
        assert!(matches!(
            future.validate(GRAPH_MAGIC),
            Err(DeserializeError::FutureVersion(_))
        ));
        let old = FormatHeader {
            magic: GRAPH_MAGIC,
            version: 0,
        };
        assert!(matches!(
            old.validate(GRAPH_MAGIC),
            Err(DeserializeError::UnsupportedVersion(0))
        ));
    }

    #[test]
    fn snapshot_bytes_are_not_a_graph() {
        let (graph, _) = smelter_line(None, 1.0);
        let mut driver = SimulationDriver::with_defaults(graph);
        let snapshot = driver.start().unwrap();
        let bytes = encode_snapshot(&snapshot).unwrap();

        assert_eq!(read_header(&bytes).unwrap().magic, SNAPSHOT_MAGIC);
        assert!(matches!(
            decode_graph(&bytes, test_catalog()),
            Err(DeserializeError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            decode_snapshot(&[0xFF, 0x00, 0x13]),
            Err(DeserializeError::TooShort)
        ));

        let mut bytes = FormatHeader::new(SNAPSHOT_MAGIC).to_bytes().to_vec();
        bytes.extend_from_slice(&[0xFF, 0x00, 0x13]);
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(DeserializeError::Decode(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 5: Snapshot round trip
    // -----------------------------------------------------------------------
    #[test]
    fn snapshot_round_trip() {
        let (graph, line) = storage_line(3.0);
        let mut driver = SimulationDriver::with_defaults(graph);
        driver.start().unwrap();
        driver.run(2).unwrap();
        let snapshot = driver.latest_snapshot().unwrap();

        let decoded = decode_snapshot(&encode_snapshot(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded, *snapshot);
        assert_eq!(decoded.buffer(line.sink, item("iron_plate")), fixed(2.0));
        assert_eq!(decoded.state_hash, snapshot.state_hash);
    }
}

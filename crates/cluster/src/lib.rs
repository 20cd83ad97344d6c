mod connstr;
mod facade;
pub mod mem;
mod topology;

pub use connstr::{dial, normalize, ConnstrError, URI_START};
pub use facade::{Cluster, WriteConcern, WriteConn, WriteError};
pub use topology::{Chunk, ChunkId, ChunkMap, KeyBound, Namespace, ShardId, TopologyError};

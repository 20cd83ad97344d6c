use keys::{KeySpec, ShardKey};
use std::cmp::Ordering;
use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    #[error("namespace {0:?} is not of the form database.collection")]
    BadNamespace(String),
    #[error("cluster returned an empty chunk map")]
    EmptyChunkMap,
    #[error("chunk map does not cover the key space from its minimum")]
    UncoveredMin,
    #[error("chunk map does not cover the key space through its maximum")]
    UncoveredMax,
}

/// Identifier of a destination shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one contiguous key range owned by exactly one shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully-qualified collection namespace, `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `database.collection`. The collection part may itself
    /// contain dots.
    pub fn parse(ns: &str) -> Result<Self, TopologyError> {
        match ns.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self::new(database, collection))
            }
            _ => Err(TopologyError::BadNamespace(ns.to_string())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// One endpoint of a chunk's key range.
#[derive(Debug, Clone)]
pub enum KeyBound {
    /// Below every key.
    Min,
    Key(ShardKey),
    /// Above every key.
    Max,
}

impl KeyBound {
    /// Order this bound against an extracted key.
    pub fn compare_key(&self, spec: &KeySpec, key: &ShardKey) -> Ordering {
        match self {
            KeyBound::Min => Ordering::Less,
            KeyBound::Key(bound) => spec.compare(bound, key),
            KeyBound::Max => Ordering::Greater,
        }
    }

    fn compare_bound(&self, spec: &KeySpec, other: &KeyBound) -> Ordering {
        match (self, other) {
            (KeyBound::Min, KeyBound::Min) | (KeyBound::Max, KeyBound::Max) => Ordering::Equal,
            (KeyBound::Min, _) | (_, KeyBound::Max) => Ordering::Less,
            (_, KeyBound::Min) | (KeyBound::Max, _) => Ordering::Greater,
            (KeyBound::Key(lhs), KeyBound::Key(rhs)) => spec.compare(lhs, rhs),
        }
    }
}

/// Chunk is a contiguous half-open key range `[min, max)` owned by one
/// shard at a moment in time.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub shard: ShardId,
    pub min: KeyBound,
    pub max: KeyBound,
}

impl Chunk {
    pub fn contains(&self, spec: &KeySpec, key: &ShardKey) -> bool {
        self.min.compare_key(spec, key) != Ordering::Greater
            && self.max.compare_key(spec, key) == Ordering::Greater
    }
}

/// ChunkMap is the cluster's chunk layout for one namespace, frozen for
/// the duration of a load (the balancer is stopped on entry). Chunks are
/// held sorted by their minimum bound so that routing is a binary search.
#[derive(Debug, Clone)]
pub struct ChunkMap {
    spec: KeySpec,
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    pub fn new(spec: KeySpec, mut chunks: Vec<Chunk>) -> Result<Self, TopologyError> {
        if chunks.is_empty() {
            return Err(TopologyError::EmptyChunkMap);
        }
        chunks.sort_by(|l, r| l.min.compare_bound(&spec, &r.min));

        if !matches!(chunks.first().unwrap().min, KeyBound::Min) {
            return Err(TopologyError::UncoveredMin);
        }
        if !matches!(chunks.last().unwrap().max, KeyBound::Max) {
            return Err(TopologyError::UncoveredMax);
        }
        Ok(Self { spec, chunks })
    }

    pub fn spec(&self) -> &KeySpec {
        &self.spec
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Distinct owning shards, in chunk order.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards = Vec::new();
        for chunk in &self.chunks {
            if !shards.contains(&chunk.shard) {
                shards.push(chunk.shard.clone());
            }
        }
        shards
    }

    /// Find the chunk owning |key|: the last chunk whose minimum bound
    /// does not exceed it.
    pub fn route(&self, key: &ShardKey) -> Option<&Chunk> {
        self.route_index(key).map(|index| &self.chunks[index])
    }

    /// As `route`, but returning the chunk's position in `chunks()`.
    pub fn route_index(&self, key: &ShardKey) -> Option<usize> {
        let index = self
            .chunks
            .partition_point(|c| c.min.compare_key(&self.spec, key) != Ordering::Greater)
            .checked_sub(1)?;

        self.chunks[index].contains(&self.spec, key).then_some(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn map_of(splits: &[i64]) -> ChunkMap {
        let spec = KeySpec::parse(r#"{"k": 1}"#).unwrap();
        let mut bounds = vec![KeyBound::Min];
        for s in splits {
            bounds.push(KeyBound::Key(ShardKey::from(vec![json!(s)])));
        }
        bounds.push(KeyBound::Max);

        let chunks = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| Chunk {
                id: ChunkId::new(format!("c{i}")),
                shard: ShardId::new(format!("s{}", i % 2)),
                min: w[0].clone(),
                max: w[1].clone(),
            })
            .collect();

        ChunkMap::new(spec, chunks).unwrap()
    }

    #[test]
    fn test_route_binary_search() {
        let map = map_of(&[0, 100]);

        let key = |v: i64| ShardKey::from(vec![json!(v)]);
        assert_eq!(map.route(&key(-5)).unwrap().id.as_str(), "c0");
        assert_eq!(map.route(&key(0)).unwrap().id.as_str(), "c1");
        assert_eq!(map.route(&key(99)).unwrap().id.as_str(), "c1");
        assert_eq!(map.route(&key(100)).unwrap().id.as_str(), "c2");
        assert_eq!(map.route(&key(1 << 40)).unwrap().id.as_str(), "c2");
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("db.users.archive").unwrap();
        assert_eq!(ns.database, "db");
        assert_eq!(ns.collection, "users.archive");
        assert_eq!(ns.to_string(), "db.users.archive");

        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
    }

    #[test]
    fn test_rejects_uncovered_maps() {
        let spec = KeySpec::parse(r#"{"k": 1}"#).unwrap();
        assert!(matches!(
            ChunkMap::new(spec.clone(), vec![]),
            Err(TopologyError::EmptyChunkMap)
        ));

        let partial = vec![Chunk {
            id: ChunkId::new("c0"),
            shard: ShardId::new("s0"),
            min: KeyBound::Key(ShardKey::from(vec![json!(0)])),
            max: KeyBound::Max,
        }];
        assert!(matches!(
            ChunkMap::new(spec, partial),
            Err(TopologyError::UncoveredMin)
        ));
    }

    #[test]
    fn test_shards_are_distinct_and_ordered() {
        let map = map_of(&[0, 100, 200]);
        let shards = map.shards();
        assert_eq!(shards, vec![ShardId::new("s0"), ShardId::new("s1")]);
    }
}

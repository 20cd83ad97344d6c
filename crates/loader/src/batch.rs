use keys::ShardKey;
use serde_json::Value;

/// Batch is a sealed, immutable group of documents all destined for one
/// chunk. Keys and bodies are kept as parallel arrays so that the write
/// path can hand the bare bodies to a connection without copying.
pub struct Batch {
    keys: Box<[ShardKey]>,
    bodies: Box<[Value]>,
    approx_bytes: usize,
}

impl Batch {
    pub fn from_pairs(pairs: Vec<(ShardKey, Value)>) -> Self {
        let approx_bytes = pairs.iter().map(|(_, body)| approx_size(body)).sum();
        let (keys, bodies): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self {
            keys: keys.into(),
            bodies: bodies.into(),
            approx_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn keys(&self) -> &[ShardKey] {
        &self.keys
    }

    pub fn bodies(&self) -> &[Value] {
        &self.bodies
    }

    /// Rough in-memory footprint, used for disk-spill accounting.
    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn into_pairs(self) -> impl Iterator<Item = (ShardKey, Value)> {
        self.keys.into_vec().into_iter().zip(self.bodies.into_vec())
    }
}

/// BatchBuilder accumulates documents for one chunk and seals them into
/// a Batch when the configured batch size is reached. One builder per
/// chunk is shared by all batcher workers under the chunk's lock.
pub struct BatchBuilder {
    keys: Vec<ShardKey>,
    bodies: Vec<Value>,
    approx_bytes: usize,
    batch_size: usize,
}

impl BatchBuilder {
    pub fn new(batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            keys: Vec::new(),
            bodies: Vec::new(),
            approx_bytes: 0,
            batch_size,
        }
    }

    /// Append one document. When the builder reaches the batch size it
    /// seals and returns the full batch, leaving itself empty.
    pub fn push(&mut self, key: ShardKey, body: Value) -> Option<Batch> {
        self.approx_bytes += approx_size(&body);
        self.keys.push(key);
        self.bodies.push(body);

        (self.keys.len() >= self.batch_size).then(|| self.seal()).flatten()
    }

    /// Seal whatever is buffered, leaving the builder empty.
    pub fn seal(&mut self) -> Option<Batch> {
        if self.keys.is_empty() {
            return None;
        }
        let batch = Batch {
            keys: std::mem::take(&mut self.keys).into(),
            bodies: std::mem::take(&mut self.bodies).into(),
            approx_bytes: self.approx_bytes,
        };
        self.approx_bytes = 0;
        Some(batch)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// A cheap structural estimate of a JSON value's in-memory size.
pub(crate) fn approx_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len(),
        Value::Array(items) => 24 + items.iter().map(approx_size).sum::<usize>(),
        Value::Object(fields) => {
            24 + fields
                .iter()
                .map(|(k, v)| 24 + k.len() + approx_size(v))
                .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn key(v: i64) -> ShardKey {
        ShardKey::from(vec![json!(v)])
    }

    #[test]
    fn test_builder_seals_at_batch_size() {
        let mut builder = BatchBuilder::new(3);
        assert!(builder.push(key(1), json!({"k": 1})).is_none());
        assert!(builder.push(key(2), json!({"k": 2})).is_none());

        let batch = builder.push(key(3), json!({"k": 3})).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(builder.is_empty());
        assert_eq!(batch.keys().len(), batch.bodies().len());
    }

    #[test]
    fn test_seal_remainder() {
        let mut builder = BatchBuilder::new(10);
        assert!(builder.seal().is_none());

        builder.push(key(1), json!({"k": 1}));
        let batch = builder.seal().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(builder.seal().is_none());
    }

    #[test]
    fn test_approx_bytes_accumulates() {
        let mut builder = BatchBuilder::new(2);
        builder.push(key(1), json!({"name": "ada"}));
        let batch = builder.push(key(2), json!({"name": "grace"})).unwrap();
        assert!(batch.approx_bytes() > 0);
    }
}

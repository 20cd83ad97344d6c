mod compare;
mod extract;
mod spec;

pub use compare::compare;
pub use extract::{hash_value, ExtractError, ShardKey};
pub use spec::{Error, KeyField, KeySpec, Order};

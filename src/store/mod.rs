//! Storage: hot map, cold file, secondary indexes, collections

pub mod cold;
pub mod collection;
pub mod hot;
pub mod index;

pub use cold::ColdStore;
pub use collection::Collection;
pub use hot::{Entry, Store};
pub use index::{Bound, FieldIndex, IndexKey};

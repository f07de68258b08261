//! The btree index: on-disk node format, tree operations, cursors and
//! per-index statistics.

pub mod cursor;
pub mod index;
pub mod node;
pub mod stats;

pub use cursor::Cursor;
pub use index::{BtreeIndex, Collision, Found, MatchDirection, MatchFlags, NearMatch};
pub use node::{NodeValue, RecordValue};
pub use stats::BtreeStatistics;

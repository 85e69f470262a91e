//! Shard routing
//!
//! Statements are routed by a shard key value, discovered from bind names or
//! passed explicitly, which maps through a bucket table to a logical shard.

mod map;
mod router;

pub use map::{
    ShardKeyValue, ShardMap, ShardMapEntry, ShardMapRecord, ShardMapRefresher, ShardMapStore,
    Whitelist, WhitelistEntry, FLAG_BAD_LOGICAL, FLAG_NOT_FOUND, FLAG_READ_STATUS_N,
    FLAG_WHITELIST, FLAG_WRITE_STATUS_N,
};
pub use router::{ShardContext, ShardRejection, ShardRouter};

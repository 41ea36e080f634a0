pub mod feed;
pub mod graph;

pub use feed::{FeedStore, MemoryFeedStore, RedisFeedStore};
pub use graph::{MemorySocialGraphStore, RedisSocialGraphStore, SocialGraphStore};

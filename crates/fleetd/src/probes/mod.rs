//! Lightweight robot health probes used by the background monitor and the
//! batch reachability check.

pub mod battery;
pub mod reachability;
pub mod topics;

pub use battery::parse_battery;
pub use reachability::Reachability;
pub use topics::{TopicTest, TopicsPresence, parse_topics_presence, topic_tests};

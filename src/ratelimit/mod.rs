//! Rate limiting logic and state management.

pub mod checker;
pub mod identity;

mod decision;
mod limiter;
mod settings;
mod store;

pub use decision::{DecisionRecord, DimensionState, Quota};
pub use identity::{IpWhitelist, UserWhitelist};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use settings::{
    limit_exceeded_response, CacheSettings, Dimension, Limit, LimitExceededResponder,
    ProxyIpExtractor, RouteSettings, Settings, SEGMENT_PREFIX,
};
pub use store::{Cached, CounterStore, MemoryStore, Segment, StoredValue};

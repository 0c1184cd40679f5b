//! Siphon Intercept - the network interception and caching engine.
//!
//! An [`InterceptionDispatcher`] sits between an embedded browsing surface
//! and the network. It receives every paused exchange from an
//! [`InstrumentationChannel`], serves what it can from the [`CacheStore`],
//! revalidates stale entries out of band, writes cacheable responses
//! through, fans traffic out to rule sets over an [`EventBus`] and blocks
//! known trackers. Every exchange gets exactly one disposition.
//!
//! [`CacheStore`]: siphon_storage::CacheStore

pub mod channel;
pub mod decode;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod promotion;
pub mod revalidator;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{AttachedChannel, InstrumentationChannel, PausedExchange, ResourceType, Stage};
pub use decode::{decode_content, ContentEncoding};
pub use dispatcher::{InterceptionDispatcher, BLOCKED_REASON, CACHE_MARKER_VALUE};
pub use error::{ErrorKind, InterceptError, Result};
pub use events::{EventBus, InterceptEvent};
pub use promotion::PromotionBatcher;
pub use revalidator::{conditional_headers, Revalidator, ValidationResult, Validator, ACCEPT_ENCODING};
pub use stats::{DispatcherStats, StatsSnapshot};

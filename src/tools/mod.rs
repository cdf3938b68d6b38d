//! 工具层：元数据缓存、连接池与传输、选择器、执行器

pub mod cache;
pub mod descriptor;
pub mod executor;
pub mod mock;
pub mod pool;
pub mod protocol;
pub mod selector;
pub mod sse;
pub mod stdio;
pub mod store;
pub mod transport;

pub use cache::{CacheConfig, CacheEntry, CacheLookup, Freshness, ToolCache};
pub use descriptor::{ArgumentSchema, ToolDescriptor};
pub use executor::{ActionExecutor, ActionResult, ExecutorConfig, RetryPolicy};
pub use mock::MockToolServer;
pub use pool::{CallOutcome, ConnectionPool, Health, PoolConfig, PoolGuard};
pub use protocol::{RemoteTool, ToolResponse};
pub use selector::{LlmRanker, RuleRanker, ScoredTool, Selection, SelectorConfig, ToolRanker, ToolSelector};
pub use store::{CacheRecord, CacheStore, JsonDirStore, SqliteStore};
pub use transport::{connector_for, Connector, ToolConnection};

pub mod agents;
pub mod config;
pub mod error;
pub mod frame;
pub mod manager;
pub mod server;
pub mod sink;
pub mod stream;

pub use agents::AgentRuns;
pub use config::ServerConfig;
pub use error::{SendError, StreamError};
pub use manager::{BroadcastOutcome, EventStreamManager, ManagerConfig, Subscription};
pub use server::{build_router, start, AppState, ServerHandle};
pub use sink::{ChannelSink, EventSink};

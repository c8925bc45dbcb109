pub mod events;
pub mod ids;

pub use events::{EventCategory, EventData, EventScope, LaceEvent, StreamEvent};
pub use ids::{ConnectionId, ProjectId, SessionId, TaskId, ThreadId};

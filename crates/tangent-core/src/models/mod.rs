pub mod message;
pub mod session;
pub mod sessions_store;

pub use message::{
    ContentPart, FinishReason, Message, MessageRole, MessageStatus, TokenUsage, ToolCallState,
};
pub use session::{ForkBucket, ForkList, MessageLocation, Session, Thread};
pub use sessions_store::{SessionChange, SessionStore};

pub mod fork_service;
pub mod llm_service;
pub mod storage_service;
pub mod stream_assembler;
pub mod thread_service;

pub use fork_service::SwitchDirection;
pub use llm_service::{ChatContext, ChatModel, ChunkStream, StreamChunk};
pub use storage_service::{BlobStorage, FsBlobStorage, InMemoryBlobStorage};
pub use stream_assembler::StreamAssembler;

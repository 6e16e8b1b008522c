pub mod analysis;
pub mod chat;
pub mod config;
pub mod error;
pub mod gemini;
pub mod inflight;
pub mod models;
pub mod selection;
pub mod storage;
pub mod timestamp;

#[cfg(test)]
pub(crate) mod test_support;

pub use analysis::{AnalysisError, AnalysisOutcome, AnalysisRequestor};
pub use chat::{ChatError, ChatReply, ChatRequestor};
pub use config::NeuroscanConfig;
pub use error::{ErrorKind, NeuroscanError};
pub use gemini::{GeminiClient, GenerativeModel, ModelError, Prompt, PromptPart};
pub use inflight::{GuardError, InFlightGuard, InFlightTicket, OperationKind};
pub use models::{Analysis, ScanImage, ScanRecord, ScanTags};
pub use selection::{
    ClientSelection, FileSelectionStore, ImagePreview, InMemorySelectionStore, SelectionError,
    SelectionStore,
};
pub use storage::{
    create_store_from_config, InMemoryScanStore, S3ScanStore, ScanStore, StoreError,
    TimestampClaims,
};
pub use timestamp::ScanTimestamp;

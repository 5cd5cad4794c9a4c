pub mod checkpoint;
pub mod ingest_run;
pub mod media_item;
pub mod scraped_item;
pub mod source;
pub mod thread;

pub use checkpoint::{CatchUpCursor, CatchUpReason, Checkpoint};
pub use ingest_run::{IngestRun, RunStatus};
pub use media_item::{BlockedMedia, MediaAsset, MediaItem, MediaUrls};
pub use scraped_item::{MediaType, ScrapedAsset, ScrapedItem, SourceMetrics};
pub use source::{AdapterConfig, AdapterKind, GenericHtmlConfig, HtmlSelectors, RateLimitConfig, Source};
pub use thread::Thread;

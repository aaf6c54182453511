pub mod inference;
pub mod ingestion;
pub mod ocr;
pub mod post_source;
pub mod rate_limit;
pub mod sanitizer;

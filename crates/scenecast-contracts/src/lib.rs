pub mod events;
pub mod jobs;
pub mod language;
pub mod receipts;
pub mod rewrite;

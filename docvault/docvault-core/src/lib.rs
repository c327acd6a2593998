pub mod content;
pub mod errors;
pub mod events;
pub mod folders;
pub mod indexer;
pub mod model;
pub mod versions;

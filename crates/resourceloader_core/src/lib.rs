pub mod cache;
pub mod config;
pub mod context;
pub mod css;
pub mod deps;
pub mod message_blob;
pub mod migrate;
pub mod module;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod timestamp;

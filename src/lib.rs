pub mod config;
pub mod cursor;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod incremental;
pub mod indexing;
pub mod jobs;
pub mod model;
pub mod partition;
pub mod planner;
pub mod progress;
pub mod provider;
pub mod queue;
pub mod throttle;
pub mod window;

pub mod event_publisher;
pub mod expiry_scheduler;
pub mod user_directory;

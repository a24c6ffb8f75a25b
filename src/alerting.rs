pub mod engine;
pub mod eval_context;
pub mod notification_service;
pub mod notifier;
pub mod notifiers;
pub mod registry;
pub mod result_handler;
pub mod sender;
pub mod store;

pub mod event_bus;
pub mod models;
pub mod registry;
pub mod session;
pub mod settings;

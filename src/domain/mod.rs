pub mod events;
pub mod models;
pub mod registry;
pub mod settings;

pub mod analyze;
pub mod chat;
pub mod history;
pub mod viewer;

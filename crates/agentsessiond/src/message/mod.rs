pub mod models;
pub mod repository;

pub use models::{Message, MessageRole};
pub use repository::MessageRepository;

pub mod models;
pub mod repository;

pub use models::{CreateSessionRequest, Session, SessionRef, SessionStatus};
pub use repository::SessionRepository;

//! Shared application state injected into every handler.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::config::AppConfig;
use crate::event::EventBus;
use crate::message::MessageRepository;
use crate::runner::SessionRunner;
use crate::session::SessionRepository;
use crate::user::{IdentityRepository, RepoRepository, UserRepository};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRepository,
    pub messages: MessageRepository,
    pub users: UserRepository,
    pub identities: IdentityRepository,
    pub repos: RepoRepository,
    pub bus: EventBus,
    pub runner: SessionRunner,
    pub auth: AuthState,
    pub config: Arc<AppConfig>,
}

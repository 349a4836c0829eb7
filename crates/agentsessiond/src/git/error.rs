use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("clone: {0}")]
    Clone(String),

    #[error("worktree: {0}")]
    Worktree(String),

    #[error("diff: {0}")]
    Diff(String),

    #[error("commit: {0}")]
    Commit(String),

    #[error("push: {0}")]
    Push(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type GitResult<T> = Result<T, GitError>;

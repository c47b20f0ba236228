use miette::Diagnostic;
use thiserror::Error;

use crate::rules::errors::CompileError;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(docguard::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(docguard::config))]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Policy(#[from] CompileError),
}

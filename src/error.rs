use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ConvergeError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A required artifact is missing before any action was attempted.
    #[error("{message}")]
    #[diagnostic(code(vmconverge::precondition))]
    Precondition { message: String },

    /// An external action exited non-zero.
    #[error("{message} (exit code {code})")]
    #[diagnostic(code(vmconverge::action), help("stderr: {stderr}"))]
    ActionFailed {
        message: String,
        code: i32,
        stderr: String,
    },

    /// An action reported success but its artifact never appeared.
    #[error("{message}")]
    #[diagnostic(code(vmconverge::postcondition))]
    Postcondition { message: String },

    #[error("could not parse {tool} output: {message}")]
    OutputParse { tool: String, message: String },

    #[error("failed to run {program}")]
    #[diagnostic(help("{hint}"))]
    Spawn {
        program: String,
        hint: String,
        #[source]
        source: std::io::Error,
    },
}

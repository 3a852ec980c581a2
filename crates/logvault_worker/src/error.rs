use logvault_db::DbError;
use logvault_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

const MAX_STDERR_IN_MESSAGE: usize = 500;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("{binary} exited with code {code}: {stderr}")]
    ExitCode {
        binary: String,
        code: i32,
        stderr: String,
    },

    #[error("{binary} terminated by signal: {stderr}")]
    Signal { binary: String, stderr: String },

    #[error("Unreadable task output: {0}")]
    Output(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// Map a child's exit status to an error, keeping stderr short.
    pub fn from_exit(binary: &str, code: Option<i32>, stderr: &str) -> Self {
        let stderr = truncate(stderr.trim());
        match code {
            Some(code) => WorkerError::ExitCode {
                binary: binary.to_string(),
                code,
                stderr,
            },
            None => WorkerError::Signal {
                binary: binary.to_string(),
                stderr,
            },
        }
    }
}

fn truncate(stderr: &str) -> String {
    if stderr.len() <= MAX_STDERR_IN_MESSAGE {
        return stderr.to_string();
    }
    let mut end = MAX_STDERR_IN_MESSAGE;
    while !stderr.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &stderr[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exit_code_and_signal() {
        let err = WorkerError::from_exit("clp-s", Some(2), "bad input\n");
        assert_eq!(err.to_string(), "clp-s exited with code 2: bad input");

        let err = WorkerError::from_exit("clp-s", None, "");
        assert!(matches!(err, WorkerError::Signal { .. }));
    }

    #[test]
    fn test_long_stderr_is_truncated() {
        let err = WorkerError::from_exit("clp", Some(1), &"x".repeat(2_000));
        let message = err.to_string();
        assert!(message.ends_with("... (truncated)"));
        assert!(message.len() < 600);
    }
}

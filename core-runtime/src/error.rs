use thiserror::Error;

/// Failures raised while setting up the runtime (logging, filters).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = Error::Config("Invalid log filter: bad".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid log filter: bad");
    }
}

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    /// Reading or writing the settings file failed.
    Io { path: PathBuf, message: String },
    /// The file content is not valid JSON/TOML for `EngineSettings`.
    Parse { path: PathBuf, message: String },
    /// The file extension is neither `.json` nor `.toml`.
    UnsupportedFormat(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, message } => write!(f, "{}: {message}", path.display()),
            Self::Parse { path, message } => {
                write!(f, "cannot parse {}: {message}", path.display())
            }
            Self::UnsupportedFormat(path) => {
                write!(f, "unsupported settings format: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid code range [{start:#x}, {end:#x}): start must be below end")]
    InvalidRange { start: usize, end: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Background worker error: {0}")]
    Worker(String),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Signal setup failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("ELF parse error in {path}: {source}")]
    Elf {
        path: String,
        #[source]
        source: object::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const SIGNAL_SETUP: i32 = 3;
    pub const ELF_ERROR: i32 = 4;
    pub const UNSUPPORTED_PLATFORM: i32 = 5;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::InvalidRange { .. } => {
                exit_code::INVALID_ARGUMENTS
            }
            Error::Signal(_) | Error::Sampler(_) => exit_code::SIGNAL_SETUP,
            Error::Elf { .. } => exit_code::ELF_ERROR,
            Error::UnsupportedPlatform(_) => exit_code::UNSUPPORTED_PLATFORM,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}

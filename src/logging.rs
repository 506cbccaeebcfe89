//! Process-wide log output, configured once by whoever owns `main`.
//!
//! Each session carries its own [`LogLevel`] for the library's events, so
//! this only decides what reaches the terminal.

use tracing_subscriber::EnvFilter;

use crate::session::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logging {
    pub level: LogLevel,
    pub ansi: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            ansi: true,
        }
    }
}

impl Logging {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Self::default()
        }
    }

    /// Filter used when `RUST_LOG` is unset.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(self.level.filter().into()))
    }

    /// Install the fmt subscriber. Returns `false` if a subscriber was
    /// already installed, which is harmless in tests.
    pub fn install(&self) -> bool {
        tracing_subscriber::fmt()
            .with_env_filter(self.filter())
            .with_ansi(self.ansi)
            .with_target(false)
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_refused() {
        let logging = Logging {
            level: LogLevel::Warn,
            ansi: false,
        };
        let _ = logging.install();
        assert!(!logging.install());
    }
}

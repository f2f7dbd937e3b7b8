// ABOUTME: Interpreter configuration: project root, library home, limits

use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const WELCOME_MESSAGE: &str = "Slug interpreter";
pub const WELCOME_SUBTITLE: &str = "an expression-oriented scripting language";

/// Environment variable pointing at the library root.
pub const HOME_VAR: &str = "SLUG_HOME";

/// Default capacity of a nursery's limiter channel.
pub const DEFAULT_NURSERY_LIMIT: usize = 16;

/// Source file extension.
pub const SOURCE_EXT: &str = "slug";

#[derive(Debug, Clone)]
pub struct Config {
    /// Project root for module resolution.
    pub root: PathBuf,
    /// Library root; modules resolve under `<home>/lib` after the root.
    pub home: Option<PathBuf>,
    /// Default nursery limit.
    pub nursery_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from("."),
            home: std::env::var_os(HOME_VAR).map(PathBuf::from),
            nursery_limit: DEFAULT_NURSERY_LIMIT,
        }
    }
}

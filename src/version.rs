// Name and version reported in the startup log line.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NAME: &str = env!("CARGO_PKG_NAME");

/// `name/version`, also used as the HTTP user agent towards the store.
pub fn user_agent() -> String {
    format!("{NAME}/{VERSION}")
}

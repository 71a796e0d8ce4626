use std::path::Path;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "logql.toml";

/// Prefix of environment variables overriding configuration values.
///
/// Nested keys are separated by `__`, e.g. `LOGQL__ENGINE__ALLOW_DOTS=true`.
pub const ENV_PREFIX: &str = "LOGQL__";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Whether label names in queries may contain `.` characters
    pub allow_dots: bool,
    /// Maximum number of series or streams a single query may return (0 = unlimited)
    pub max_series: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_dots: false,
            max_series: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Configuration {
    /// Query engine settings
    pub engine: EngineConfig,
    /// Logging settings for embedding applications
    pub logging: LoggingConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(CONFIG_FILE))
            .extract()
            .map_err(Box::new)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path.as_ref()))
            .extract()
            .map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert!(!config.engine.allow_dots);
        assert_eq!(config.engine.max_series, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_configless_operation() {
        Jail::expect_with(|_jail| {
            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config, Configuration::default());
            Ok(())
        });
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [engine]
                allow_dots = true
                "#,
            )?;

            let config = Configuration::load().map_err(|e| *e)?;
            assert!(config.engine.allow_dots);
            // Keys missing from the file keep their defaults
            assert_eq!(config.engine.max_series, 0);
            assert_eq!(config.logging.level, "info");
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [engine]
                max_series = 100
                "#,
            )?;
            jail.set_env("LOGQL__ENGINE__MAX_SERIES", "5");
            jail.set_env("LOGQL__LOGGING__LEVEL", "debug");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.engine.max_series, 5);
            assert_eq!(config.logging.level, "debug");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("LOGQL__ENGINE__MAX_SERIES", "lots");

            assert!(Configuration::load().is_err());
            Ok(())
        });
    }
}

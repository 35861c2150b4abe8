use crate::error::ConfigError;
use serde::Deserialize;

/// Sizing knobs for the multi-partition initiator.
///
/// Only the execution pools are configurable; the scheduling pass depth is a
/// compiled constant.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MpiConfig {
    /// Number of slots in the pool running multi-partition read-only
    /// transactions. One read runs per slot at a time.
    pub mp_ro_pool_size: usize,
    /// Number of slots in the pool running N-partition transactions.
    pub np_pool_size: usize,
}

impl Default for MpiConfig {
    fn default() -> Self {
        Self {
            mp_ro_pool_size: 1,
            np_pool_size: 1,
        }
    }
}

impl MpiConfig {
    pub fn parse(toml_src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("mp_ro_pool_size", self.mp_ro_pool_size),
            ("np_pool_size", self.np_pool_size),
        ] {
            if value == 0 {
                return Err(ConfigError::PoolSize { field, value });
            }
        }
        Ok(())
    }
}

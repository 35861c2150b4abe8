use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse initiator config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("`{field}` must be at least 1, got {value}")]
    PoolSize { field: &'static str, value: usize },
}

#[cfg(test)]
pub type ResultTest<T> = Result<T, anyhow::Error>;

use crate::{env::EnvManager, error::CliError};
use model::job::{algorithm::AlgorithmConfig, datasource::DataSourceConfig};
use std::collections::BTreeMap;

/// Parses `name=url` source definitions, expanding `${VAR}` references in
/// the url from the environment.
pub fn parse_sources(
    definitions: &[String],
    env: &EnvManager,
) -> Result<BTreeMap<String, DataSourceConfig>, CliError> {
    let mut sources = BTreeMap::new();
    for definition in definitions {
        let (name, url) = definition
            .split_once('=')
            .ok_or_else(|| CliError::InvalidSource(definition.clone()))?;
        let name = name.trim();
        if name.is_empty() || sources.contains_key(name) {
            return Err(CliError::InvalidSource(definition.clone()));
        }
        sources.insert(name.to_string(), parse_url(url, env)?);
    }
    Ok(sources)
}

pub fn parse_url(url: &str, env: &EnvManager) -> Result<DataSourceConfig, CliError> {
    let url = env.expand(url.trim())?;
    DataSourceConfig::from_url(&url).map_err(|_| CliError::InvalidSource(url))
}

/// `DIGEST_MATCH` plus `["chunk-size=500"]` as an algorithm config.
pub fn parse_algorithm(name: &str, props: &[String]) -> Result<AlgorithmConfig, CliError> {
    let mut config = AlgorithmConfig::new(&name.to_ascii_uppercase());
    for prop in props {
        let (key, value) = prop
            .split_once('=')
            .ok_or_else(|| CliError::InvalidProp(prop.clone()))?;
        config = config.with_prop(key.trim(), value.trim());
    }
    Ok(config)
}

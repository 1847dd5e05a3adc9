//! KDL parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use kdl::{KdlDocument, KdlNode, KdlValue};
use tracing::{trace, warn};

use crate::{AcmeConfig, Config, ConfigError, LogFormat, LoggingConfig};

/// Parse a KDL document into a [`Config`]
///
/// Fields are not validated here; see [`Config::validate`].
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = text.parse()?;

    let mut acme = None;
    let mut logging = LoggingConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "acme" => acme = Some(parse_acme(node)?),
            "logging" => logging = parse_logging(node)?,
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    let acme = acme.ok_or(ConfigError::MissingBlock("acme"))?;
    Ok(Config { acme, logging })
}

fn parse_acme(node: &KdlNode) -> Result<AcmeConfig, ConfigError> {
    trace!("Parsing acme configuration block");

    let domain = get_string_entry(node, "domain")?.ok_or(ConfigError::MissingField("domain"))?;
    let mut config = AcmeConfig::new(domain);

    if let Some(directory) = get_string_entry(node, "directory")? {
        config.directory_url = directory;
    }
    config.contact_email = get_string_entry(node, "email")?;
    if let Some(storage) = get_string_entry(node, "storage")? {
        config.storage_dir = PathBuf::from(storage);
    }
    if let Some(account_key) = get_string_entry(node, "account-key")? {
        config.account_key_file = PathBuf::from(account_key);
    }
    if let Some(address) = get_string_entry(node, "validation-address")? {
        config.validation_address = address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::invalid("validation-address", format!("'{}': {}", address, e))
        })?;
    }
    if let Some(secs) = get_u64_entry(node, "validation-timeout-secs")? {
        config.validation_timeout_secs = secs;
    }
    if let Some(days) = get_u64_entry(node, "renew-interval-days")? {
        config.renew_interval_days = days;
    }
    if let Some(days) = get_u64_entry(node, "renew-before-days")? {
        config.renew_before_days = days;
    }

    trace!(
        domain = %config.domain,
        directory = %config.directory_url,
        validation_address = %config.validation_address,
        "Parsed acme configuration"
    );

    Ok(config)
}

fn parse_logging(node: &KdlNode) -> Result<LoggingConfig, ConfigError> {
    let mut logging = LoggingConfig::default();

    if let Some(level) = get_string_entry(node, "level")? {
        logging.level = level;
    }
    if let Some(format) = get_string_entry(node, "format")? {
        logging.format = match format.to_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::invalid(
                    "format",
                    format!("'{}' is not one of: text, json", other),
                ))
            }
        };
    }

    Ok(logging)
}

// ============================================================================
// Helpers
// ============================================================================

/// First positional argument of the child node called `name`
fn child_arg<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlValue> {
    let child = node
        .children()?
        .nodes()
        .iter()
        .find(|n| n.name().value() == name)?;

    child
        .entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

fn get_string_entry(node: &KdlNode, name: &'static str) -> Result<Option<String>, ConfigError> {
    match child_arg(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_string()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| ConfigError::invalid(name, format!("expected a string, got {}", value))),
    }
}

fn get_u64_entry(node: &KdlNode, name: &'static str) -> Result<Option<u64>, ConfigError> {
    match child_arg(node, name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|v| u64::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    name,
                    format!("expected a non-negative integer, got {}", value),
                )
            }),
    }
}

//! Per-service XML config loading (`spec.md §6`, grounded on
//! `examples/original_source/dispatcher/daemon/servconfig.c`).
//!
//! Required paths: `configuration@version`,
//! `configuration.serviceInfo.{serviceName,userName,messagingIn,
//! messagingOut,maxNumMsg,maxMsgSize}`, `configuration.publishedMessage`
//! and `.subscribedMessage`, each holding `message` elements with an `id`
//! attribute. The id attribute's value is a quoted decimal token — the
//! original strips the first and last character and parses the remainder
//! (`_fnParseServMsg`: `jf_string_getU32FromString(pstrId + 1, sId - 2,
//! ...)`), which this keeps unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::DispatcherError;

pub const MAX_NUM_MSG: u32 = 100;
pub const MAX_MSG_SIZE: u32 = 128 * 1024;

/// One parsed `publishedMessage`/`subscribedMessage` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageConfig {
    pub id: u32,
    pub description: String,
}

/// One service's configuration (`spec.md §3`: "Record: name, version,
/// runtime user identity, input messaging endpoint name, output messaging
/// endpoint name, max message count per queue, max single-message size,
/// published-message set, subscribed-message set").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub version: String,
    pub name: String,
    pub user_name: String,
    pub messaging_in: String,
    pub messaging_out: String,
    pub max_num_msg: u32,
    pub max_msg_size: u32,
    pub published: Vec<MessageConfig>,
    pub subscribed: Vec<MessageConfig>,
}

impl ServiceConfig {
    /// `spec.md §6`: `max_num_msg` in `(0, 100]`, `max_msg_size` in
    /// `(0, 128 KiB]` (`_validateDispatcherServConfig`).
    fn validate(&self) -> Result<(), ConfigParseError> {
        if self.max_num_msg == 0 || self.max_num_msg > MAX_NUM_MSG {
            return Err(ConfigParseError::new(format!(
                "maxNumMsg {} out of range (0, {MAX_NUM_MSG}]",
                self.max_num_msg
            )));
        }
        if self.max_msg_size == 0 || self.max_msg_size > MAX_MSG_SIZE {
            return Err(ConfigParseError::new(format!(
                "maxMsgSize {} out of range (0, {MAX_MSG_SIZE}]",
                self.max_msg_size
            )));
        }
        Ok(())
    }

    /// Does this service publish `message_id`?
    #[must_use]
    pub fn publishes(&self, message_id: u32) -> bool {
        self.published.iter().any(|m| m.id == message_id)
    }

    /// Does this service subscribe to `message_id`?
    #[must_use]
    pub fn subscribes(&self, message_id: u32) -> bool {
        self.subscribed.iter().any(|m| m.id == message_id)
    }
}

/// A parse failure local to one file; the scan logs and skips it
/// (`spec.md §7`: "one bad file does not prevent other services from
/// starting").
#[derive(Debug)]
pub struct ConfigParseError(String);

impl ConfigParseError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl std::fmt::Display for ConfigParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigParseError {}

/// Scan `dir` for files ending in `extension` (`spec.md §6`: "File
/// extension is fixed and configurable per deployment"), parsing each.
/// A malformed file is logged and skipped; the scan itself only fails if
/// the directory cannot be read at all.
pub fn scan_dir(dir: &Path, extension: &str) -> Result<Vec<ServiceConfig>, DispatcherError> {
    tracing::info!(dir = %dir.display(), "scanning dispatcher config directory");

    let entries =
        fs::read_dir(dir).map_err(|e| DispatcherError::ConfigDirUnreadable(dir.to_path_buf(), e))?;

    let mut configs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(extension.trim_start_matches('.')) {
            continue;
        }
        match parse_file(&path) {
            Ok(config) => {
                tracing::info!(
                    service = %config.name,
                    version = %config.version,
                    msgin = %config.messaging_in,
                    msgout = %config.messaging_out,
                    max_num_msg = config.max_num_msg,
                    max_msg_size = config.max_msg_size,
                    "loaded service config"
                );
                configs.push(config);
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping malformed service config");
            }
        }
    }
    Ok(configs)
}

fn parse_file(path: &PathBuf) -> Result<ServiceConfig, ConfigParseError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigParseError::new(e.to_string()))?;
    parse_str(&text)
}

/// Parse one config document from a string (exposed for tests and for
/// callers with an in-memory document).
pub fn parse_str(xml: &str) -> Result<ServiceConfig, ConfigParseError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut version = None;
    let mut name = None;
    let mut user_name = None;
    let mut messaging_in = None;
    let mut messaging_out = None;
    let mut max_num_msg = None;
    let mut max_msg_size = None;
    let mut published = Vec::new();
    let mut subscribed = Vec::new();

    // Simple stack of enclosing tag names, enough to disambiguate
    // `message` elements under `publishedMessage` vs `subscribedMessage`,
    // matching the original's ptree-path addressing without building a
    // full tree.
    let mut stack: Vec<String> = Vec::new();
    let mut pending_message_id: Option<u32> = None;

    loop {
        match reader.read_event().map_err(|e| ConfigParseError::new(e.to_string()))? {
            Event::Start(tag) => {
                let tag_name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();

                if tag_name == "configuration" {
                    for attr in tag.attributes().flatten() {
                        if attr.key.as_ref() == b"version" {
                            version = Some(attr.unescape_value().unwrap_or_default().into_owned());
                        }
                    }
                }

                if tag_name == "message" {
                    let mut id_token = None;
                    for attr in tag.attributes().flatten() {
                        if attr.key.as_ref() == b"id" {
                            id_token = Some(attr.unescape_value().unwrap_or_default().into_owned());
                        }
                    }
                    pending_message_id = Some(parse_quoted_id(id_token.as_deref().unwrap_or(""))?);
                }

                stack.push(tag_name);
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|e| ConfigParseError::new(e.to_string()))?.into_owned();
                match stack.last().map(String::as_str) {
                    Some("serviceName") => name = Some(value),
                    Some("userName") => user_name = Some(value),
                    Some("messagingIn") => messaging_in = Some(value),
                    Some("messagingOut") => messaging_out = Some(value),
                    Some("maxNumMsg") => {
                        max_num_msg = Some(
                            value
                                .trim()
                                .parse::<u32>()
                                .map_err(|e| ConfigParseError::new(e.to_string()))?,
                        );
                    }
                    Some("maxMsgSize") => {
                        max_msg_size = Some(
                            value
                                .trim()
                                .parse::<u32>()
                                .map_err(|e| ConfigParseError::new(e.to_string()))?,
                        );
                    }
                    Some("message") => {
                        let id = pending_message_id
                            .take()
                            .ok_or_else(|| ConfigParseError::new("message element missing id attribute"))?;
                        let entry = MessageConfig {
                            id,
                            description: value,
                        };
                        if stack.iter().any(|t| t == "publishedMessage") {
                            published.push(entry);
                        } else if stack.iter().any(|t| t == "subscribedMessage") {
                            subscribed.push(entry);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let config = ServiceConfig {
        version: version.ok_or_else(|| ConfigParseError::new("missing configuration@version"))?,
        name: name.ok_or_else(|| ConfigParseError::new("missing serviceInfo.serviceName"))?,
        user_name: user_name.ok_or_else(|| ConfigParseError::new("missing serviceInfo.userName"))?,
        messaging_in: messaging_in.ok_or_else(|| ConfigParseError::new("missing serviceInfo.messagingIn"))?,
        messaging_out: messaging_out.ok_or_else(|| ConfigParseError::new("missing serviceInfo.messagingOut"))?,
        max_num_msg: max_num_msg.ok_or_else(|| ConfigParseError::new("missing serviceInfo.maxNumMsg"))?,
        max_msg_size: max_msg_size.ok_or_else(|| ConfigParseError::new("missing serviceInfo.maxMsgSize"))?,
        published,
        subscribed,
    };
    config.validate()?;
    Ok(config)
}

/// Strip the outer framing-quote characters and parse the remainder as a
/// decimal `u32` (`spec.md §6`: "the outer characters are framing quotes
/// and are stripped"). The original also requires the attribute string be
/// at least 3 characters (one quote either side plus at least one digit).
fn parse_quoted_id(token: &str) -> Result<u32, ConfigParseError> {
    if token.len() < 3 {
        return Err(ConfigParseError::new(format!(
            "message id attribute {token:?} shorter than 3 characters"
        )));
    }
    let inner = &token[1..token.len() - 1];
    inner
        .parse::<u32>()
        .map_err(|e| ConfigParseError::new(format!("invalid message id {inner:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <configuration version="1.0">
          <serviceInfo>
            <serviceName>svc-a</serviceName>
            <userName>nobody</userName>
            <messagingIn>svc-a-in</messagingIn>
            <messagingOut>svc-a-out</messagingOut>
            <maxNumMsg>10</maxNumMsg>
            <maxMsgSize>4096</maxMsgSize>
          </serviceInfo>
          <publishedMessage>
            <message id="&quot;101&quot;">event a</message>
          </publishedMessage>
          <subscribedMessage>
            <message id="&quot;202&quot;">event b</message>
          </subscribedMessage>
        </configuration>
    "#;

    #[test]
    fn parses_well_formed_config() {
        let config = parse_str(SAMPLE).unwrap();
        assert_eq!(config.name, "svc-a");
        assert_eq!(config.max_num_msg, 10);
        assert_eq!(config.max_msg_size, 4096);
        assert!(config.publishes(101));
        assert!(config.subscribes(202));
        assert!(!config.publishes(202));
    }

    #[test]
    fn rejects_max_num_msg_out_of_range() {
        let bad = SAMPLE.replace("<maxNumMsg>10</maxNumMsg>", "<maxNumMsg>0</maxNumMsg>");
        assert!(parse_str(&bad).is_err());
    }

    #[test]
    fn rejects_max_msg_size_over_limit() {
        let bad = SAMPLE.replace("<maxMsgSize>4096</maxMsgSize>", "<maxMsgSize>999999999</maxMsgSize>");
        assert!(parse_str(&bad).is_err());
    }

    #[test]
    fn strips_quote_framing_from_message_id() {
        assert_eq!(parse_quoted_id("\"101\"").unwrap(), 101);
        assert!(parse_quoted_id("1").is_err());
    }
}

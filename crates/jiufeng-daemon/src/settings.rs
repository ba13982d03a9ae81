//! `-s <file>` settings file (`spec.md §6`): a small XML document overriding
//! the compiled-in [`dispatcher::DispatcherConfig`] defaults, parsed the
//! same way `dispatcher::config` parses per-service files — a flat
//! event-loop walk rather than a serde derive, since every field here is a
//! single scalar with no repeated or nested structure.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;

use dispatcher::DispatcherConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("could not read settings file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("malformed settings file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Load `path` and apply every field it sets onto `DispatcherConfig`'s
/// defaults; fields the file omits keep their default.
pub fn load(path: &Path) -> Result<DispatcherConfig, SettingsError> {
    let text = fs::read_to_string(path).map_err(|e| SettingsError::Read(path.to_path_buf(), e))?;
    parse_str(&text).map_err(|e| SettingsError::Parse(path.to_path_buf(), e))
}

fn parse_str(xml: &str) -> Result<DispatcherConfig, String> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut config = DispatcherConfig::default();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(tag) => {
                current = Some(String::from_utf8_lossy(tag.name().as_ref()).into_owned());
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|e| e.to_string())?.into_owned();
                match current.as_deref() {
                    Some("configDir") => config.config_dir = PathBuf::from(value),
                    Some("configExtension") => config.config_extension = value,
                    Some("socketDir") => config.socket_dir = PathBuf::from(value),
                    Some("onlyService") => config.only_service = Some(value),
                    _ => {}
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_only_the_fields_it_names() {
        let xml = r#"
            <daemonSettings>
              <configDir>/srv/jiufeng/config</configDir>
              <onlyService>alpha</onlyService>
            </daemonSettings>
        "#;
        let config = parse_str(xml).unwrap();
        assert_eq!(config.config_dir, PathBuf::from("/srv/jiufeng/config"));
        assert_eq!(config.only_service, Some("alpha".to_string()));
        assert_eq!(config.config_extension, DispatcherConfig::default().config_extension);
    }
}

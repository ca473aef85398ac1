//! Config file loading
//!
//! The on-disk document is JSONC: `//` and `/* */` comments plus trailing
//! commas are tolerated, then the stripped text is handed to `serde_json`.
//! First load with persistence generates the relay/daemon tokens and writes
//! the document back with owner-only permissions.

use anyhow::{Context, Result};
use rand::RngCore;
use std::path::Path;
use tracing::info;

use super::types::{BrokerConfig, TokenSetting};

/// Parse a JSONC document into a [`BrokerConfig`].
pub fn parse_config(text: &str) -> Result<BrokerConfig> {
    let stripped = strip_jsonc(text);
    serde_json::from_str(&stripped).context("invalid broker config document")
}

/// Load config from `path`, or defaults if the file is absent.
pub fn load_config(path: &Path) -> Result<BrokerConfig> {
    if !path.exists() {
        return Ok(BrokerConfig::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&text)
}

/// Load config, generating missing secrets and persisting the result.
///
/// The config directory is created `0700` and the file written `0600` so the
/// embedded tokens stay owner-readable only.
pub fn load_or_init_config(path: &Path) -> Result<BrokerConfig> {
    let mut config = load_config(path)?;
    let mut dirty = false;

    if config.relay_token.is_unset() {
        config.relay_token = TokenSetting::Value(generate_token());
        dirty = true;
    }
    if config.daemon_token.is_unset() {
        config.daemon_token = TokenSetting::Value(generate_token());
        dirty = true;
    }

    if dirty {
        persist_config(path, &config)?;
        info!(path = %path.display(), "initialized broker config with generated tokens");
    }

    Ok(config)
}

/// Write the config document with restrictive permissions.
pub fn persist_config(path: &Path, config: &BrokerConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        set_mode(dir, 0o700)?;
    }

    let body = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, body)
        .with_context(|| format!("failed to write config to {}", path.display()))?;
    set_mode(path, 0o600)?;
    Ok(())
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode {mode:o} on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Remove comments and trailing commas, preserving string contents.
fn strip_jsonc(text: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InString,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Normal;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '/' => match chars.peek() {
                    Some('/') => {
                        chars.next();
                        state = State::LineComment;
                    }
                    Some('*') => {
                        chars.next();
                        state = State::BlockComment;
                    }
                    _ => out.push(c),
                },
                _ => out.push(c),
            },
            State::InString => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    out.push(c);
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                }
            }
        }
    }

    strip_trailing_commas(&out)
}

fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                // Look ahead past whitespace for a closing bracket.
                let mut lookahead = chars.clone();
                let mut next_significant = None;
                for n in lookahead.by_ref() {
                    if !n.is_whitespace() {
                        next_significant = Some(n);
                        break;
                    }
                }
                if matches!(next_significant, Some('}') | Some(']')) {
                    // Drop the comma; whitespace and bracket flow through below.
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_trailing_commas() {
        let doc = r#"
        {
            // line comment
            "headless": false, /* block comment */
            "flags": ["--lang=en-US",],
            "snapshot": { "maxNodes": 5, },
        }
        "#;
        let config = parse_config(doc).expect("jsonc document should parse");
        assert!(!config.headless);
        assert_eq!(config.flags, vec!["--lang=en-US".to_string()]);
        assert_eq!(config.snapshot.max_nodes, 5);
    }

    #[test]
    fn comment_markers_inside_strings_survive() {
        let doc = r#"{ "profile": "has // not a comment" }"#;
        let config = parse_config(doc).expect("string with slashes should parse");
        assert_eq!(config.profile.as_deref(), Some("has // not a comment"));
    }

    #[test]
    fn generated_tokens_are_32_byte_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

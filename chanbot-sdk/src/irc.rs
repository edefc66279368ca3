//! IRC message types.
//! This is a minimal parser/formatter for IRC protocol lines.
//!
//! Line shape: `[@tags] [:prefix] COMMAND [middle ...] [:trailing]`

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// A parsed IRC message. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags (key=value pairs).
    pub tags: HashMap<String, String>,
    /// Sender identity: `server` or `nick!user@host`.
    pub prefix: Option<String>,
    /// Protocol verb or numeric, always uppercase.
    pub command: String,
    /// Middle parameters.
    pub params: Vec<String>,
    /// Free-text payload after ` :`.
    pub trailing: Option<String>,
}

impl Message {
    /// Parse a raw IRC line, including optional message tags.
    pub fn parse(line: &str) -> Result<Self> {
        let malformed = || Error::MalformedLine(line.to_string());
        let mut rest = line.trim_end_matches(['\r', '\n']).trim_start_matches(' ');
        if rest.is_empty() {
            return Err(malformed());
        }

        // Parse tags: @key=value;key2=value2
        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_str, after) = tagged.split_once(' ').ok_or_else(malformed)?;
            rest = after.trim_start_matches(' ');
            parse_tags(tag_str)
        } else {
            HashMap::new()
        };

        // Parse prefix: :server or :nick!user@host
        let prefix = if let Some(prefixed) = rest.strip_prefix(':') {
            let (pfx, after) = prefixed.split_once(' ').ok_or_else(malformed)?;
            if pfx.is_empty() {
                return Err(malformed());
            }
            rest = after.trim_start_matches(' ');
            Some(pfx.to_string())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() || !command.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(malformed());
        }

        let mut params = Vec::new();
        let mut trailing = None;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(text) = rest.strip_prefix(':') {
                trailing = Some(text.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        })
    }

    pub fn new(command: &str, params: Vec<&str>, trailing: Option<&str>) -> Self {
        Self {
            tags: HashMap::new(),
            prefix: None,
            command: command.to_ascii_uppercase(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
            trailing: trailing.map(|s| s.to_string()),
        }
    }

    /// `PRIVMSG <target> :<text>`
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", vec![target], Some(text))
    }

    /// `NOTICE <target> :<text>`
    pub fn notice(target: &str, text: &str) -> Self {
        Self::new("NOTICE", vec![target], Some(text))
    }

    /// Nickname part of the prefix (`nick` in `nick!user@host`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .and_then(|p| p.split(['!', '@']).next())
            .filter(|n| !n.is_empty())
    }

    /// Whether the prefix carries a full `nick!user@host` hostmask.
    pub fn from_user(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| p.contains('!'))
    }

    /// Parameter by position, counting the trailing parameter last.
    pub fn arg(&self, index: usize) -> Option<&str> {
        match index.cmp(&self.params.len()) {
            std::cmp::Ordering::Less => Some(self.params[index].as_str()),
            std::cmp::Ordering::Equal => self.trailing.as_deref(),
            std::cmp::Ordering::Greater => None,
        }
    }

    /// The trailing parameter, or the last middle one when there is none.
    pub fn last_arg(&self) -> Option<&str> {
        self.trailing
            .as_deref()
            .or_else(|| self.params.last().map(|s| s.as_str()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut keys: Vec<&String> = self.tags.keys().collect();
            keys.sort();
            write!(f, "@")?;
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                let value = &self.tags[key];
                if value.is_empty() {
                    write!(f, "{key}")?;
                } else {
                    write!(f, "{key}={}", escape_tag_value(value))?;
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for param in &self.params {
            write!(f, " {param}")?;
        }
        if let Some(ref trailing) = self.trailing {
            write!(f, " :{trailing}")?;
        }
        Ok(())
    }
}

/// Channel names start with one of the RFC 2811 channel prefixes.
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            tags.insert(key.to_string(), unescape_tag_value(value));
        } else {
            tags.insert(pair.to_string(), String::new());
        }
    }
    tags
}

/// `\:` → `;`, `\s` → space, `\\` → `\`, `\r` → CR, `\n` → LF
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('r') => result.push('\r'),
                Some('n') => result.push('\n'),
                Some(other) => result.push(other),
                None => {}
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

//! Case-insensitive INI-style document reader
//!
//! Produces the raw sections of a wg-quick file in document order. Section
//! and key names are lowercased; values are trimmed and unquoted. No field
//! validation happens here.

use crate::error::ConfigError;

/// One `[Name]` block of `key = value` entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Lowercased section name
    pub name: String,
    /// Lowercased keys with their values, in document order
    entries: Vec<(String, String)>,
    /// Line number of the section header (1-indexed)
    pub line: usize,
}

impl Section {
    fn new(name: String, line: usize) -> Self {
        Self {
            name,
            entries: Vec::new(),
            line,
        }
    }

    /// Look up a key case-insensitively. A repeated key keeps its last value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// A parsed document: every section in the order it appeared
#[derive(Debug, Clone, Default)]
pub struct Document {
    sections: Vec<Section>,
}

impl Document {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        let mut sections: Vec<Section> = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            // Skip empty lines and comments
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let name = section_name(line).ok_or_else(|| ConfigError::Syntax {
                    line: line_num,
                    message: format!("Malformed section header: {}", line),
                })?;
                sections.push(Section::new(name.to_ascii_lowercase(), line_num));
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Syntax {
                    line: line_num,
                    message: format!("Missing key name: {}", line),
                });
            }

            let section = sections.last_mut().ok_or(ConfigError::Syntax {
                line: line_num,
                message: "Configuration value outside of any section".to_string(),
            })?;

            section
                .entries
                .push((key.to_ascii_lowercase(), clean_value(value)));
        }

        Ok(Self { sections })
    }

    /// All sections with the given name, case-insensitively
    pub fn sections_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Section> {
        self.sections
            .iter()
            .filter(move |s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }
}

/// Name inside `[...]`. Only a comment may follow the closing bracket.
fn section_name(line: &str) -> Option<&str> {
    let (name, rest) = line.strip_prefix('[')?.split_once(']')?;
    let rest = rest.trim_start();
    if !(rest.is_empty() || rest.starts_with('#') || rest.starts_with(';')) {
        return None;
    }

    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Strip an inline comment, surrounding whitespace and matching double quotes
fn clean_value(raw: &str) -> String {
    let value = raw.trim();

    if let Some(quoted) = value
        .strip_prefix('"')
        .and_then(|rest| rest.split_once('"'))
        .map(|(inner, _)| inner)
    {
        return quoted.to_string();
    }

    let value = match value.find(['#', ';']) {
        Some(idx) => &value[..idx],
        None => value,
    };
    value.trim_end().to_string()
}

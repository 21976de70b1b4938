use encoding_rs::Encoding;
use scrutiny_labels::{LabelSelector, SelectorSyntaxError};
use serde::Deserialize;

/// Context lines rendered above and below an incident's location when no
/// override is configured.
pub const DEFAULT_CONTEXT_LINES: usize = 10;

/// Engine-wide evaluation settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum incidents kept per violation; 0 means unlimited.
    pub incident_limit: usize,
    /// Maximum snippets rendered per file within one violation; incidents
    /// beyond the cap keep an empty snippet. 0 means unlimited.
    pub code_snip_limit: usize,
    pub context_lines: usize,
    /// Selector applied to each incident's variables, rendered as labels;
    /// non-matching incidents are dropped.
    pub incident_selector: Option<LabelSelector>,
    /// Path prefixes stripped from incident locations so reports stay
    /// relative to the analyzed project.
    pub location_prefixes: Vec<String>,
    /// Encoding label (e.g. `windows-1252`) for reading source files;
    /// UTF-8 (lossy) when unset.
    pub file_encoding: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            incident_limit: 0,
            code_snip_limit: 0,
            context_lines: DEFAULT_CONTEXT_LINES,
            incident_selector: None,
            location_prefixes: Vec::new(),
            file_encoding: None,
        }
    }
}

impl EngineSettings {
    pub(crate) fn encoding(&self) -> Option<&'static Encoding> {
        self.file_encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
    }
}

/// Deserializable mirror of [`EngineSettings`] for front-end configuration
/// files. All fields are optional; resolving compiles the incident
/// selector and surfaces syntax errors to the caller.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Options {
    pub incident_limit: Option<usize>,
    pub code_snip_limit: Option<usize>,
    pub context_lines: Option<usize>,
    pub incident_selector: Option<String>,
    pub location_prefixes: Option<Vec<String>>,
    pub file_encoding: Option<String>,
}

impl Options {
    pub fn into_settings(self) -> Result<EngineSettings, SelectorSyntaxError> {
        let defaults = EngineSettings::default();
        let incident_selector = self
            .incident_selector
            .as_deref()
            .map(LabelSelector::new)
            .transpose()?;
        Ok(EngineSettings {
            incident_limit: self.incident_limit.unwrap_or(defaults.incident_limit),
            code_snip_limit: self.code_snip_limit.unwrap_or(defaults.code_snip_limit),
            context_lines: self.context_lines.unwrap_or(defaults.context_lines),
            incident_selector,
            location_prefixes: self.location_prefixes.unwrap_or_default(),
            file_encoding: self.file_encoding,
        })
    }
}

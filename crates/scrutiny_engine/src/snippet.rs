use std::fs;
use std::path::PathBuf;

use encoding_rs::Encoding;
use url::Url;

use crate::context::IncidentContext;
use crate::settings::EngineSettings;

/// Produces the code excerpt attached to an incident. Rules may install a
/// custom snipper; incidents without one fall back to reading `file://`
/// URIs from disk.
pub trait CodeSnipper: Send + Sync {
    fn snip(&self, incident: &IncidentContext) -> anyhow::Result<String>;
}

/// Extract the snippet window around an incident's location from the file
/// it points at. Returns `None` for non-file URIs and incidents without a
/// line anchor.
pub(crate) fn extract(
    incident: &IncidentContext,
    settings: &EngineSettings,
) -> anyhow::Result<Option<String>> {
    let Some(path) = file_path(&incident.file_uri) else {
        return Ok(None);
    };
    let (anchor_start, anchor_end) = match (&incident.code_location, incident.line_number) {
        (Some(location), _) => (location.start.line, location.end.line),
        (None, Some(line)) => (line, line),
        (None, None) => return Ok(None),
    };

    let bytes = fs::read(&path)?;
    let content = decode(&bytes, settings.encoding());
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok(None);
    }

    let start = anchor_start.saturating_sub(settings.context_lines).max(1);
    let end = (anchor_end + settings.context_lines).min(lines.len());
    if start > end {
        return Ok(None);
    }
    let width = end.to_string().len();

    let snippet = (start..=end)
        .map(|number| format!("{number:>width$}  {}", lines[number - 1]))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(Some(snippet))
}

/// Resolve a `file://` URI (or a bare path) to a filesystem path. URIs with
/// other schemes belong to providers and yield no snippet here.
fn file_path(uri: &str) -> Option<PathBuf> {
    match Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Ok(_) => None,
        // Not a URI at all; treat it as a plain path.
        Err(_) => Some(PathBuf::from(uri)),
    }
}

fn decode(bytes: &[u8], encoding: Option<&'static Encoding>) -> String {
    match encoding {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn incident(uri: &str, line: usize) -> IncidentContext {
        IncidentContext {
            file_uri: uri.to_string(),
            line_number: Some(line),
            ..IncidentContext::default()
        }
    }

    fn settings(context_lines: usize) -> EngineSettings {
        EngineSettings {
            context_lines,
            ..EngineSettings::default()
        }
    }

    fn write_fixture(lines: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for number in 1..=lines {
            writeln!(file, "line number {number}").unwrap();
        }
        file
    }

    #[test]
    fn extracts_window_with_right_aligned_numbers() {
        let file = write_fixture(12);
        let uri = Url::from_file_path(file.path()).unwrap().to_string();
        let snippet = extract(&incident(&uri, 10), &settings(1)).unwrap().unwrap();
        assert_eq!(
            snippet,
            " 9  line number 9\n10  line number 10\n11  line number 11"
        );
    }

    #[test]
    fn window_is_clamped_to_the_file() {
        let file = write_fixture(3);
        let uri = Url::from_file_path(file.path()).unwrap().to_string();
        let snippet = extract(&incident(&uri, 1), &settings(5)).unwrap().unwrap();
        assert_eq!(
            snippet,
            "1  line number 1\n2  line number 2\n3  line number 3"
        );
    }

    #[test]
    fn non_file_scheme_yields_no_snippet() {
        let incident = incident("dependency://maven/org.example", 1);
        assert_eq!(extract(&incident, &settings(2)).unwrap(), None);
    }

    #[test]
    fn missing_line_anchor_yields_no_snippet() {
        let file = write_fixture(3);
        let uri = Url::from_file_path(file.path()).unwrap().to_string();
        let mut incident = incident(&uri, 1);
        incident.line_number = None;
        assert_eq!(extract(&incident, &settings(2)).unwrap(), None);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let incident = incident("file:///definitely/not/here.java", 3);
        assert!(extract(&incident, &settings(2)).is_err());
    }
}

//! Intake-side normalization helpers: description sanitization, MIME
//! normalization, and the derived file-type tag used by list filtering.

/// Strip HTML-style tags and control characters (newlines and tabs
/// survive). Used for description sanitization and the HTML extractor.
pub fn strip_tags(input: &str) -> String {
    let mut cleaned = String::with_capacity(input.len());
    let mut in_tag = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            '\n' | '\t' => cleaned.push(ch),
            c if c.is_control() => {}
            c => cleaned.push(c),
        }
    }
    cleaned
}

/// Sanitize a user-supplied description: strip HTML tags and control
/// characters, trim, and drop empty results.
pub fn sanitize_description(value: Option<String>) -> Option<String> {
    let cleaned = strip_tags(&value?);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize a MIME type for registry lookup and storage: lowercase with
/// any parameters (`; charset=...`) stripped.
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Lowercased extension of a file name, if it has one.
pub fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Derive the filterable file-type tag from the MIME type, falling back to
/// the file extension. The tag set is what the list filter matches on.
pub fn file_type_for(mime: &str, file_name: &str) -> &'static str {
    let mime = normalize_mime(mime);
    match mime.as_str() {
        "application/pdf" => return "pdf",
        "application/msword"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            return "word";
        }
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => return "excel",
        "application/vnd.ms-powerpoint"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            return "powerpoint";
        }
        "text/markdown" => return "markdown",
        "application/json" | "text/csv" | "application/xml" | "text/xml" => return "data",
        _ => {}
    }
    if mime.starts_with("image/") {
        return "image";
    }
    if mime.starts_with("text/") {
        return "text";
    }
    match file_extension(file_name).as_deref() {
        Some("pdf") => "pdf",
        Some("doc") | Some("docx") => "word",
        Some("xls") | Some("xlsx") => "excel",
        Some("ppt") | Some("pptx") => "powerpoint",
        Some("md") | Some("markdown") => "markdown",
        Some("json") | Some("csv") | Some("xml") => "data",
        Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("svg") => "image",
        Some("txt") | Some("log") | Some("rst") => "text",
        _ => "other",
    }
}

/// Best-effort MIME type from a file extension, for callers (the CLI) that
/// only have a path.
pub fn mime_for_extension(file_name: &str) -> Option<&'static str> {
    match file_extension(file_name).as_deref()? {
        "txt" | "log" | "rst" => Some("text/plain"),
        "md" | "markdown" => Some("text/markdown"),
        "csv" => Some("text/csv"),
        "html" | "htm" => Some("text/html"),
        "json" => Some("application/json"),
        "xml" => Some("application/xml"),
        "pdf" => Some("application/pdf"),
        "docx" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        "pptx" => {
            Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
        }
        "xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_tags_and_controls() {
        assert_eq!(
            sanitize_description(Some("<b>Quarterly</b> report\u{0007} draft".into())),
            Some("Quarterly report draft".into())
        );
        assert_eq!(
            sanitize_description(Some("<script>alert('x')</script>Summary".into())),
            Some("alert('x')Summary".into())
        );
        assert_eq!(
            sanitize_description(Some("  line one\nline two  ".into())),
            Some("line one\nline two".into())
        );
    }

    #[test]
    fn sanitize_drops_blank_results() {
        assert_eq!(sanitize_description(None), None);
        assert_eq!(sanitize_description(Some("   ".into())), None);
        assert_eq!(sanitize_description(Some("<br><hr>".into())), None);
    }

    #[test]
    fn normalize_mime_strips_parameters() {
        assert_eq!(normalize_mime("Text/Plain; charset=UTF-8"), "text/plain");
        assert_eq!(normalize_mime("application/pdf"), "application/pdf");
    }

    #[test]
    fn file_type_prefers_mime_then_extension() {
        assert_eq!(file_type_for("application/pdf", "report.bin"), "pdf");
        assert_eq!(
            file_type_for(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "report"
            ),
            "word"
        );
        assert_eq!(file_type_for("text/plain; charset=utf-8", "notes.txt"), "text");
        assert_eq!(file_type_for("application/octet-stream", "deck.pptx"), "powerpoint");
        assert_eq!(file_type_for("application/octet-stream", "mystery"), "other");
        assert_eq!(file_type_for("image/png", "chart"), "image");
    }

    #[test]
    fn extension_parsing_handles_dotfiles_and_multi_dots() {
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(file_extension("README"), None);
        assert_eq!(file_extension(".env"), None);
        assert_eq!(mime_for_extension("notes.TXT"), Some("text/plain"));
        assert_eq!(mime_for_extension("binary.exe"), None);
    }
}

use std::path::Path;

/// Longest file name kept, in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Sanitizes a client or bucket supplied name into a single safe file name.
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    // Normalize Windows separators so file_name() strips client-side paths too
    let normalized = filename.replace('\\', "/");
    let name = Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        tracing::debug!("Stripped path components from file name: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = sanitized.trim();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > MAX_FILENAME_LEN {
        let mut end = MAX_FILENAME_LEN;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        &sanitized[..end]
    } else {
        sanitized
    };

    if sanitized.is_empty() || sanitized.starts_with('.') {
        return None;
    }

    Some(sanitized.to_string())
}

/// Lowercased extension of a file name, if any
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
}

/// True when the leading bytes are recognised as a PDF document
pub fn looks_like_pdf(header: &[u8]) -> bool {
    infer::get(header).is_some_and(|kind| kind.mime_type() == mime::APPLICATION_PDF.essence_str())
}

/// True when a declared multipart content type is `application/pdf`
/// (parameters such as `; charset=binary` are ignored)
pub fn is_pdf_content_type(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .is_some_and(|m| {
            m.essence_str()
                .eq_ignore_ascii_case(mime::APPLICATION_PDF.essence_str())
        })
}

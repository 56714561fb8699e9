//! File name validation and server-side name generation

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::UploadError;

/// Longest stem kept in a generated server name
const MAX_STEM_CHARS: usize = 50;

/// Validate a client-supplied file name
///
/// Names must be a single path component: no separators, no `..`, no NUL.
/// Control characters are dropped from the returned name.
pub fn validate_file_name(name: &str) -> Result<String, UploadError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(UploadError::InvalidRequest("file name must not be empty".to_string()));
    }
    if trimmed.contains(['/', '\\', '\0']) || trimmed.contains("..") {
        return Err(UploadError::InvalidRequest(format!(
            "file name must not contain path components: {}",
            name
        )));
    }
    Ok(trimmed.chars().filter(|c| !c.is_control()).collect())
}

/// Generate the unique name under which an artifact is committed
///
/// Format: `<stem>_<yyyyMMdd-HHmmss>_<6 hex><.ext>`. The stem and extension
/// are re-sanitized here so nothing from the client reaches the file system
/// verbatim, and the result never starts with a dot.
pub fn server_file_name(original: &str, now: DateTime<Utc>) -> String {
    let (stem, ext) = match original.rfind('.') {
        Some(pos) => (&original[..pos], Some(&original[pos + 1..])),
        None => (original, None),
    };

    // A leading dot would make the artifact a hidden file
    let mut safe_stem: String = stem
        .chars()
        .map(sanitize_char)
        .skip_while(|c| *c == '.')
        .take(MAX_STEM_CHARS)
        .collect();
    if safe_stem.is_empty() {
        safe_stem.push_str("file");
    }

    let suffix = Uuid::new_v4().simple().to_string();
    let mut name = format!(
        "{}_{}_{}",
        safe_stem,
        now.format("%Y%m%d-%H%M%S"),
        &suffix[..6]
    );

    if let Some(ext) = ext {
        let safe_ext: String = ext
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        if !safe_ext.is_empty() {
            name.push('.');
            name.push_str(&safe_ext);
        }
    }

    name
}

fn sanitize_char(c: char) -> char {
    if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') || is_cjk_ideograph(c) {
        c
    } else {
        '_'
    }
}

fn is_cjk_ideograph(c: char) -> bool {
    ('\u{4e00}'..='\u{9fa5}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_rejects_traversal_and_separators() {
        for bad in ["", "   ", "../../etc/passwd", "a/b.pdf", "a\\b.pdf", "..", "x..y"] {
            assert!(
                matches!(validate_file_name(bad), Err(UploadError::InvalidRequest(_))),
                "accepted {:?}",
                bad
            );
        }
        assert_eq!(validate_file_name(" contract.pdf ").unwrap(), "contract.pdf");
    }

    #[test]
    fn test_server_name_shape() {
        let name = server_file_name("contract.pdf", fixed_time());
        assert!(name.starts_with("contract_20240309-140507_"));
        assert!(name.ends_with(".pdf"));
        assert_eq!(name.len(), "contract_20240309-140507_".len() + 6 + ".pdf".len());
    }

    #[test]
    fn test_server_name_sanitizes_and_truncates() {
        let long = format!("{} report$.docx", "a".repeat(80));
        let name = server_file_name(&long, fixed_time());
        let stem = name.split('_').next().unwrap();
        assert_eq!(stem.len(), MAX_STEM_CHARS);

        let name = server_file_name("合同 v2.pdf", fixed_time());
        assert!(name.starts_with("合同_v2_"));
    }

    #[test]
    fn test_server_names_are_unique() {
        let a = server_file_name("x.pdf", fixed_time());
        let b = server_file_name("x.pdf", fixed_time());
        assert_ne!(a, b);
    }

    #[test]
    fn test_name_without_extension() {
        let name = server_file_name("README", fixed_time());
        assert!(name.starts_with("README_20240309-140507_"));
        assert!(!name.contains('.'));
    }

    #[test]
    fn test_dot_leading_names_are_not_hidden() {
        let name = server_file_name(".gitignore", fixed_time());
        assert!(name.starts_with("file_20240309-140507_"), "{}", name);
        assert!(name.ends_with(".gitignore"));

        for original in [".", ".x.pdf", "._.env", ".合同"] {
            let name = server_file_name(original, fixed_time());
            assert!(!name.starts_with('.'), "{:?} -> {}", original, name);
        }
    }
}

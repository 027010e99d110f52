//! Response headers describing a shared file.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Bytes escaped in `filename*`: everything except alphanumerics and `-._~`.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Content type for a share's lower-case file extension.
pub fn content_type(file_type: &str) -> String {
    mime_guess::from_ext(file_type)
        .first_or_octet_stream()
        .to_string()
}

/// `Content-Disposition` value prompting a download under `name`.
///
/// The quoted `filename` is an ASCII fallback; non-ASCII names are also sent
/// percent-encoded in `filename*`.
pub fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if name.is_ascii() && fallback == name {
        format!("attachment; filename=\"{}\"", fallback)
    } else {
        format!(
            "attachment; filename=\"{}\"; filename*=UTF-8''{}",
            fallback,
            percent_encode(name)
        )
    }
}

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, FILENAME_ENCODE_SET).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_known() {
        assert_eq!(content_type("pdf"), "application/pdf");
        assert_eq!(content_type("png"), "image/png");
        assert_eq!(content_type("txt"), "text/plain");
    }

    #[test]
    fn test_content_type_unknown() {
        assert_eq!(content_type(""), "application/octet-stream");
        assert_eq!(content_type("xyz123"), "application/octet-stream");
    }

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\""
        );
    }

    #[test]
    fn test_content_disposition_escapes_quotes() {
        assert_eq!(
            content_disposition("a\"b.txt"),
            "attachment; filename=\"a_b.txt\"; filename*=UTF-8''a%22b.txt"
        );
    }

    #[test]
    fn test_content_disposition_keeps_unreserved() {
        assert_eq!(
            content_disposition("weekly notes_v2~final-€.txt"),
            "attachment; filename=\"weekly notes_v2~final-_.txt\"; filename*=UTF-8''weekly%20notes_v2~final-%E2%82%AC.txt"
        );
    }

    #[test]
    fn test_content_disposition_non_ascii() {
        assert_eq!(
            content_disposition("résumé.pdf"),
            "attachment; filename=\"r_sum_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
        );
    }
}

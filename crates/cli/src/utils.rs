/// Hide the password in a connection URL before printing it
pub fn mask_url(database_url: &str) -> String {
    url::Url::parse(database_url)
        .map(|mut url| {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        })
        .unwrap_or_else(|_| "postgresql://***".to_string())
}

/// First `len` chars of a checksum for table output
pub fn short_checksum(checksum: &str, len: usize) -> &str {
    checksum.get(..len).unwrap_or(checksum)
}

pub fn indent(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn join_versions<T: std::fmt::Display>(versions: &[T]) -> String {
    if versions.is_empty() {
        "-".to_string()
    } else {
        versions
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("postgresql://app:secret@db:5432/app"),
            "postgresql://app:***@db:5432/app"
        );
        assert_eq!(mask_url("postgresql://db/app"), "postgresql://db/app");
        assert_eq!(mask_url("not a url"), "postgresql://***");
    }

    #[test]
    fn test_short_checksum() {
        assert_eq!(short_checksum("0123456789abcdef0123", 16), "0123456789abcdef");
        assert_eq!(short_checksum("abc", 16), "abc");
    }

    #[test]
    fn test_join_versions() {
        assert_eq!(join_versions::<i64>(&[]), "-");
        assert_eq!(join_versions(&[1, 2]), "1, 2");
    }
}

use std::fmt;

/// The request methods the hosting layer distinguishes. Everything else
/// (PURGE, DELETE, TRACE...) is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Options,
    #[default]
    Unknown,
}

impl Method {
    /// Case-insensitive.
    pub fn parse(s: &str) -> Self {
        const KNOWN: [(&str, Method); 6] = [
            ("GET", Method::Get),
            ("HEAD", Method::Head),
            ("POST", Method::Post),
            ("PUT", Method::Put),
            ("PATCH", Method::Patch),
            ("OPTIONS", Method::Options),
        ];
        KNOWN
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, method)| *method)
            .unwrap_or(Method::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Method;

    #[test]
    fn methods_match_case_insensitively() {
        assert_eq!(Method::parse("GET"), Method::Get);
        assert_eq!(Method::parse("get"), Method::Get);
        assert_eq!(Method::parse("hEaD"), Method::Head);
        assert_eq!(Method::parse("Options"), Method::Options);
        assert_eq!(Method::parse("PURGE"), Method::Unknown);
        assert_eq!(Method::parse(""), Method::Unknown);
    }
}

use serde::Deserialize;

/// Error body returned by the core API
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    pub status: Option<u16>,
    pub title: Option<String>,
    pub detail: Option<String>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

impl ErrorResponse {
    /// Machine-readable code, e.g. `morio.core.reloading.prohibited`
    pub fn code(&self) -> Option<&str> {
        self.error_type
            .as_deref()
            .map(|t| t.rsplit('/').next().unwrap_or(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_from_type_link() {
        let err: ErrorResponse = serde_json::from_str(
            r#"{"status":409,"title":"Not available while reloading","detail":"x","type":"https://morio.it/docs/reference/errors/morio.core.reloading.prohibited"}"#,
        )
        .unwrap();
        assert_eq!(err.code(), Some("morio.core.reloading.prohibited"));
    }
}

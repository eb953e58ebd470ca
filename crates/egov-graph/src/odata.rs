//! `OData` envelopes and query helpers.

use serde::Deserialize;

/// `OData` error response from Microsoft Graph.
#[derive(Debug, Deserialize)]
pub struct ODataError {
    pub error: ODataErrorBody,
}

/// `OData` error body.
#[derive(Debug, Deserialize)]
pub struct ODataErrorBody {
    pub code: String,
    pub message: String,
    #[serde(rename = "innerError")]
    pub inner_error: Option<serde_json::Value>,
}

/// Response wrapper for collection responses.
#[derive(Debug, Deserialize)]
pub struct ODataResponse<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Quotes a string literal for use inside a `$filter` expression.
///
/// Single quotes are doubled as required by the `OData` ABNF.
#[must_use]
pub fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Builds an `eq` comparison against a string literal.
#[must_use]
pub fn eq(property: &str, value: &str) -> String {
    format!("{property} eq {}", literal(value))
}

/// Appends percent-encoded query options to a relative path.
#[must_use]
pub fn with_query(path: &str, options: &[(&str, &str)]) -> String {
    if options.is_empty() {
        return path.to_string();
    }
    let query = options
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if path.contains('?') { '&' } else { '?' };
    format!("{path}{separator}{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odata_error_parsing() {
        let json = r#"{
            "error": {
                "code": "Request_ResourceNotFound",
                "message": "Resource not found",
                "innerError": {"date": "2024-01-15"}
            }
        }"#;

        let error: ODataError = serde_json::from_str(json).unwrap();
        assert_eq!(error.error.code, "Request_ResourceNotFound");
        assert_eq!(error.error.message, "Resource not found");
        assert!(error.error.inner_error.is_some());
    }

    #[test]
    fn test_odata_response_parsing() {
        let json = r#"{
            "value": [{"id": "1"}, {"id": "2"}],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/groups?$skiptoken=xxx"
        }"#;

        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct TestItem {
            id: String,
        }

        let response: ODataResponse<TestItem> = serde_json::from_str(json).unwrap();
        assert_eq!(response.value.len(), 2);
        assert!(response.next_link.is_some());
    }

    #[test]
    fn test_literal_escapes_quotes() {
        assert_eq!(literal("Finance"), "'Finance'");
        assert_eq!(literal("O'Brien's team"), "'O''Brien''s team'");
        assert_eq!(eq("displayName", "a'b"), "displayName eq 'a''b'");
    }

    #[test]
    fn test_with_query_encodes_values() {
        let url = with_query("groups", &[("$filter", "uniqueName eq 'x y'")]);
        assert_eq!(url, "groups?$filter=uniqueName%20eq%20%27x%20y%27");

        let url = with_query("groups?$select=id", &[("$top", "5")]);
        assert_eq!(url, "groups?$select=id&$top=5");

        assert_eq!(with_query("groups", &[]), "groups");
    }
}

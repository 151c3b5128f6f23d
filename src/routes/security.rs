use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
};
use serde::Deserialize;

/// Browser CSP violation report, wrapped in the `csp-report` envelope.
#[derive(Debug, Deserialize)]
pub struct CspReportEnvelope {
    #[serde(rename = "csp-report")]
    pub csp_report: CspReport,
}

#[derive(Debug, Default, Deserialize)]
pub struct CspReport {
    #[serde(rename = "document-uri", default)]
    pub document_uri: String,
    #[serde(rename = "violated-directive", default)]
    pub violated_directive: String,
    #[serde(rename = "blocked-uri", default)]
    pub blocked_uri: String,
    #[serde(rename = "original-policy", default)]
    pub original_policy: String,
}

/// Directives whose violation indicates script injection rather than a
/// missing asset whitelist entry.
const HIGH_RISK_DIRECTIVES: [&str; 4] = ["script-src", "object-src", "base-uri", "form-action"];

pub fn is_high_risk(violated_directive: &str) -> bool {
    HIGH_RISK_DIRECTIVES
        .iter()
        .any(|d| violated_directive.starts_with(d))
}

/// CSP violation sink. Always answers 204; malformed reports are logged
/// and dropped; a browser retrying a broken report helps nobody.
pub async fn csp_report(headers: HeaderMap, body: Bytes) -> StatusCode {
    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("unknown")
        .trim()
        .to_string();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    match serde_json::from_slice::<CspReportEnvelope>(&body) {
        Ok(envelope) => {
            let report = envelope.csp_report;
            if is_high_risk(&report.violated_directive) {
                tracing::error!(
                    client_ip = %client_ip,
                    user_agent = %user_agent,
                    violated_directive = %report.violated_directive,
                    blocked_uri = %report.blocked_uri,
                    document_uri = %report.document_uri,
                    "high-risk CSP violation"
                );
            } else {
                tracing::warn!(
                    client_ip = %client_ip,
                    user_agent = %user_agent,
                    violated_directive = %report.violated_directive,
                    blocked_uri = %report.blocked_uri,
                    "CSP violation"
                );
            }
        }
        Err(err) => {
            tracing::debug!(client_ip = %client_ip, error = %err, "unparseable CSP report");
        }
    }

    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_src_variants_are_high_risk() {
        assert!(is_high_risk("script-src"));
        assert!(is_high_risk("script-src-elem"));
        assert!(is_high_risk("object-src"));
        assert!(is_high_risk("base-uri"));
        assert!(is_high_risk("form-action"));
    }

    #[test]
    fn asset_directives_are_not_high_risk() {
        assert!(!is_high_risk("img-src"));
        assert!(!is_high_risk("font-src"));
        assert!(!is_high_risk("style-src"));
    }

    #[tokio::test]
    async fn report_endpoint_always_answers_204() {
        let report = serde_json::json!({
            "csp-report": {
                "document-uri": "https://letters.example.com/",
                "violated-directive": "script-src",
                "blocked-uri": "https://evil.example.com/x.js",
            }
        });
        let status = csp_report(
            HeaderMap::new(),
            Bytes::from(serde_json::to_vec(&report).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let status = csp_report(HeaderMap::new(), Bytes::from_static(b"not json")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

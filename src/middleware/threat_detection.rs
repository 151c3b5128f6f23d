use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

/// Signature families the scanner recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    PathTraversal,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "sqli",
            ThreatKind::Xss => "xss",
            ThreatKind::PathTraversal => "traversal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThreatFinding {
    pub kind: ThreatKind,
    pub token: &'static str,
}

/// Findings for the current request, visible to every later stage.
#[derive(Debug, Clone, Default)]
pub struct ThreatFindings(pub Vec<ThreatFinding>);

/// Whether a signature match blocks the request or only annotates it.
///
/// Enforcement belongs to the WAF and to explicit input validation; the
/// default here is observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreatPolicy {
    #[default]
    Observe,
    Block,
}

const SQL_TOKENS: &[&str] = &[
    "union select",
    "select ",
    "insert into",
    "drop table",
    "delete from",
    "--",
    "/*",
    "' or",
    "\" or",
    "';",
    "exec(",
    "char(",
];

const XSS_TOKENS: &[&str] = &[
    "<script",
    "javascript:",
    "vbscript:",
    "onerror=",
    "onload=",
    "onclick=",
    "<iframe",
    "<svg",
    "expression(",
];

const TRAVERSAL_TOKENS: &[&str] = &[
    "../",
    "..\\",
    "..%2f",
    "..%5c",
    "%2e%2e%2f",
    "%2e%2e%5c",
    "%2e%2e/",
];

/// Scan the URL path and raw query, case-folded. At most one finding per
/// family, carrying the first token that matched.
pub fn scan(path: &str, raw_query: &str) -> Vec<ThreatFinding> {
    let haystack = format!("{}?{}", path, raw_query).to_lowercase();
    let families = [
        (ThreatKind::SqlInjection, SQL_TOKENS),
        (ThreatKind::Xss, XSS_TOKENS),
        (ThreatKind::PathTraversal, TRAVERSAL_TOKENS),
    ];

    let mut findings = Vec::new();
    for (kind, tokens) in families {
        if let Some(token) = tokens.iter().find(|t| haystack.contains(*t)) {
            findings.push(ThreatFinding { kind, token });
        }
    }
    findings
}

/// Non-blocking attack-signature scanner.
///
/// Matches annotate the request context, emit `X-Threat-Detected` response
/// headers and a structured log entry; the request itself proceeds unless
/// the policy is `Block`.
pub async fn threat_detection_middleware(
    policy: ThreatPolicy,
    mut request: Request,
    next: Next,
) -> Response {
    let findings = scan(
        request.uri().path(),
        request.uri().query().unwrap_or_default(),
    );

    if findings.is_empty() {
        return next.run(request).await;
    }

    for finding in &findings {
        tracing::warn!(
            kind = finding.kind.as_str(),
            token = finding.token,
            path = %request.uri().path(),
            "threat signature matched"
        );
    }

    if policy == ThreatPolicy::Block {
        return ApiError::RequestBlocked(findings[0].kind.as_str().to_string()).into_response();
    }

    request
        .extensions_mut()
        .insert(ThreatFindings(findings.clone()));

    let mut response = next.run(request).await;
    for finding in &findings {
        response.headers_mut().append(
            "x-threat-detected",
            HeaderValue::from_static(finding.kind.as_str()),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sql_tokens_in_query() {
        let findings = scan("/api/letters", "q=1%20UNION%20SELECT%20password");
        assert!(findings.is_empty(), "encoded spaces keep tokens apart");

        let findings = scan("/api/letters", "q=1' OR '1'='1");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, ThreatKind::SqlInjection);
    }

    #[test]
    fn detects_xss_case_insensitively() {
        let findings = scan("/api/letters", "title=<SCRIPT>alert(1)</script>");
        assert!(findings.iter().any(|f| f.kind == ThreatKind::Xss));
    }

    #[test]
    fn detects_encoded_traversal() {
        for query in ["file=../../etc/passwd", "file=%2e%2e%2fetc", "file=..%2fetc"] {
            let findings = scan("/api/files", query);
            assert!(
                findings.iter().any(|f| f.kind == ThreatKind::PathTraversal),
                "missed {query}"
            );
        }
    }

    #[test]
    fn one_finding_per_family() {
        let findings = scan("/api/x", "a=../b&c=..%2fd&e=%2e%2e%2ff");
        assert_eq!(
            findings
                .iter()
                .filter(|f| f.kind == ThreatKind::PathTraversal)
                .count(),
            1
        );
    }

    #[test]
    fn clean_requests_produce_no_findings() {
        assert!(scan("/api/letters/123", "page=2&limit=20").is_empty());
    }
}

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;

use crate::config::SecurityConfig;
use crate::AppState;

/// Raw nonce length: 24 random bytes → 32 base64 chars (≥192 bits entropy).
const NONCE_BYTES: usize = 24;

/// Per-request CSP nonce, stored in request extensions for template
/// rendering by handlers and echoed on `X-CSP-Nonce`.
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

pub fn generate_nonce() -> String {
    let mut buf = [0u8; NONCE_BYTES];
    rand::rng().fill_bytes(&mut buf);
    BASE64.encode(buf)
}

/// Middleware that stamps the full security-header suite on every response.
///
/// The nonce is generated before the handler runs (so templates can embed
/// it) and the headers are applied after, so the CSP and the nonce echo
/// always describe the same value.
pub async fn security_headers_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let nonce = generate_nonce();
    request.extensions_mut().insert(CspNonce(nonce.clone()));

    let mut response = next.run(request).await;
    apply_security_headers(
        response.headers_mut(),
        &state.settings.security,
        &nonce,
        &path,
    );
    response
}

fn apply_security_headers(
    headers: &mut HeaderMap,
    config: &SecurityConfig,
    nonce: &str,
    path: &str,
) {
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "x-permitted-cross-domain-policies",
        HeaderValue::from_static("none"),
    );
    headers.insert(
        "cross-origin-opener-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "cross-origin-embedder-policy",
        HeaderValue::from_static("require-corp"),
    );
    headers.insert(
        "cross-origin-resource-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static(
            "geolocation=(), microphone=(), camera=(), usb=(), payment=(), \
             magnetometer=(), gyroscope=(), accelerometer=(), bluetooth=()",
        ),
    );

    if let Ok(value) = HeaderValue::from_str(nonce) {
        headers.insert("x-csp-nonce", value);
    }

    let csp = build_csp(config, nonce);
    if let Ok(value) = HeaderValue::from_str(&csp) {
        headers.insert(header::CONTENT_SECURITY_POLICY, value);
    }
    // Report-only shadow policy lets developers watch violations without
    // the relaxed dev policy masking them.
    if config.is_development && config.enable_csp_reporting {
        if let Ok(value) = HeaderValue::from_str(&csp) {
            headers.insert(header::CONTENT_SECURITY_POLICY_REPORT_ONLY, value);
        }
    }

    if !config.is_development && config.enable_hsts {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        );
    }

    if config
        .sensitive_paths
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate, private"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }
}

/// Assemble the Content-Security-Policy for one request.
///
/// The policy is built exactly once per request; `frame-ancestors` lives
/// here and nowhere else.
pub fn build_csp(config: &SecurityConfig, nonce: &str) -> String {
    let cdns = config.trusted_cdns.join(" ");

    let mut directives: Vec<String> = vec![
        "default-src 'self'".into(),
        "base-uri 'self'".into(),
        "form-action 'self'".into(),
        "frame-ancestors 'none'".into(),
        "object-src 'none'".into(),
        "media-src 'self'".into(),
        "font-src 'self' https: data:".into(),
    ];

    if config.is_development {
        directives.push(trimmed(format!(
            "script-src 'self' 'unsafe-inline' 'unsafe-eval' {}",
            cdns
        )));
        directives.push(trimmed(format!(
            "style-src 'self' 'unsafe-inline' 'unsafe-eval' {}",
            cdns
        )));
        directives.push("connect-src 'self' ws://localhost:* http://localhost:*".into());
    } else {
        directives.push(trimmed(format!(
            "script-src 'self' 'nonce-{}' {}",
            nonce, cdns
        )));
        directives.push(trimmed(format!(
            "style-src 'self' 'nonce-{}' {}",
            nonce, cdns
        )));
        directives.push(trimmed(format!(
            "connect-src 'self' {}",
            config.websocket_url
        )));
        directives.push("upgrade-insecure-requests".into());
        directives.push("block-all-mixed-content".into());
        directives.push("require-trusted-types-for 'script'".into());
    }

    if config.enable_csp_reporting {
        directives.push(format!("report-uri {}", config.csp_report_uri));
        directives.push("report-to csp-endpoint".into());
    }

    directives.join("; ")
}

fn trimmed(directive: String) -> String {
    directive.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(is_development: bool) -> SecurityConfig {
        SecurityConfig {
            is_development,
            frontend_url: "https://letters.example.com".into(),
            websocket_url: "wss://api.letters.example.com".into(),
            trusted_cdns: vec!["https://cdn.jsdelivr.net".into()],
            enable_hsts: true,
            enable_csp_reporting: false,
            csp_report_uri: "/api/security/csp-report".into(),
            sensitive_paths: vec!["/api/auth/".into()],
        }
    }

    #[test]
    fn nonce_is_base64_of_24_bytes() {
        let nonce = generate_nonce();
        assert_eq!(BASE64.decode(&nonce).unwrap().len(), NONCE_BYTES);
    }

    #[test]
    fn nonces_do_not_repeat() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_nonce()));
        }
    }

    #[test]
    fn production_csp_uses_nonce_sources() {
        let csp = build_csp(&config(false), "abc123");
        assert!(csp.contains("script-src 'self' 'nonce-abc123' https://cdn.jsdelivr.net"));
        assert!(csp.contains("style-src 'self' 'nonce-abc123'"));
        assert!(csp.contains("upgrade-insecure-requests"));
        assert!(csp.contains("block-all-mixed-content"));
        assert!(csp.contains("require-trusted-types-for 'script'"));
        assert!(csp.contains("connect-src 'self' wss://api.letters.example.com"));
        assert!(!csp.contains("unsafe-inline"));
    }

    #[test]
    fn development_csp_relaxes_script_sources() {
        let csp = build_csp(&config(true), "abc123");
        assert!(csp.contains("'unsafe-inline'"));
        assert!(csp.contains("'unsafe-eval'"));
        assert!(csp.contains("connect-src 'self' ws://localhost:*"));
        assert!(!csp.contains("nonce-"));
        assert!(!csp.contains("upgrade-insecure-requests"));
    }

    #[test]
    fn reporting_appends_report_directives() {
        let mut cfg = config(false);
        cfg.enable_csp_reporting = true;
        let csp = build_csp(&cfg, "n");
        assert!(csp.ends_with("report-uri /api/security/csp-report; report-to csp-endpoint"));
    }

    #[test]
    fn csp_skeleton_is_always_present() {
        for dev in [true, false] {
            let csp = build_csp(&config(dev), "n");
            for directive in [
                "default-src 'self'",
                "base-uri 'self'",
                "form-action 'self'",
                "frame-ancestors 'none'",
                "object-src 'none'",
                "media-src 'self'",
                "font-src 'self' https: data:",
            ] {
                assert!(csp.contains(directive), "missing {directive} (dev={dev})");
            }
        }
    }

    #[test]
    fn sensitive_paths_get_cache_busting() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers, &config(false), "n", "/api/auth/login");
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "no-store, no-cache, must-revalidate, private"
        );
        assert_eq!(headers.get(header::PRAGMA).unwrap(), "no-cache");
        assert_eq!(headers.get(header::EXPIRES).unwrap(), "0");

        let mut plain = HeaderMap::new();
        apply_security_headers(&mut plain, &config(false), "n", "/api/letters");
        assert!(plain.get(header::CACHE_CONTROL).is_none());
    }

    #[test]
    fn hsts_only_in_production() {
        let mut prod = HeaderMap::new();
        apply_security_headers(&mut prod, &config(false), "n", "/");
        assert_eq!(
            prod.get(header::STRICT_TRANSPORT_SECURITY).unwrap(),
            "max-age=63072000; includeSubDomains; preload"
        );

        let mut dev = HeaderMap::new();
        apply_security_headers(&mut dev, &config(true), "n", "/");
        assert!(dev.get(header::STRICT_TRANSPORT_SECURITY).is_none());
    }
}

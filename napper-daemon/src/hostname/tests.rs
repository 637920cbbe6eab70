use super::*;

#[test]
fn test_accepts_plain_fqdn() {
    assert!(is_valid_hostname("app.example.com"));
    assert!(is_valid_hostname("a.io"));
    assert!(is_valid_hostname("sub.domain.example.co.uk"));
}

#[test]
fn test_rejects_empty_and_dotless() {
    assert!(!is_valid_hostname(""));
    assert!(!is_valid_hostname("myapp"));
}

#[test]
fn test_rejects_length_bounds() {
    assert!(!is_valid_hostname("a.b"));
    let long = format!("{}.com", "a".repeat(100));
    assert!(!is_valid_hostname(&long));
    // 99 chars exactly is still fine
    let edge = format!("{}.com", "a".repeat(95));
    assert_eq!(edge.len(), 99);
    assert!(is_valid_hostname(&edge));
}

#[test]
fn test_rejects_localhost_ports_and_ipv4() {
    assert!(!is_valid_hostname("localhost"));
    assert!(!is_valid_hostname("app.example.com:8080"));
    assert!(!is_valid_hostname("192.168.1.10"));
    assert!(!is_valid_hostname("10.0.0.1.sslip.io"));
}

#[test]
fn test_self_host_by_config() {
    assert!(is_self_host("panel.example.com", Some("panel.example.com")));
    assert!(is_self_host("Panel.Example.Com", Some("panel.example.com")));
    assert!(!is_self_host("panel.example.com", Some("other.example.com")));
    assert!(!is_self_host("panel.example.com", None));
}

#[test]
fn test_self_host_by_marker() {
    assert!(is_self_host("kamal-napper.example.com", None));
    assert!(is_self_host("naptime.example.com", None));
    assert!(is_self_host("NAPTIME.example.com", None));
}

#[test]
fn test_managed_hostname_combines_both() {
    assert!(is_managed_hostname("app.example.com", None));
    assert!(!is_managed_hostname("kamal-napper.example.com", None));
    assert!(!is_managed_hostname("myapp", None));
}

#[test]
fn test_service_for_host() {
    assert_eq!(service_for_host("app.example.com"), "app");
    assert_eq!(service_for_host("deep.sub.example.com"), "deep");
}

#[test]
fn test_sanitize_keeps_hostname_chars() {
    assert_eq!(sanitize("app.example.com"), "app.example.com");
    assert_eq!(sanitize("my-app.io"), "my-app.io");
    assert_eq!(sanitize("weird/host:name"), "weird_host_name");
}

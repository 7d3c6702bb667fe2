//! Header helpers shared by the server's gateway and the agent's forwarder.

use crate::Headers;

/// Headers that only describe a single connection hop and are never relayed.
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Content-Length",
];

/// Case-insensitive check against [`HOP_BY_HOP_HEADERS`].
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Drops every hop-by-hop header, keeping all values of the others.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|name, _| !is_hop_by_hop(name));
}

/// Canonical MIME form of a header name: `x-forwarded-for` → `X-Forwarded-For`.
///
/// Names containing characters outside the token alphabet are returned as-is.
pub fn canonical_header_name(name: &str) -> String {
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
    {
        return name.to_string();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c.to_ascii_lowercase());
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("te"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("X-A"));
    }

    #[test]
    fn test_strip_keeps_duplicates_of_others() {
        let mut headers = Headers::new();
        headers.insert("Keep-Alive".into(), vec!["timeout=5".into()]);
        headers.insert("Set-Cookie".into(), vec!["a=1".into(), "b=2".into()]);
        headers.insert("Upgrade".into(), vec!["websocket".into()]);
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["Set-Cookie"], vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("x-a"), "X-A");
        assert_eq!(canonical_header_name("content-TYPE"), "Content-Type");
        assert_eq!(canonical_header_name("www-authenticate"), "Www-Authenticate");
        assert_eq!(canonical_header_name("bad header"), "bad header");
    }
}

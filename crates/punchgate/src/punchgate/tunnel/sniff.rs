use regex::bytes::Regex;

use crate::punchgate::ids::PeerId;

/// Finds `<peer>.<suffix>` host names in the first bytes of a backend connection.
///
/// Only works when the authority travels in cleartext near the start of the
/// stream: an HTTP/1 `Host:` header, a TLS SNI, or similar.
#[derive(Debug, Clone)]
pub struct VirtualHostSniffer {
    re: Regex,
}

impl VirtualHostSniffer {
    pub fn new(domain_suffix: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"(?i-u)([a-z0-9][a-z0-9_-]*)\.{}\b",
            regex::escape(domain_suffix)
        );
        Ok(Self {
            re: Regex::new(&pattern)?,
        })
    }

    /// Every candidate peer token, in stream order.
    pub fn candidates<'a>(&'a self, buf: &'a [u8]) -> impl Iterator<Item = &'a str> + 'a {
        self.re
            .captures_iter(buf)
            .filter_map(|c| c.get(1))
            .filter_map(|m| std::str::from_utf8(m.as_bytes()).ok())
    }

    /// First candidate for which `is_live` holds.
    ///
    /// Host names are case-insensitive, so tokens are lowercased before the
    /// lookup; peer ids are expected in lowercase.
    pub fn find_peer(&self, buf: &[u8], is_live: impl Fn(&str) -> bool) -> Option<PeerId> {
        self.candidates(buf)
            .map(str::to_ascii_lowercase)
            .find(|token| is_live(token.as_str()))
            .map(PeerId::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_host_header_peer() {
        let s = VirtualHostSniffer::new("peer").unwrap();
        let req = b"GET / HTTP/1.1\r\nHost: alice.peer:8080\r\nAccept: */*\r\n\r\n";
        assert_eq!(s.candidates(req).collect::<Vec<_>>(), vec!["alice"]);
        assert_eq!(s.find_peer(req, |_| true), Some(PeerId::from("alice")));
    }

    #[test]
    fn first_live_candidate_wins() {
        let s = VirtualHostSniffer::new("peer").unwrap();
        let req = b"GET http://ghost.peer/ HTTP/1.1\r\nHost: www.bob.peer\r\n\r\n";
        assert_eq!(s.candidates(req).collect::<Vec<_>>(), vec!["ghost", "bob"]);
        assert_eq!(s.find_peer(req, |t| t == "bob"), Some(PeerId::from("bob")));
        assert_eq!(s.find_peer(req, |_| false), None);
    }

    #[test]
    fn suffix_is_literal_and_bounded() {
        let s = VirtualHostSniffer::new("p2p.example").unwrap();
        assert_eq!(s.candidates(b"Host: bob.p2pxexample").count(), 0);
        assert_eq!(s.candidates(b"Host: bob.p2p.examples").count(), 0);
        assert_eq!(
            s.candidates(b"Host: Bob-1.P2P.example\r\n").collect::<Vec<_>>(),
            vec!["Bob-1"]
        );
    }

    #[test]
    fn mixed_case_host_routes_to_lowercase_peer() {
        let s = VirtualHostSniffer::new("peer").unwrap();
        let req = b"GET / HTTP/1.1\r\nHost: Bob.PEER\r\n\r\n";
        assert_eq!(s.find_peer(req, |t| t == "bob"), Some(PeerId::from("bob")));

        let s = VirtualHostSniffer::new("p2p.example").unwrap();
        assert_eq!(
            s.find_peer(b"Host: Bob-1.P2P.example\r\n", |t| t == "bob-1"),
            Some(PeerId::from("bob-1"))
        );
    }

    #[test]
    fn tolerates_binary_prelude() {
        let s = VirtualHostSniffer::new("peer").unwrap();
        let mut hello = vec![0x16, 0x03, 0x01, 0x00, 0xff, 0x00];
        hello.extend_from_slice(b"carol.peer");
        hello.extend_from_slice(&[0x00, 0x17, 0xff]);
        assert_eq!(s.find_peer(&hello, |_| true), Some(PeerId::from("carol")));
    }
}

//! SSRF guard for outbound JWKS fetches.
//!
//! An attacker controls the `Signature-Agent` value, so every address the
//! fetcher would connect to must be screened: loopback, RFC 1918, link-local,
//! CGN, and the IPv6 vectors that smuggle such addresses (IPv4-mapped,
//! IPv4-compatible, 6to4, Teredo). The fetcher resolves DNS once, screens
//! every resolved address with [`is_blocked_addr`], and pins the survivors
//! for the connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether connecting to `addr` must be refused.
#[must_use]
pub fn is_blocked_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => blocked_v6(v6),
    }
}

/// Whether `host` is an IP literal (optionally `[…]`-bracketed) in a blocked
/// range. Hostnames return `false`; they are screened after resolution.
#[must_use]
pub fn host_is_blocked_literal(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.parse::<IpAddr>().is_ok_and(is_blocked_addr)
}

fn blocked_v4(addr: Ipv4Addr) -> bool {
    addr.is_loopback()          // 127.0.0.0/8
        || addr.is_private()    // 10/8, 172.16/12, 192.168/16
        || addr.is_link_local() // 169.254/16
        || addr.is_broadcast()
        || addr.is_unspecified()
        || shared_range(addr)   // 100.64/10
        || test_net(addr)
}

/// 100.64.0.0/10, carrier-grade NAT.
fn shared_range(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 100 && (o[1] & 0xC0) == 64
}

/// TEST-NET-1/2/3 documentation ranges.
fn test_net(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)
}

#[allow(clippy::cast_possible_truncation)] // u16 segments carry embedded u8 octets
fn blocked_v6(addr: Ipv6Addr) -> bool {
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }

    let seg = addr.segments();

    // fe80::/10 link-local
    if seg[0] & 0xFFC0 == 0xFE80 {
        return true;
    }
    // fc00::/7 unique local
    if seg[0] & 0xFE00 == 0xFC00 {
        return true;
    }

    // ::ffff:x.x.x.x — the classic bypass for IPv4-only filters
    if let Some(v4) = addr.to_ipv4_mapped() {
        return blocked_v4(v4);
    }

    // Deprecated IPv4-compatible form ::x.x.x.x
    if seg[..6] == [0, 0, 0, 0, 0, 0] && (seg[6] != 0 || seg[7] > 1) {
        return blocked_v4(Ipv4Addr::new(
            (seg[6] >> 8) as u8,
            seg[6] as u8,
            (seg[7] >> 8) as u8,
            seg[7] as u8,
        ));
    }

    // 6to4 (2002::/16) embeds an IPv4 address in segments 1-2
    if seg[0] == 0x2002 {
        return blocked_v4(Ipv4Addr::new(
            (seg[1] >> 8) as u8,
            seg[1] as u8,
            (seg[2] >> 8) as u8,
            seg[2] as u8,
        ));
    }

    // Teredo (2001:0::/32) embeds the client IPv4 XORed with 0xFFFF
    if seg[0] == 0x2001 && seg[1] == 0 {
        return blocked_v4(Ipv4Addr::new(
            (seg[6] >> 8) as u8 ^ 0xFF,
            seg[6] as u8 ^ 0xFF,
            (seg[7] >> 8) as u8 ^ 0xFF,
            seg[7] as u8 ^ 0xFF,
        ));
    }

    false
}

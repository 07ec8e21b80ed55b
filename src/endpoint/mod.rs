pub mod endpoint;
pub mod selector;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The IP family of a concrete endpoint address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IpFamily {
    V4,
    V6Pure,
    /// An IPv6 address that embeds an IPv4 address, either IPv4-mapped (`::ffff:a.b.c.d`) or
    ///  in the NAT64 well-known prefix `64:ff9b::/96`
    V6Nat64,
}

impl IpFamily {
    pub fn of(addr: &SocketAddr) -> IpFamily {
        match addr.ip() {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(ip) => {
                if embedded_ipv4(&ip).is_some() {
                    IpFamily::V6Nat64
                }
                else {
                    IpFamily::V6Pure
                }
            }
        }
    }
}

/// The family criterion a caller selects or counts endpoints by.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FamilyFilter {
    V4,
    V6Pure,
    V6Nat64,
    /// both kinds of IPv6 endpoints
    V6Combined,
    Any,
}

impl FamilyFilter {
    pub fn matches(&self, family: IpFamily) -> bool {
        match self {
            FamilyFilter::V4 => family == IpFamily::V4,
            FamilyFilter::V6Pure => family == IpFamily::V6Pure,
            FamilyFilter::V6Nat64 => family == IpFamily::V6Nat64,
            FamilyFilter::V6Combined => family != IpFamily::V4,
            FamilyFilter::Any => true,
        }
    }
}

/// The flavor of wire path an endpoint supports. Endpoints of different variants are never
///  substituted for each other, even if they share a network address.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum TransportVariant {
    Plain = 0,
    EncryptedUdp = 1,
    TcpTls = 2,
}

/// Where an endpoint address came from. The order of the variants is the display priority,
///  highest first - selection does not depend on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EndpointSource {
    Hardcoded,
    Dns,
    Discovery,
}

const NAT64_WELL_KNOWN_PREFIX: [u16; 6] = [0x64, 0xff9b, 0, 0, 0, 0];

fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }

    let segments = ip.segments();
    if segments[..6] == NAT64_WELL_KNOWN_PREFIX {
        let bits = ip.to_bits() as u32;
        return Some(Ipv4Addr::from(bits));
    }
    None
}

/// The companion address admitted alongside a new endpoint for dual-stack networks: the
///  IPv6-mapped form of an IPv4 address, or the embedded IPv4 address of a NAT64-compatible IPv6
///  address. Pure IPv6 addresses have no twin.
pub fn synthesized_twin(addr: &SocketAddr) -> Option<SocketAddr> {
    match addr {
        SocketAddr::V4(a) => {
            Some(SocketAddr::V6(SocketAddrV6::new(a.ip().to_ipv6_mapped(), a.port(), 0, 0)))
        }
        SocketAddr::V6(a) => {
            embedded_ipv4(a.ip())
                .map(|v4| SocketAddr::V4(SocketAddrV4::new(v4, a.port())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case::v4("1.2.3.4:9700", IpFamily::V4)]
    #[case::mapped("[::ffff:1.2.3.4]:9700", IpFamily::V6Nat64)]
    #[case::nat64_prefix("[64:ff9b::102:304]:9700", IpFamily::V6Nat64)]
    #[case::pure("[2001:db8::1]:9700", IpFamily::V6Pure)]
    #[case::loopback("[::1]:9700", IpFamily::V6Pure)]
    fn test_family_of(#[case] addr: &str, #[case] expected: IpFamily) {
        assert_eq!(IpFamily::of(&SocketAddr::from_str(addr).unwrap()), expected);
    }

    #[rstest]
    #[case::v4("1.2.3.4:9700", Some("[::ffff:1.2.3.4]:9700"))]
    #[case::mapped("[::ffff:1.2.3.4]:9700", Some("1.2.3.4:9700"))]
    #[case::nat64_prefix("[64:ff9b::102:304]:80", Some("1.2.3.4:80"))]
    #[case::pure("[2001:db8::1]:9700", None)]
    fn test_synthesized_twin(#[case] addr: &str, #[case] expected: Option<&str>) {
        let expected = expected.map(|s| SocketAddr::from_str(s).unwrap());
        assert_eq!(synthesized_twin(&SocketAddr::from_str(addr).unwrap()), expected);
    }

    #[rstest]
    #[case::v4(FamilyFilter::V4, [true, false, false])]
    #[case::v6_pure(FamilyFilter::V6Pure, [false, true, false])]
    #[case::v6_nat64(FamilyFilter::V6Nat64, [false, false, true])]
    #[case::v6_combined(FamilyFilter::V6Combined, [false, true, true])]
    #[case::any(FamilyFilter::Any, [true, true, true])]
    fn test_family_filter(#[case] filter: FamilyFilter, #[case] expected: [bool; 3]) {
        let actual = [IpFamily::V4, IpFamily::V6Pure, IpFamily::V6Nat64]
            .map(|f| filter.matches(f));
        assert_eq!(actual, expected);
    }
}

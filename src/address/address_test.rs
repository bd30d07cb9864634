use super::*;
use crate::error::{Error, Result};

use std::net::{IpAddr, Ipv4Addr};

#[test]
fn test_internet_address_parse_print_round_trip() -> Result<()> {
    let cases = [
        "127.0.0.1:4711",
        "[::1]:4711",
        "[2001:db8::17]:80",
        "[::ffff:192.0.2.1]:9",
    ];
    for s in cases {
        let a = InternetAddress::parse(s, 0)?;
        let printed = a.address_string(PF_ADDRESS);
        let b = InternetAddress::parse(&printed, 0)?;
        assert_eq!(a, b, "round trip failed for {s} via {printed}");
    }
    Ok(())
}

#[test]
fn test_internet_address_legacy_round_trip() -> Result<()> {
    let a = InternetAddress::parse("192.168.1.1", 1234)?;
    let printed = a.address_string(PF_ADDRESS | PF_LEGACY);
    assert_eq!(printed, "192.168.1.1:1234");
    let b = InternetAddress::parse(&printed, 0)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_v4_mapped_comparison_is_family_agnostic() -> Result<()> {
    let plain = InternetAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7);
    let mapped = InternetAddress::parse("::ffff:10.0.0.1", 7)?;
    assert_eq!(plain, mapped, "mapped and plain v4 should compare equal");
    assert_eq!(plain.family(), libc::AF_INET);
    Ok(())
}

#[test]
fn test_port_changes_inequality() -> Result<()> {
    let a = InternetAddress::parse("10.0.0.1", 7)?;
    let b = InternetAddress::parse("10.0.0.1", 8)?;
    assert_ne!(a, b);
    Ok(())
}

#[test]
fn test_system_sockaddr_round_trip_v4() -> Result<()> {
    let a = InternetAddress::parse("192.0.2.99", 8080)?;
    let (storage, len) = a.to_system()?;
    assert_eq!(
        len as usize,
        std::mem::size_of::<libc::sockaddr_in>(),
        "v4 should marshal as sockaddr_in"
    );
    let b = InternetAddress::from_system(&storage)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_system_sockaddr_round_trip_v6_with_flowinfo() -> Result<()> {
    let mut a = InternetAddress::parse("2001:db8::1", 443)?;
    a.set_flow_label(0x12345);
    a.set_traffic_class(0x2e);
    let (storage, _) = a.to_system()?;
    let b = InternetAddress::from_system(&storage)?;
    assert_eq!(a, b);
    assert_eq!(b.flow_label(), 0x12345);
    assert_eq!(b.traffic_class(), 0x2e);
    Ok(())
}

#[test]
fn test_flow_label_is_masked_to_20_bits() -> Result<()> {
    let mut a = InternetAddress::parse("::1", 0)?;
    a.set_flow_label(0xfff_ffff);
    assert_eq!(a.flow_label(), 0xf_ffff);
    Ok(())
}

#[test]
fn test_unix_address() -> Result<()> {
    let a = SocketAddress::parse("/tmp/test.sock", 0)?;
    assert_eq!(a.family(), libc::AF_UNIX);
    assert_eq!(a.address_string(PF_ADDRESS), "/tmp/test.sock");
    let (storage, _) = a.to_system()?;
    let b = SocketAddress::from_system(&storage)?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_unix_address_too_long() {
    let long = "/".repeat(200);
    assert_eq!(UnixAddress::new(&long), Err(Error::ErrNameTooLong));
}

#[test]
fn test_packet_address_validity() {
    assert!(PacketAddress::new("eth0").is_valid());
    assert!(!PacketAddress::new("").is_valid());
}

#[test]
fn test_null_internet_address_is_invalid() {
    let a = InternetAddress::any(0);
    assert!(!a.is_valid());
    assert!(InternetAddress::any(1).is_valid());
}

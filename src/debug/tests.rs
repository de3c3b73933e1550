use super::{hexdump, DebugFlags};

#[test]
fn test_parse_keys() {
    let flags = DebugFlags::parse("authentication, transport");
    assert!(flags & DebugFlags::AUTHENTICATION);
    assert!(flags & DebugFlags::TRANSPORT);
    assert!(!(flags & DebugFlags::MESSAGE));

    let flags = DebugFlags::parse("Signal:proxy;unknown");
    assert_eq!(flags, DebugFlags::SIGNAL | DebugFlags::PROXY);
}

#[test]
fn test_payload_implies_message() {
    let flags = DebugFlags::parse("payload");
    assert!(flags.contains(DebugFlags::PAYLOAD | DebugFlags::MESSAGE));
}

#[test]
fn test_all() {
    let flags = DebugFlags::parse("all");
    assert_eq!(flags, DebugFlags::all());
    assert!(flags & DebugFlags::EMISSION);
    assert!(DebugFlags::parse("").is_empty());
}

#[test]
fn test_hexdump() {
    let data = (0u8..20).collect::<Vec<_>>();
    let dump = hexdump(&data, 0);
    let lines = dump.lines().collect::<Vec<_>>();

    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0000: 00 01 02 03  04 05 06 07  08 09 0a 0b  0c 0d 0e 0f "));
    assert!(lines[0].ends_with("   ................"));
    assert!(lines[1].starts_with("0010: 10 11 12 13 "));
}

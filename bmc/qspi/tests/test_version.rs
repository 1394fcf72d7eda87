// Licensed under the Apache-2.0 license

use qspi::{is_newer, VersionError, VersionTag};

const BLANK: [u8; 4] = [0xff; 4];

#[test]
fn test_is_newer_table() {
    let table: [(&[u8], &[u8], bool); 8] = [
        (b"v0.2", b"v0.3", true),
        (b"v0.3", b"v0.2", false),
        (b"v0.3", b"20170901", true),
        (b"20170901", b"v0.2", false),
        (b"20170901", b"20170902", true),
        (b"20170901", b"20170830", false),
        (&BLANK, b"20170830", true),
        (b"20170830", &BLANK, false),
    ];
    for (current, candidate, expected) in table {
        let current_tag = VersionTag::parse(current).unwrap();
        let candidate_tag = VersionTag::parse(candidate).unwrap();
        assert_eq!(
            is_newer(&current_tag, &candidate_tag).unwrap(),
            expected,
            "{current_tag} -> {candidate_tag}"
        );
    }
}

#[test]
fn test_dev_bypasses_ordering() {
    let dev = VersionTag::from_version_blob(b"dev\xff\xff\xff\xff\xff").unwrap();
    assert_eq!(dev, VersionTag::Dev);
    assert_eq!(
        is_newer(&dev, &VersionTag::LegacyNumeric(9, 9)),
        Err(VersionError::Incomparable)
    );
}

#[test]
fn test_blank_partition_blob() {
    let blob = vec![0xffu8; 0x40000];
    assert_eq!(
        VersionTag::from_version_blob(&blob).unwrap(),
        VersionTag::Blank
    );
}

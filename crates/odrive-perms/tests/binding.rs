//! Share/revoke and tamper scenarios over persisted rows.

use odrive_core::{Flags, Identity, ObjectId, PermissionRow};
use odrive_crypto::{generate_key, KeyRing, MasterKey};
use odrive_perms::{authorize, grant, seal_row, update_flags, verify_row, PermError};
use proptest::prelude::*;

fn ring() -> KeyRing {
    KeyRing::new(MasterKey::from_bytes([0x42; 32]))
}

#[test]
fn share_then_flip_read_flag() {
    let ring = ring();
    let key = generate_key();
    let id = ObjectId::random();
    let alice = Identity::new("cn=alice");
    let bob = Identity::new("cn=bob");

    let mut rows = vec![seal_row(ring.current(), id, alice.dn(), Flags::ALL, &key).unwrap()];
    rows.push(grant(&ring, &rows, &alice, bob.dn(), Flags::READ).unwrap());
    assert_eq!(authorize(&ring, &rows, &bob, Flags::READ).unwrap(), key);

    // Administrator clears bob's read flag and re-MACs the row.
    rows[1] = update_flags(&ring, &rows[1], Flags::NONE).unwrap();
    assert!(matches!(
        authorize(&ring, &rows, &bob, Flags::READ),
        Err(PermError::Denied)
    ));
    assert_eq!(authorize(&ring, &rows, &alice, Flags::READ).unwrap(), key);
}

#[test]
fn flipping_a_flag_without_the_master_key_is_inert() {
    let ring = ring();
    let key = generate_key();
    let id = ObjectId::random();
    let alice = Identity::new("cn=alice");
    let bob = Identity::new("cn=bob");
    let mut rows = vec![seal_row(ring.current(), id, alice.dn(), Flags::ALL, &key).unwrap()];
    rows.push(grant(&ring, &rows, &alice, bob.dn(), Flags::READ).unwrap());

    // Bob edits his own row in the store to add update.
    rows[1].flags.u = true;
    assert!(authorize(&ring, &rows, &bob, Flags::UPDATE).is_err());
    assert!(authorize(&ring, &rows, &bob, Flags::READ).is_err());
}

#[test]
fn tampered_wrapped_key_only_affects_that_grantee() {
    let ring = ring();
    let key = generate_key();
    let id = ObjectId::random();
    let alice = Identity::new("cn=alice");
    let bob = Identity::new("cn=bob");
    let carol = Identity::new("cn=carol");
    let mut rows = vec![seal_row(ring.current(), id, alice.dn(), Flags::ALL, &key).unwrap()];
    rows.push(grant(&ring, &rows, &alice, bob.dn(), Flags::READ).unwrap());
    rows.push(grant(&ring, &rows, &alice, carol.dn(), Flags::READ).unwrap());

    // Round-trip through the wire format, corrupting one byte on the way.
    let mut json = serde_json::to_value(&rows[1]).unwrap();
    let hex = json["wrappedKey"].as_str().unwrap().to_string();
    let flipped = if hex.starts_with('0') { "1" } else { "0" };
    json["wrappedKey"] = format!("{flipped}{}", &hex[1..]).into();
    rows[1] = serde_json::from_value::<PermissionRow>(json).unwrap();

    assert!(authorize(&ring, &rows, &bob, Flags::READ).is_err());
    assert_eq!(authorize(&ring, &rows, &carol, Flags::READ).unwrap(), key);
    assert_eq!(authorize(&ring, &rows, &alice, Flags::READ).unwrap(), key);
}

#[derive(Debug, Clone)]
enum Tamper {
    Grantee(String),
    Flag(usize),
    WrappedByte(usize, u8),
}

fn tamper() -> impl Strategy<Value = Tamper> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|s| Tamper::Grantee(format!("cn={s}x"))),
        (0usize..5).prop_map(Tamper::Flag),
        (0usize..32, 1u8..=255).prop_map(|(i, x)| Tamper::WrappedByte(i, x)),
    ]
}

fn flip(flags: &mut Flags, i: usize) {
    let f = match i {
        0 => &mut flags.c,
        1 => &mut flags.r,
        2 => &mut flags.u,
        3 => &mut flags.d,
        _ => &mut flags.s,
    };
    *f = !*f;
}

proptest! {
    #[test]
    fn any_single_field_change_breaks_the_mac(
        master in any::<[u8; 32]>(),
        r in any::<bool>(),
        s in any::<bool>(),
        t in tamper(),
    ) {
        let master = MasterKey::from_bytes(master);
        let flags = Flags { r, s, ..Flags::NONE };
        let mut row = seal_row(&master, ObjectId::random(), "cn=grantee", flags, &generate_key()).unwrap();
        prop_assert!(verify_row(&master, &row));
        match t {
            Tamper::Grantee(g) => row.grantee = g,
            Tamper::Flag(i) => flip(&mut row.flags, i),
            Tamper::WrappedByte(i, x) => row.wrapped_key[i] ^= x,
        }
        prop_assert!(!verify_row(&master, &row));
    }
}

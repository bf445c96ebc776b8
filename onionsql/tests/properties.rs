//! Property tests for onion round trips and the capability algebra.

use std::sync::OnceLock;

use onionsql::capability::EncSet;
use onionsql::crypto::kdf;
use onionsql::prelude::*;
use onionsql::schema::{FieldRef, SchemaMetadata};
use proptest::prelude::*;

struct Fixture {
    schema: SchemaMetadata,
    number: FieldRef,
    text: FieldRef,
}

fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let master = kdf::generate_master_key();
        let mut schema = SchemaMetadata::new();
        schema.create_table("db", "t").expect("Failed to create table");
        let number = FieldRef::new("db", "t", "n");
        let text = FieldRef::new("db", "t", "s");
        for (field, sql_type) in [(&number, SqlType::Integer), (&text, SqlType::Text)] {
            let built = schema.build_field(field.clone(), sql_type, true, &master).expect("Failed to build field");
            schema.table_mut("db", "t").unwrap().create_field(built).expect("Failed to register field");
        }
        Fixture { schema, number, text }
    })
}

fn round_trip(field: &FieldRef, value: &Value, salt: u64) {
    let meta = fixture().schema.field(field).expect("Unknown field");
    for (onion, om) in meta.onions() {
        for level in onion.chain() {
            let ct = om.encrypt_to(value, *level, salt).expect("Encryption failed");
            if *level != SecLevel::PlainVal {
                assert_ne!(&ct, value, "{onion}@{level} left the value readable");
            }
            let pt = om.decrypt_from(&ct, *level, salt).expect("Decryption failed");
            assert_eq!(&pt, value, "{onion}@{level}");
        }
    }
}

const LEVELS: [SecLevel; 8] = [
    SecLevel::PlainVal,
    SecLevel::OpeJoin,
    SecLevel::Ope,
    SecLevel::DetJoin,
    SecLevel::Det,
    SecLevel::Search,
    SecLevel::Hom,
    SecLevel::Rnd,
];

fn level() -> impl Strategy<Value = SecLevel> {
    (0..LEVELS.len()).prop_map(|i| LEVELS[i])
}

/// Sets bound to one of a small pool of fields, so that conflicting
/// bindings occur often between generated sets.
fn enc_set() -> impl Strategy<Value = EncSet> {
    (prop::collection::vec((any::<bool>(), level(), level()), Onion::PRECEDENCE.len()), 0..3usize).prop_map(
        |(entries, binding)| {
            let mut set = EncSet::empty();
            for (onion, (present, floor, ceiling)) in Onion::PRECEDENCE.into_iter().zip(entries) {
                if present {
                    set = set.with(onion, floor.min(ceiling), ceiling);
                }
            }
            let fields = [FieldRef::new("db", "t", "a"), FieldRef::new("db", "t", "b")];
            match fields.get(binding) {
                Some(field) => set.bound_to(field),
                None => set,
            }
        },
    )
}

proptest! {
    #[test]
    fn integers_survive_every_level(v in any::<i64>(), salt in any::<u64>()) {
        round_trip(&fixture().number, &Value::Integer(v), salt);
    }

    #[test]
    fn text_survives_every_level(s in "[a-z0-9 ]{0,40}", salt in any::<u64>()) {
        round_trip(&fixture().text, &Value::Text(s), salt);
    }

    #[test]
    fn intersect_is_commutative(a in enc_set(), b in enc_set()) {
        prop_assert_eq!(a.intersect(&b), b.intersect(&a));
    }

    #[test]
    fn intersect_is_associative(a in enc_set(), b in enc_set(), c in enc_set()) {
        prop_assert_eq!(a.intersect(&b).intersect(&c), a.intersect(&b.intersect(&c)));
    }

    #[test]
    fn intersect_is_idempotent(a in enc_set()) {
        prop_assert_eq!(a.intersect(&a), a);
    }

    #[test]
    fn choose_one_picks_a_member_at_its_ceiling(a in enc_set()) {
        if let Ok(olk) = a.choose_one() {
            let range = a.get(olk.onion).expect("chosen onion must be in the set");
            prop_assert_eq!(olk.level, range.ceiling);
            prop_assert_eq!(&olk.field, &range.field);
            prop_assert_eq!(a.choose_one().ok(), Some(olk));
        }
    }
}
